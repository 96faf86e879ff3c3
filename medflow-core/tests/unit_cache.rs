//! Unit tests for the sample cache
//!
//! Covers hit/miss behavior, fingerprint invalidation, restart, corrupt
//! entry fallback, concurrent population and shutdown.

use medflow_core::cache::{CacheManifest, CacherConfig, SamplesCacher};
use medflow_core::ops::npy::encode_npy;
use medflow_core::ops::{OpContext, OpLambda, OpLoadImage, OpNormalize};
use medflow_core::runtime::{PipelineRuntime, RuntimeConfig, ShutdownSignal};
use medflow_core::{Dataset, MedflowError, NdArray, Pipeline, SampleDict};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> PipelineRuntime {
    PipelineRuntime::new(RuntimeConfig {
        io_threads: 1,
        compute_threads: 2,
    })
    .unwrap()
}

fn write_volume(dir: &Path, id: &str, values: Vec<f32>) {
    let array = NdArray::from_f32(vec![2, values.len() / 2], values).unwrap();
    std::fs::write(dir.join(format!("{id}.npy")), encode_npy(&array)).unwrap();
}

/// `[id -> path, LoadImage(path -> img), Normalize(img)]`
fn image_pipeline(data_dir: &Path, normalize: OpNormalize) -> Arc<Pipeline> {
    Arc::new(
        Pipeline::empty("static")
            .then(OpLambda::new("id_to_path", 1, |mut s: SampleDict, _: &OpContext| {
                let path = format!("{}.npy", s.sample_id());
                s.set("data.input.path", path)?;
                Ok(s)
            }))
            .then(OpLoadImage::new(data_dir, "data.input.path", "data.input.img"))
            .then(normalize),
    )
}

fn bits(sample: &SampleDict) -> Vec<u32> {
    sample
        .array("data.input.img")
        .unwrap()
        .as_f32()
        .unwrap()
        .iter()
        .map(|x| x.to_bits())
        .collect()
}

fn ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("case_{i:03}")).collect()
}

struct Fixture {
    data: tempfile::TempDir,
    cache: tempfile::TempDir,
}

impl Fixture {
    fn new(n: usize) -> Self {
        let data = tempfile::tempdir().unwrap();
        for (i, id) in ids(n).iter().enumerate() {
            let base = i as f32;
            write_volume(data.path(), id, vec![base, base + 5.0, base + 10.0, base + 20.0]);
        }
        Self {
            data,
            cache: tempfile::tempdir().unwrap(),
        }
    }

    fn cacher(&self, name: &str, config: CacherConfig) -> Arc<SamplesCacher> {
        let pipeline = image_pipeline(self.data.path(), OpNormalize::new("data.input.img"));
        Arc::new(SamplesCacher::new(name, pipeline, self.cache.path(), config).unwrap())
    }
}

#[test]
fn test_load_normalize_then_cached_copy_is_byte_identical() {
    let fx = Fixture::new(0);
    write_volume(fx.data.path(), "sample_1", vec![0.0, 5.0, 10.0, 20.0]);
    let cacher = fx.cacher("scenario", CacherConfig::default());

    let first = cacher.load("sample_1").unwrap();
    let img = first.array("data.input.img").unwrap();
    assert_eq!(img.shape(), &[2, 2]);
    assert_eq!(img.as_f32().unwrap(), &[0.0, 0.25, 0.5, 1.0]);

    let second = cacher.load("sample_1").unwrap();
    assert_eq!(bits(&first), bits(&second));
    assert_eq!(first, second);

    // A new cacher over the same directory sees the same entry
    let reopened = fx.cacher("scenario", CacherConfig::default());
    let third = reopened.load("sample_1").unwrap();
    assert_eq!(bits(&first), bits(&third));
    assert_eq!(reopened.stats().misses, 0);
    assert_eq!(reopened.stats().hits, 1);
}

#[test]
fn test_create_is_idempotent() {
    let fx = Fixture::new(6);
    let cacher = fx.cacher("idempotent", CacherConfig::default());
    let pipeline = Arc::clone(cacher.pipeline());
    let dataset = Dataset::new(ids(6), pipeline, None, Some(cacher)).unwrap();
    let rt = runtime();

    let first = rt.block_on(dataset.create(&rt)).unwrap();
    assert_eq!(first.computed, 6);
    assert!(first.is_complete());

    let second = rt.block_on(dataset.create(&rt)).unwrap();
    assert_eq!(second.computed, 0);
    assert_eq!(second.hits, 6);

    let sample = dataset.get(3).unwrap();
    assert_eq!(sample.sample_id(), "case_003");
    rt.shutdown();
}

#[test]
fn test_changed_parameter_invalidates_cache() {
    let fx = Fixture::new(1);
    let a = fx.cacher("fp", CacherConfig::default());
    let b = Arc::new(
        SamplesCacher::new(
            "fp",
            image_pipeline(
                fx.data.path(),
                OpNormalize::new("data.input.img").with_range(-1.0, 1.0),
            ),
            fx.cache.path(),
            CacherConfig::default(),
        )
        .unwrap(),
    );

    assert_ne!(a.fingerprint(), b.fingerprint());
    assert_ne!(a.fingerprint_dir(), b.fingerprint_dir());

    let from_a = a.load("case_000").unwrap();
    let from_b = b.load("case_000").unwrap();
    assert_eq!(b.stats().misses, 1, "stale entry must not be reused");
    assert_ne!(bits(&from_a), bits(&from_b));
    assert_eq!(from_b.array("data.input.img").unwrap().as_f32().unwrap()[0], -1.0);
}

#[test]
fn test_restart_recomputes_once() {
    let fx = Fixture::new(4);
    let rt = runtime();

    let warm = fx.cacher("restart", CacherConfig::default());
    let report = rt.block_on(warm.cache_samples(&rt, &ids(4))).unwrap();
    assert_eq!(report.computed, 4);

    let restarting = fx.cacher(
        "restart",
        CacherConfig {
            restart_cache: true,
            ..Default::default()
        },
    );
    let report = rt.block_on(restarting.cache_samples(&rt, &ids(4))).unwrap();
    assert_eq!((report.hits, report.computed), (0, 4));

    // Only the first population of a cacher deletes
    let report = rt.block_on(restarting.cache_samples(&rt, &ids(4))).unwrap();
    assert_eq!((report.hits, report.computed), (4, 0));
    rt.shutdown();
}

#[test]
fn test_corrupt_entry_falls_back_to_recompute() {
    let fx = Fixture::new(1);
    let original = fx.cacher("corrupt", CacherConfig::default()).load("case_000").unwrap();

    let cacher = fx.cacher("corrupt", CacherConfig::default());
    let path = cacher.entry_path("case_000");
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x5A;
    std::fs::write(&path, &bytes).unwrap();

    let recovered = cacher.load("case_000").unwrap();
    assert_eq!(recovered, original);
    let stats = cacher.stats();
    assert_eq!((stats.corrupt, stats.misses), (1, 1));

    // The rewritten entry is valid again
    cacher.load("case_000").unwrap();
    assert_eq!(cacher.stats().hits, 1);
}

#[test]
fn test_truncated_entry_falls_back_to_recompute() {
    let fx = Fixture::new(1);
    let cacher = fx.cacher("truncated", CacherConfig::default());
    let original = cacher.load("case_000").unwrap();

    let path = cacher.entry_path("case_000");
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 3]).unwrap();

    assert_eq!(cacher.load("case_000").unwrap(), original);
    assert_eq!(cacher.stats().corrupt, 1);
}

#[test]
fn test_damaged_manifest_is_rewritten() {
    let fx = Fixture::new(1);
    let original = fx.cacher("manifest", CacherConfig::default()).load("case_000").unwrap();

    let cacher = fx.cacher("manifest", CacherConfig::default());
    let manifest_path = CacheManifest::path_in(&cacher.fingerprint_dir());
    std::fs::write(&manifest_path, "{trunc").unwrap();

    // Entries survive a damaged manifest
    assert_eq!(cacher.load("case_000").unwrap(), original);
    let stats = cacher.stats();
    assert_eq!((stats.corrupt, stats.hits, stats.misses), (1, 1, 0));

    let json = std::fs::read_to_string(&manifest_path).unwrap();
    CacheManifest::from_json(&json)
        .unwrap()
        .validate("manifest", cacher.fingerprint())
        .unwrap();
}

#[test]
fn test_newer_manifest_is_left_alone() {
    let fx = Fixture::new(1);
    let cacher = fx.cacher("future", CacherConfig::default());
    cacher.load("case_000").unwrap();

    let manifest_path = CacheManifest::path_in(&cacher.fingerprint_dir());
    let json = std::fs::read_to_string(&manifest_path).unwrap();
    let mut manifest = CacheManifest::from_json(&json).unwrap();
    manifest.version = CacheManifest::CURRENT_VERSION + 1;
    let newer = serde_json::to_string(&manifest).unwrap();
    std::fs::write(&manifest_path, &newer).unwrap();

    let reopened = fx.cacher("future", CacherConfig::default());
    assert!(matches!(
        reopened.load("case_000"),
        Err(MedflowError::ManifestVersion { .. })
    ));
    assert_eq!(std::fs::read_to_string(&manifest_path).unwrap(), newer);
}

#[test]
fn test_concurrent_loads_compute_once() {
    let cache = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let pipeline = Arc::new(Pipeline::empty("static").then(OpLambda::new(
        "slow_counted",
        1,
        move |mut s: SampleDict, _: &OpContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            s.set("data.value", 42i64)?;
            Ok(s)
        },
    )));

    // Two cachers over the same directory exclude each other too
    let a = SamplesCacher::new("race", Arc::clone(&pipeline), cache.path(), CacherConfig::default())
        .unwrap();
    let b = SamplesCacher::new("race", pipeline, cache.path(), CacherConfig::default()).unwrap();

    std::thread::scope(|scope| {
        for i in 0..8 {
            let cacher = if i % 2 == 0 { &a } else { &b };
            scope.spawn(move || {
                let sample = cacher.load("shared").unwrap();
                assert_eq!(sample.int("data.value").unwrap(), 42);
            });
        }
    });

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failing_sample_does_not_stop_population() {
    let fx = Fixture::new(3);
    let cacher = fx.cacher("partial", CacherConfig::default());
    let rt = runtime();

    let mut wanted = ids(3);
    wanted.push("not_on_disk".to_string());
    let report = rt.block_on(cacher.cache_samples(&rt, &wanted)).unwrap();

    assert_eq!(report.computed, 3);
    assert_eq!(report.failures.len(), 1);
    let (id, err) = &report.failures[0];
    assert_eq!(id, "not_on_disk");
    match err {
        MedflowError::Op { op, sample_id, .. } => {
            assert_eq!(op, "OpLoadImage");
            assert_eq!(sample_id, "not_on_disk");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(matches!(err.root_cause(), MedflowError::Io { .. }));
    assert!(!cacher.is_cached("not_on_disk"));
    rt.shutdown();
}

#[test]
fn test_signalled_shutdown_stops_population() {
    let fx = Fixture::new(2);
    let signal = ShutdownSignal::new();
    let pipeline = image_pipeline(fx.data.path(), OpNormalize::new("data.input.img"));
    let cacher = Arc::new(
        SamplesCacher::new("stopped", pipeline, fx.cache.path(), CacherConfig::default())
            .unwrap()
            .with_shutdown(signal.clone()),
    );
    let rt = runtime();

    signal.shutdown();
    let result = rt.block_on(cacher.cache_samples(&rt, &ids(2)));
    assert!(matches!(result, Err(MedflowError::ShutdownInProgress)));
    assert!(!cacher.is_cached("case_000"));
    rt.shutdown();
}

#[test]
fn test_shutdown_during_population_stops_scheduling() {
    let cache = tempfile::tempdir().unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let pipeline = Arc::new(Pipeline::empty("static").then(OpLambda::new(
        "slow_counted",
        1,
        move |mut s: SampleDict, _: &OpContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            s.set("data.value", 1i64)?;
            Ok(s)
        },
    )));
    let signal = ShutdownSignal::new();
    let cacher = Arc::new(
        SamplesCacher::new(
            "interrupted",
            pipeline,
            cache.path(),
            CacherConfig {
                workers: 1,
                ..Default::default()
            },
        )
        .unwrap()
        .with_shutdown(signal.clone()),
    );
    let rt = runtime();

    let trigger = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(60));
        signal.shutdown();
    });
    let result = rt.block_on(cacher.cache_samples(&rt, &ids(50)));
    trigger.join().unwrap();

    assert!(matches!(result, Err(MedflowError::ShutdownInProgress)));
    assert!(runs.load(Ordering::SeqCst) < 50);
    rt.shutdown();
}
