//! Stress tests for the background batch loader
//!
//! Tests ordering under uneven sample latency, per-batch failure isolation,
//! shutdown with batches still in flight and context-wide teardown.

use medflow_core::data::LoaderConfig;
use medflow_core::ops::{OpContext, OpLambda};
use medflow_core::runtime::{PipelineRuntime, RuntimeConfig};
use medflow_core::sample::SAMPLE_ID_KEY;
use medflow_core::{
    Collate, Context, DataLoader, Dataset, MedflowConfig, MedflowError, NdArray, Pipeline,
    SampleDict, Value,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn runtime() -> PipelineRuntime {
    PipelineRuntime::new(RuntimeConfig {
        io_threads: 2,
        compute_threads: 4,
    })
    .unwrap()
}

fn ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("s_{i:03}")).collect()
}

/// Static stage stores an image; the dynamic stage sleeps longer for
/// earlier samples so completion order is reversed within a window
fn dataset(runtime: &PipelineRuntime, n: usize, fail_id: Option<&'static str>) -> Arc<Dataset> {
    let static_pipeline = Pipeline::empty("static").then(OpLambda::new(
        "volume",
        1,
        |mut s: SampleDict, _: &OpContext| {
            s.set("data.input.img", NdArray::zeros(vec![4, 4]))?;
            Ok(s)
        },
    ));
    let dynamic = Pipeline::empty("dynamic").then(OpLambda::new(
        "slow",
        1,
        move |s: SampleDict, _: &OpContext| {
            let index: u64 = s.sample_id()[2..].parse().unwrap_or(0);
            std::thread::sleep(Duration::from_millis(8 - index % 8));
            if Some(s.sample_id()) == fail_id {
                return Err(MedflowError::Internal {
                    message: "synthetic failure".into(),
                });
            }
            Ok(s)
        },
    ));

    let dataset = Dataset::new(
        ids(n),
        Arc::new(static_pipeline),
        Some(Arc::new(dynamic)),
        None,
    )
    .unwrap();
    runtime.block_on(dataset.create(runtime)).unwrap();
    Arc::new(dataset)
}

fn sequential(n: usize, batch_size: usize) -> Vec<Vec<usize>> {
    (0..n)
        .collect::<Vec<_>>()
        .chunks(batch_size)
        .map(<[usize]>::to_vec)
        .collect()
}

fn batch_ids(batch: &SampleDict) -> Vec<String> {
    match batch.get(SAMPLE_ID_KEY) {
        Some(Value::List(ids)) => ids.iter().map(|v| v.to_string()).collect(),
        other => panic!("expected id list, got {other:?}"),
    }
}

#[test]
fn test_batches_arrive_in_sampler_order() {
    let rt = runtime();
    let ds = dataset(&rt, 64, None);
    let config = LoaderConfig {
        prefetch_batches: 4,
        num_workers: 8,
        channel_size: 2,
    };
    let mut loader = DataLoader::new(&rt, Arc::clone(&ds), sequential(64, 8), Collate::default(), config)
        .unwrap();

    let mut seen = Vec::new();
    while let Some(batch) = loader.blocking_next() {
        let batch = batch.unwrap();
        assert_eq!(batch.array("data.input.img").unwrap().shape(), &[8, 4, 4]);
        seen.extend(batch_ids(&batch));
    }

    assert_eq!(seen, ids(64));
    assert_eq!(loader.batches_loaded(), 8);
    assert_eq!(ds.metrics().batches_collated.get(), 8);

    rt.block_on(loader.shutdown());
    rt.shutdown();
}

#[test]
fn test_failing_sample_fails_only_its_batch() {
    let rt = runtime();
    let ds = dataset(&rt, 20, Some("s_006"));
    let mut loader =
        DataLoader::new(&rt, ds, sequential(20, 4), Collate::default(), LoaderConfig::default())
            .unwrap();

    let mut outcomes = Vec::new();
    while let Some(batch) = loader.blocking_next() {
        outcomes.push(batch);
    }

    assert_eq!(outcomes.len(), 5);
    for (position, outcome) in outcomes.iter().enumerate() {
        if position == 1 {
            let err = outcome.as_ref().unwrap_err();
            match err {
                MedflowError::Op { sample_id, .. } => assert_eq!(sample_id, "s_006"),
                other => panic!("unexpected error {other:?}"),
            }
        } else {
            assert!(outcome.is_ok(), "batch {position} failed: {outcome:?}");
        }
    }

    rt.block_on(loader.shutdown());
    rt.shutdown();
}

#[test]
fn test_shutdown_with_batches_in_flight() {
    let rt = runtime();
    let ds = dataset(&rt, 200, None);
    let mut loader = DataLoader::new(
        &rt,
        ds,
        sequential(200, 4),
        Collate::default(),
        LoaderConfig {
            prefetch_batches: 8,
            num_workers: 4,
            channel_size: 4,
        },
    )
    .unwrap();

    for _ in 0..3 {
        loader.blocking_next().unwrap().unwrap();
    }
    assert_eq!(loader.num_batches(), 50);

    let start = Instant::now();
    rt.block_on(loader.shutdown());
    assert!(start.elapsed() < Duration::from_secs(5));
    rt.shutdown();
}

#[test]
fn test_dropped_loader_does_not_hang() {
    let rt = runtime();
    let ds = dataset(&rt, 32, None);
    let loader =
        DataLoader::new(&rt, ds, sequential(32, 4), Collate::default(), LoaderConfig::default())
            .unwrap();
    drop(loader);
    rt.shutdown();
}

#[test]
fn test_loader_rejects_bad_setup() {
    let rt = runtime();
    let pipeline = Arc::new(Pipeline::empty("static"));
    let fresh = Arc::new(Dataset::new(ids(4), pipeline, None, None).unwrap());

    let err = DataLoader::new(
        &rt,
        Arc::clone(&fresh),
        sequential(4, 2),
        Collate::default(),
        LoaderConfig::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, MedflowError::NotCreated));

    rt.block_on(fresh.create(&rt)).unwrap();
    let err = DataLoader::new(
        &rt,
        fresh,
        sequential(4, 2),
        Collate::default(),
        LoaderConfig {
            channel_size: 0,
            ..Default::default()
        },
    )
    .err()
    .unwrap();
    assert!(matches!(err, MedflowError::InvalidConfig { .. }));
    rt.shutdown();
}

#[test]
fn test_context_shutdown_stops_its_loaders() {
    let cache = tempfile::tempdir().unwrap();
    let ctx = Context::init(MedflowConfig {
        cache_dir: cache.path().to_path_buf(),
        loader_workers: 4,
        batch_size: 4,
        io_threads: 2,
        compute_threads: 4,
        ..Default::default()
    })
    .unwrap();
    let ds = dataset(ctx.runtime(), 200, None);
    let batch_size = ctx.config().sampler().batch_size;
    let mut loader = ctx
        .loader(ds, sequential(200, batch_size), Collate::default())
        .unwrap();

    for _ in 0..2 {
        loader.blocking_next().unwrap().unwrap();
    }
    ctx.shutdown_signal().shutdown();

    // Only batches already buffered in the channel are still delivered
    let mut drained = 0;
    while let Some(batch) = loader.blocking_next() {
        batch.unwrap();
        drained += 1;
    }
    assert!(drained <= ctx.config().loader().channel_size, "drained {drained}");
    assert!(loader.batches_loaded() < 50);

    ctx.runtime().block_on(loader.shutdown());
    ctx.shutdown();
}
