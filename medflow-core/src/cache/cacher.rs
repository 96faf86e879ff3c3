//! Fingerprint-keyed disk cache of static pipeline output
//!
//! Entries live under `<root>/<name>/<fingerprint>/samples/`. A pipeline
//! change produces a new fingerprint and so a fresh directory; stale entries
//! are never read. Writes go to `pending/` first and are renamed into place,
//! so a reader either sees a complete entry or none.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::codec::{decode_entry, decode_entry_unverified, encode_entry};
use super::manifest::CacheManifest;
use crate::error::{MedflowError, Result};
use crate::metrics::PipelineMetrics;
use crate::pipeline::Pipeline;
use crate::runtime::{PipelineRuntime, ShutdownSignal};
use crate::sample::SampleDict;

/// File extension of cache entries
pub const ENTRY_SUFFIX: &str = "msc";

const MAX_STEM_LEN: usize = 64;

/// Configuration for a [`SamplesCacher`]
#[derive(Debug, Clone)]
pub struct CacherConfig {
    /// Delete every fingerprint directory of this cacher on first use
    pub restart_cache: bool,
    /// Samples cached concurrently by `cache_samples`
    pub workers: usize,
    /// Verify payload checksums on read
    pub verify_checksums: bool,
}

impl Default for CacherConfig {
    fn default() -> Self {
        Self {
            restart_cache: false,
            workers: num_cpus::get().max(1),
            verify_checksums: true,
        }
    }
}

/// Whether a sample was served from disk or computed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Hit,
    Computed,
}

/// Outcome of a bulk population
#[derive(Debug, Default)]
pub struct CacheReport {
    pub total: usize,
    pub hits: usize,
    pub computed: usize,
    /// Samples whose static pipeline failed; the rest were still cached
    pub failures: Vec<(String, MedflowError)>,
}

impl CacheReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for CacheReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "cached {} samples: {} hits, {} computed, {} failed",
            self.total,
            self.hits,
            self.computed,
            self.failures.len()
        )?;
        for (sample_id, error) in &self.failures {
            writeln!(f, "  {}: {}", sample_id, error)?;
        }
        Ok(())
    }
}

/// Snapshot of cacher counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub corrupt: u64,
    pub bytes_written: u64,
}

/// Result of looking for an entry on disk
enum Lookup {
    Found(SampleDict),
    Missing,
    Corrupt(MedflowError),
}

type OwnerKey = (PathBuf, String);

/// Per-key computation locks shared by every cacher in the process.
/// Keyed by fingerprint directory so two cachers over the same pipeline and
/// root also exclude each other.
static OWNERS: LazyLock<Mutex<HashMap<OwnerKey, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn acquire_owner(key: &OwnerKey) -> Arc<Mutex<()>> {
    OWNERS.lock().entry(key.clone()).or_default().clone()
}

fn release_owner(key: &OwnerKey, owner: Arc<Mutex<()>>) {
    let mut owners = OWNERS.lock();
    drop(owner);
    if owners.get(key).is_some_and(|o| Arc::strong_count(o) == 1) {
        owners.remove(key);
    }
}

/// Map a sample id to a file stem that is safe on every filesystem
fn sanitize(sample_id: &str) -> String {
    sample_id
        .chars()
        .take(MAX_STEM_LEN)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path).map_err(|e| MedflowError::io(path, e))?;
    file.write_all(bytes).map_err(|e| MedflowError::io(path, e))?;
    file.sync_all().map_err(|e| MedflowError::io(path, e))
}

/// Disk cache for the output of one static pipeline
pub struct SamplesCacher {
    name: String,
    pipeline: Arc<Pipeline>,
    root: PathBuf,
    fingerprint: String,
    config: CacherConfig,
    metrics: Arc<PipelineMetrics>,
    shutdown: ShutdownSignal,
    prepared: Mutex<bool>,
}

impl SamplesCacher {
    pub fn new(
        name: impl Into<String>,
        pipeline: Arc<Pipeline>,
        root: impl Into<PathBuf>,
        config: CacherConfig,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || sanitize(&name) != name {
            return Err(MedflowError::InvalidConfig {
                reason: format!("cacher name '{}' must match [A-Za-z0-9_-]+", name),
            });
        }
        if config.workers == 0 {
            return Err(MedflowError::InvalidConfig {
                reason: "cacher needs at least one worker".into(),
            });
        }

        let fingerprint = pipeline.fingerprint()?;
        Ok(Self {
            name,
            pipeline,
            root: root.into(),
            fingerprint,
            config,
            metrics: Arc::new(PipelineMetrics::new()),
            shutdown: ShutdownSignal::new(),
            prepared: Mutex::new(false),
        })
    }

    /// Report into shared metrics instead of the cacher's own
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Stop `cache_samples` from scheduling more work once `shutdown` fires
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn config(&self) -> &CacherConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// `<root>/<name>`
    pub fn cacher_dir(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    /// `<root>/<name>/<fingerprint>`
    pub fn fingerprint_dir(&self) -> PathBuf {
        self.cacher_dir().join(&self.fingerprint)
    }

    fn samples_dir(&self) -> PathBuf {
        self.fingerprint_dir().join("samples")
    }

    fn pending_dir(&self) -> PathBuf {
        self.fingerprint_dir().join("pending")
    }

    /// Location of the entry for `sample_id`. The crc suffix keeps ids that
    /// sanitize to the same stem apart.
    pub fn entry_path(&self, sample_id: &str) -> PathBuf {
        self.samples_dir().join(format!(
            "{}-{:08x}.{}",
            sanitize(sample_id),
            crc32c::crc32c(sample_id.as_bytes()),
            ENTRY_SUFFIX
        ))
    }

    pub fn is_cached(&self, sample_id: &str) -> bool {
        self.entry_path(sample_id).is_file()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.metrics.cache_hits.get(),
            misses: self.metrics.cache_misses.get(),
            corrupt: self.metrics.cache_corrupt.get(),
            bytes_written: self.metrics.cache_bytes_written.get(),
        }
    }

    /// Create the directory layout and manifest; honours `restart_cache`
    /// exactly once per cacher
    fn prepare(&self) -> Result<()> {
        let mut prepared = self.prepared.lock();
        if *prepared {
            return Ok(());
        }

        if self.config.restart_cache {
            let dir = self.cacher_dir();
            match fs::remove_dir_all(&dir) {
                Ok(()) => info!("Restarting cache '{}': removed {}", self.name, dir.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(MedflowError::io(dir, e)),
            }
        }

        for dir in [self.samples_dir(), self.pending_dir()] {
            fs::create_dir_all(&dir).map_err(|e| MedflowError::io(dir.clone(), e))?;
        }

        let dir = self.fingerprint_dir();
        let missing = match CacheManifest::load(&dir, &self.name, &self.fingerprint) {
            Ok(found) => found.is_none(),
            // Entries carry their own checksums, so only the manifest is rewritten
            Err(e) if e.is_corruption() => {
                warn!("Rewriting manifest of cache '{}': {}", self.name, e);
                self.metrics.cache_corrupt.inc();
                true
            }
            Err(e) => return Err(e),
        };
        if missing {
            let manifest = CacheManifest::new(
                self.name.clone(),
                self.fingerprint.clone(),
                self.pipeline.describe(),
            );
            self.write_atomic(&CacheManifest::path_in(&dir), manifest.to_json()?.as_bytes())?;
            info!(
                "Cache '{}' initialized at {} ({} static steps)",
                self.name,
                dir.display(),
                self.pipeline.len()
            );
        }

        *prepared = true;
        Ok(())
    }

    /// Write through `pending/` and rename into place
    fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<()> {
        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("entry");
        let pending = self
            .pending_dir()
            .join(format!("{}.{}", file_name, Uuid::new_v4()));

        let result = write_synced(&pending, bytes).and_then(|()| {
            fs::rename(&pending, target).map_err(|e| MedflowError::io(target, e))
        });
        if result.is_err() {
            let _ = fs::remove_file(&pending);
        }
        result
    }

    fn read_entry(&self, path: &Path) -> Result<Lookup> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Lookup::Missing),
            Err(e) => return Err(MedflowError::io(path, e)),
        };

        let decoded = if self.config.verify_checksums {
            decode_entry(path, &bytes)
        } else {
            decode_entry_unverified(path, &bytes)
        };
        match decoded {
            Ok(sample) => Ok(Lookup::Found(sample)),
            Err(e) if e.is_corruption() => Ok(Lookup::Corrupt(e)),
            Err(e) => Err(e),
        }
    }

    fn compute_and_store(&self, sample_id: &str, path: &Path) -> Result<SampleDict> {
        let sample = self
            .metrics
            .static_pipeline_duration
            .time(|| self.pipeline.run(SampleDict::new(sample_id)))?;
        self.metrics.cache_misses.inc();

        let bytes = encode_entry(&sample);
        self.write_atomic(path, &bytes)?;
        self.metrics.cache_bytes_written.inc_by(bytes.len() as u64);

        debug!("Cached sample {} ({} bytes)", sample_id, bytes.len());
        Ok(sample)
    }

    fn fetch(&self, sample_id: &str) -> Result<(SampleDict, EntryStatus)> {
        self.prepare()?;
        let path = self.entry_path(sample_id);

        if let Lookup::Found(sample) = self.read_entry(&path)? {
            self.metrics.cache_hits.inc();
            return Ok((sample, EntryStatus::Hit));
        }

        let key = (self.fingerprint_dir(), sample_id.to_string());
        let owner = acquire_owner(&key);
        let result = {
            let _held = owner.lock();
            // Another caller may have written the entry while we waited
            match self.read_entry(&path) {
                Ok(Lookup::Found(sample)) => {
                    self.metrics.cache_hits.inc();
                    Ok((sample, EntryStatus::Hit))
                }
                Ok(Lookup::Missing) => self
                    .compute_and_store(sample_id, &path)
                    .map(|s| (s, EntryStatus::Computed)),
                Ok(Lookup::Corrupt(e)) => {
                    warn!("Discarding cache entry for {}: {}", sample_id, e);
                    self.metrics.cache_corrupt.inc();
                    self.compute_and_store(sample_id, &path)
                        .map(|s| (s, EntryStatus::Computed))
                }
                Err(e) => Err(e),
            }
        };
        release_owner(&key, owner);
        result
    }

    /// Static pipeline output for `sample_id`, from disk when possible
    pub fn load(&self, sample_id: &str) -> Result<SampleDict> {
        self.fetch(sample_id).map(|(sample, _)| sample)
    }

    /// Make sure every id has an entry, running up to `workers` samples at a
    /// time on the compute runtime. A failing sample is recorded in the
    /// report and does not stop the others.
    pub async fn cache_samples(
        self: &Arc<Self>,
        runtime: &PipelineRuntime,
        sample_ids: &[String],
    ) -> Result<CacheReport> {
        let cacher = Arc::clone(self);
        runtime
            .spawn_pipeline(move || cacher.prepare())
            .await
            .map_err(|e| MedflowError::Internal {
                message: format!("cache preparation failed: {}", e),
            })??;

        info!(
            "Caching {} samples for '{}' ({} workers)",
            sample_ids.len(),
            self.name,
            self.config.workers
        );

        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let mut handles: Vec<(String, tokio::task::JoinHandle<_>)> = Vec::with_capacity(sample_ids.len());
        for sample_id in sample_ids {
            let permit = if self.shutdown.is_shutdown() {
                None
            } else {
                tokio::select! {
                    _ = self.shutdown.wait() => None,
                    permit = semaphore.clone().acquire_owned() => permit.ok(),
                }
            };
            let Some(permit) = permit else {
                warn!(
                    "Cache '{}': shutdown after scheduling {} of {} samples",
                    self.name,
                    handles.len(),
                    sample_ids.len()
                );
                handles.iter().for_each(|(_, handle)| handle.abort());
                return Err(MedflowError::ShutdownInProgress);
            };
            let cacher = Arc::clone(self);
            let id = sample_id.clone();
            let handle = runtime.spawn_pipeline(move || {
                cacher.metrics.samples_in_flight.inc();
                let status = cacher.fetch(&id).map(|(_, status)| status);
                cacher.metrics.samples_in_flight.dec();
                drop(permit);
                status
            });
            handles.push((sample_id.clone(), handle));
        }

        let mut report = CacheReport {
            total: sample_ids.len(),
            ..Default::default()
        };
        for (sample_id, handle) in handles {
            match handle.await {
                Ok(Ok(EntryStatus::Hit)) => report.hits += 1,
                Ok(Ok(EntryStatus::Computed)) => report.computed += 1,
                Ok(Err(e)) => {
                    warn!("Failed to cache sample {}: {}", sample_id, e);
                    report.failures.push((sample_id, e));
                }
                Err(e) => report.failures.push((
                    sample_id,
                    MedflowError::Internal {
                        message: format!("cache worker failed: {}", e),
                    },
                )),
            }
        }

        info!(
            "Cache '{}' ready: {} hits, {} computed, {} failed",
            self.name,
            report.hits,
            report.computed,
            report.failures.len()
        );
        Ok(report)
    }
}

impl fmt::Debug for SamplesCacher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplesCacher")
            .field("name", &self.name)
            .field("fingerprint", &self.fingerprint)
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OpSet;

    fn cacher(root: &Path) -> SamplesCacher {
        let pipeline = Arc::new(Pipeline::empty("static").then(OpSet::new("data.x", 1i64)));
        SamplesCacher::new("unit", pipeline, root, CacherConfig::default()).unwrap()
    }

    #[test]
    fn test_entry_names_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let c = cacher(dir.path());
        let a = c.entry_path("case/1");
        let b = c.entry_path("case_1");
        assert_ne!(a, b);
        assert!(a.starts_with(c.fingerprint_dir()));
        assert_eq!(a.extension().and_then(|e| e.to_str()), Some(ENTRY_SUFFIX));
    }

    #[test]
    fn test_miss_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let c = cacher(dir.path());

        assert!(!c.is_cached("s1"));
        let first = c.load("s1").unwrap();
        assert!(c.is_cached("s1"));
        let second = c.load("s1").unwrap();

        assert_eq!(first, second);
        let stats = c.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!(CacheManifest::path_in(&c.fingerprint_dir()).is_file());
    }

    #[test]
    fn test_invalid_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(Pipeline::empty("static"));
        let err = SamplesCacher::new("../escape", pipeline, dir.path(), CacherConfig::default())
            .unwrap_err();
        assert!(matches!(err, MedflowError::InvalidConfig { .. }));
    }
}
