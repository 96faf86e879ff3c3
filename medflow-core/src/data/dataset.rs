//! Dataset: sample ids bound to a static pipeline, an optional dynamic
//! pipeline and an optional cacher
//!
//! Static output comes from the cacher when one is attached, otherwise the
//! static pipeline runs on every access. The dynamic pipeline always runs
//! fresh on top of it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheReport, SamplesCacher};
use crate::error::{MedflowError, Result};
use crate::metrics::PipelineMetrics;
use crate::pipeline::Pipeline;
use crate::runtime::PipelineRuntime;
use crate::sample::{SampleDict, Value};

/// Runtime representation of a dataset
pub struct Dataset {
    sample_ids: Vec<String>,
    static_pipeline: Arc<Pipeline>,
    dynamic_pipeline: Option<Arc<Pipeline>>,
    cacher: Option<Arc<SamplesCacher>>,
    metrics: Arc<PipelineMetrics>,
    created: AtomicBool,
}

impl Dataset {
    /// Bind ids to pipelines. A cacher must cache the same static pipeline.
    pub fn new(
        sample_ids: Vec<String>,
        static_pipeline: Arc<Pipeline>,
        dynamic_pipeline: Option<Arc<Pipeline>>,
        cacher: Option<Arc<SamplesCacher>>,
    ) -> Result<Self> {
        if let Some(cacher) = &cacher {
            let fingerprint = static_pipeline.fingerprint()?;
            if cacher.fingerprint() != fingerprint {
                return Err(MedflowError::InvalidConfig {
                    reason: format!(
                        "cacher '{}' caches pipeline {} but the static pipeline is {}",
                        cacher.name(),
                        cacher.fingerprint(),
                        fingerprint
                    ),
                });
            }
        }

        let metrics = cacher
            .as_ref()
            .map(|c| Arc::clone(c.metrics()))
            .unwrap_or_default();

        Ok(Self {
            sample_ids,
            static_pipeline,
            dynamic_pipeline,
            cacher,
            metrics,
            created: AtomicBool::new(false),
        })
    }

    /// Populate the cache for every sample. Safe to call repeatedly: valid
    /// entries are reused, so a second call computes nothing.
    ///
    /// Samples that fail are listed in the report; the dataset is usable
    /// for the rest.
    pub async fn create(&self, runtime: &PipelineRuntime) -> Result<CacheReport> {
        let report = match &self.cacher {
            Some(cacher) => cacher.cache_samples(runtime, &self.sample_ids).await?,
            None => CacheReport {
                total: self.sample_ids.len(),
                ..Default::default()
            },
        };
        self.created.store(true, Ordering::Release);
        info!(
            "Dataset ready: {} samples, static '{}', dynamic {}",
            self.sample_ids.len(),
            self.static_pipeline.name(),
            self.dynamic_pipeline
                .as_ref()
                .map(|p| format!("'{}'", p.name()))
                .unwrap_or_else(|| "none".into())
        );
        Ok(report)
    }

    pub fn is_created(&self) -> bool {
        self.created.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_ids.is_empty()
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn static_pipeline(&self) -> &Arc<Pipeline> {
        &self.static_pipeline
    }

    pub fn dynamic_pipeline(&self) -> Option<&Arc<Pipeline>> {
        self.dynamic_pipeline.as_ref()
    }

    pub fn cacher(&self) -> Option<&Arc<SamplesCacher>> {
        self.cacher.as_ref()
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    fn check_created(&self) -> Result<()> {
        if self.is_created() {
            Ok(())
        } else {
            Err(MedflowError::NotCreated)
        }
    }

    fn id_at(&self, index: usize) -> Result<&str> {
        self.sample_ids
            .get(index)
            .map(String::as_str)
            .ok_or(MedflowError::IndexOutOfRange {
                index,
                len: self.sample_ids.len(),
            })
    }

    fn static_output(&self, sample_id: &str) -> Result<SampleDict> {
        match &self.cacher {
            Some(cacher) => cacher.load(sample_id),
            None => self.static_pipeline.run(SampleDict::new(sample_id)),
        }
    }

    /// Static output only, skipping the dynamic pipeline
    pub fn get_static(&self, index: usize) -> Result<SampleDict> {
        self.check_created()?;
        self.static_output(self.id_at(index)?)
    }

    /// Fully processed sample at `index`
    pub fn get(&self, index: usize) -> Result<SampleDict> {
        self.check_created()?;
        let sample_id = self.id_at(index)?.to_string();
        self.get_by_id(&sample_id)
    }

    /// Fully processed sample for `sample_id`
    pub fn get_by_id(&self, sample_id: &str) -> Result<SampleDict> {
        self.check_created()?;
        let sample = self.static_output(sample_id)?;
        let sample = match &self.dynamic_pipeline {
            Some(dynamic) => dynamic.run(sample)?,
            None => sample,
        };
        self.metrics.samples_processed.inc();
        debug!("Produced sample {}", sample_id);
        Ok(sample)
    }

    /// Static value at `key` for every sample, in dataset order
    pub fn values(&self, key: &str) -> Result<Vec<Value>> {
        (0..self.len())
            .map(|index| {
                let sample = self.get_static(index)?;
                Ok(sample.value(key)?.clone())
            })
            .collect()
    }

    /// Count values (or array shapes) under each key over the static output
    pub fn summary(&self, keys: &[&str]) -> Result<DatasetSummary> {
        let mut summaries: Vec<KeySummary> = keys
            .iter()
            .map(|key| KeySummary {
                key: key.to_string(),
                counts: BTreeMap::new(),
                missing: 0,
            })
            .collect();

        for index in 0..self.len() {
            let sample = self.get_static(index)?;
            for summary in &mut summaries {
                match sample.get(&summary.key) {
                    None => summary.missing += 1,
                    Some(value) => {
                        let bucket = match value {
                            Value::Array(arr) => format!("shape {:?}", arr.shape()),
                            other => other.to_string(),
                        };
                        *summary.counts.entry(bucket).or_insert(0) += 1;
                    }
                }
            }
        }

        Ok(DatasetSummary {
            num_samples: self.len(),
            keys: summaries,
        })
    }

    /// Invert the dynamic then the static pipeline for `key_to_reverse`
    pub fn reverse(
        &self,
        sample: SampleDict,
        key_to_reverse: &str,
        key_to_follow: &str,
    ) -> Result<SampleDict> {
        let sample = match &self.dynamic_pipeline {
            Some(dynamic) => dynamic.reverse(sample, key_to_reverse, key_to_follow)?,
            None => sample,
        };
        self.static_pipeline
            .reverse(sample, key_to_reverse, key_to_follow)
    }

    /// Log a description of the sample at `index`. Never fails.
    pub fn visualize(&self, index: usize) {
        match self.get(index) {
            Ok(sample) => {
                info!("Sample {} ({}):", index, sample.sample_id());
                for line in describe_sample(&sample) {
                    info!("  {}", line);
                }
            }
            Err(e) => warn!("Cannot visualize sample {}: {}", index, e),
        }
    }

    /// Log how the dynamic pipeline changed each array of the sample at
    /// `index`. Never fails.
    pub fn visualize_augmentation(&self, index: usize) {
        let Some(dynamic) = &self.dynamic_pipeline else {
            info!("Sample {}: no dynamic pipeline to visualize", index);
            return;
        };

        let before = match self.get_static(index) {
            Ok(sample) => sample,
            Err(e) => {
                warn!("Cannot visualize augmentation of sample {}: {}", index, e);
                return;
            }
        };
        let after = match dynamic.run(before.clone()) {
            Ok(sample) => sample,
            Err(e) => {
                warn!("Cannot visualize augmentation of sample {}: {}", index, e);
                return;
            }
        };

        info!("Augmentation of sample {} ({}):", index, before.sample_id());
        for key in after.keypaths() {
            let (Some(Value::Array(b)), Some(Value::Array(a))) = (before.get(&key), after.get(&key))
            else {
                continue;
            };
            if a.shape() != b.shape() {
                info!("  {}: shape {:?} -> {:?}", key, b.shape(), a.shape());
                continue;
            }
            let (a, b) = (a.to_f32(), b.to_f32());
            let diff = a
                .as_f32()
                .unwrap_or(&[])
                .iter()
                .zip(b.as_f32().unwrap_or(&[]))
                .map(|(x, y)| (x - y).abs() as f64)
                .fold(0.0f64, f64::max);
            info!("  {}: max abs change {:.4}", key, diff);
        }
    }

    /// Dataset over the ids at `indices`, sharing pipelines and cacher
    pub fn subset(&self, indices: &[usize]) -> Result<Dataset> {
        let sample_ids = indices
            .iter()
            .map(|&index| self.id_at(index).map(str::to_string))
            .collect::<Result<Vec<_>>>()?;

        Ok(Dataset {
            sample_ids,
            static_pipeline: Arc::clone(&self.static_pipeline),
            dynamic_pipeline: self.dynamic_pipeline.clone(),
            cacher: self.cacher.clone(),
            metrics: Arc::clone(&self.metrics),
            created: AtomicBool::new(self.is_created()),
        })
    }
}

/// One line per leaf: kind plus shape and statistics for arrays
pub fn describe_sample(sample: &SampleDict) -> Vec<String> {
    sample
        .keypaths()
        .into_iter()
        .filter_map(|key| {
            let value = sample.get(&key)?;
            let line = match value {
                Value::Array(arr) => match (arr.min_max(), arr.mean_std()) {
                    (Some((lo, hi)), Some((mean, std))) => format!(
                        "{}: {} {:?} min={:.4} max={:.4} mean={:.4} std={:.4}",
                        key,
                        arr.dtype(),
                        arr.shape(),
                        lo,
                        hi,
                        mean,
                        std
                    ),
                    _ => format!("{}: {} {:?} (empty)", key, arr.dtype(), arr.shape()),
                },
                other => format!("{}: {} = {}", key, other.kind(), other),
            };
            Some(line)
        })
        .collect()
}

/// Value distribution of one key
#[derive(Debug, Clone)]
pub struct KeySummary {
    pub key: String,
    /// Rendered value (or array shape) to number of samples
    pub counts: BTreeMap<String, usize>,
    /// Samples without the key
    pub missing: usize,
}

/// Output of [`Dataset::summary`]
#[derive(Debug, Clone)]
pub struct DatasetSummary {
    pub num_samples: usize,
    pub keys: Vec<KeySummary>,
}

impl DatasetSummary {
    pub fn key(&self, key: &str) -> Option<&KeySummary> {
        self.keys.iter().find(|k| k.key == key)
    }
}

impl fmt::Display for DatasetSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} samples", self.num_samples)?;
        for summary in &self.keys {
            writeln!(f, "{}:", summary.key)?;
            let width = summary.counts.keys().map(String::len).max().unwrap_or(0);
            for (value, count) in &summary.counts {
                writeln!(f, "  {:<width$}  {:>6}", value, count, width = width)?;
            }
            if summary.missing > 0 {
                writeln!(f, "  {:<width$}  {:>6}", "<missing>", summary.missing, width = width)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{OpContext, OpLambda, OpSet};

    fn label_pipeline() -> Arc<Pipeline> {
        Arc::new(Pipeline::empty("static").then(OpLambda::new(
            "label_from_id",
            1,
            |mut s: SampleDict, _: &OpContext| {
                let label = s.sample_id().ends_with(|c: char| "024".contains(c)) as i64;
                s.set("data.label", label)?;
                Ok(s)
            },
        )))
    }

    fn created(ids: &[&str]) -> Dataset {
        let ds = Dataset::new(
            ids.iter().map(|s| s.to_string()).collect(),
            label_pipeline(),
            Some(Arc::new(Pipeline::empty("dynamic").then(OpSet::new("data.aug", true)))),
            None,
        )
        .unwrap();
        ds.created.store(true, Ordering::Release);
        ds
    }

    #[test]
    fn test_access_before_create_fails() {
        let ds = Dataset::new(vec!["s0".into()], label_pipeline(), None, None).unwrap();
        assert!(matches!(ds.get(0), Err(MedflowError::NotCreated)));
    }

    #[test]
    fn test_get_runs_both_stages() {
        let ds = created(&["s0", "s1"]);
        let sample = ds.get(1).unwrap();
        assert_eq!(sample.int("data.label").unwrap(), 0);
        assert!(sample.contains("data.aug"));

        let static_only = ds.get_static(1).unwrap();
        assert!(!static_only.contains("data.aug"));

        assert!(matches!(
            ds.get(5),
            Err(MedflowError::IndexOutOfRange { index: 5, len: 2 })
        ));
    }

    #[test]
    fn test_summary_counts_labels() {
        let ds = created(&["s0", "s1", "s2", "s3"]);
        let summary = ds.summary(&["data.label", "data.absent"]).unwrap();

        let labels = summary.key("data.label").unwrap();
        assert_eq!(labels.counts.get("0"), Some(&2));
        assert_eq!(labels.counts.get("1"), Some(&2));
        assert_eq!(summary.key("data.absent").unwrap().missing, 4);
        assert!(summary.to_string().contains("4 samples"));
    }

    #[test]
    fn test_subset_shares_pipelines() {
        let ds = created(&["s0", "s1", "s2"]);
        let sub = ds.subset(&[2, 0]).unwrap();
        assert_eq!(sub.sample_ids(), &["s2".to_string(), "s0".to_string()]);
        assert!(sub.get(0).is_ok());
        assert!(ds.subset(&[3]).is_err());
    }

    #[test]
    fn test_visualize_never_panics() {
        let ds = created(&["s0"]);
        ds.visualize(0);
        ds.visualize(10);
        ds.visualize_augmentation(0);
    }
}
