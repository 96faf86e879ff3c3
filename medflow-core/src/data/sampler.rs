//! Batch samplers
//!
//! A sampler decides which dataset indices form each batch. The balanced
//! sampler reads class labels from the static output once, at
//! construction, and then draws every batch from per-class pools.

use rand::rngs::StdRng;
use rand::seq::{index, SliceRandom};
use rand::SeedableRng;

use super::dataset::Dataset;
use crate::error::{MedflowError, Result};
use crate::sample::Value;

/// Produces the index batches of one epoch
pub trait BatchSampler: Send + Sync {
    fn num_batches(&self) -> usize;

    /// Batches for `epoch`; with a fixed seed the result depends only on
    /// the epoch
    fn batches(&self, epoch: u64) -> Vec<Vec<usize>>;
}

/// Configuration for [`BalancedBatchSampler`]
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub batch_size: usize,
    /// Key holding an integer class label; `None` disables balancing
    pub balanced_class_name: Option<String>,
    pub num_balanced_classes: usize,
    /// Samples of each class per batch; must sum to `batch_size`
    pub balanced_class_weights: Option<Vec<usize>>,
    /// Batches per epoch; defaults to `ceil(len / batch_size)`
    pub num_batches: Option<usize>,
    /// Shuffle the plain order and the order within balanced batches. Off
    /// by default; balanced pools are always drawn in random order.
    pub shuffle: bool,
    /// Random seed for reproducible epochs
    pub seed: Option<u64>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            balanced_class_name: None,
            num_balanced_classes: 0,
            balanced_class_weights: None,
            num_batches: None,
            shuffle: false,
            seed: None,
        }
    }
}

impl SamplerConfig {
    pub fn balanced(
        batch_size: usize,
        class_name: impl Into<String>,
        num_classes: usize,
    ) -> Self {
        Self {
            batch_size,
            balanced_class_name: Some(class_name.into()),
            num_balanced_classes: num_classes,
            ..Default::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Batch sampler with optional class balancing
#[derive(Debug, Clone)]
pub struct BalancedBatchSampler {
    config: SamplerConfig,
    len: usize,
    /// Indices of each class; empty when balancing is off
    pools: Vec<Vec<usize>>,
    num_batches: usize,
}

fn class_of(value: &Value) -> Option<i64> {
    match value {
        Value::Float(v) if v.fract() == 0.0 => Some(*v as i64),
        other => other.as_int(),
    }
}

impl BalancedBatchSampler {
    /// Build the sampler; reads labels when balancing is requested
    pub fn new(dataset: &Dataset, config: SamplerConfig) -> Result<Self> {
        if config.batch_size == 0 {
            return Err(MedflowError::InvalidConfig {
                reason: "batch_size must be positive".into(),
            });
        }

        let len = dataset.len();
        let pools = match &config.balanced_class_name {
            Some(key) => Self::class_pools(dataset, key, &config)?,
            None => Vec::new(),
        };
        let num_batches = config
            .num_batches
            .unwrap_or_else(|| len.div_ceil(config.batch_size));

        Ok(Self {
            config,
            len,
            pools,
            num_batches,
        })
    }

    fn class_pools(dataset: &Dataset, key: &str, config: &SamplerConfig) -> Result<Vec<Vec<usize>>> {
        let num_classes = config.num_balanced_classes;
        if num_classes == 0 {
            return Err(MedflowError::InvalidConfig {
                reason: "balancing needs num_balanced_classes > 0".into(),
            });
        }
        if let Some(weights) = &config.balanced_class_weights {
            if weights.len() != num_classes {
                return Err(MedflowError::InvalidConfig {
                    reason: format!(
                        "{} class weights given for {} classes",
                        weights.len(),
                        num_classes
                    ),
                });
            }
            let total: usize = weights.iter().sum();
            if total != config.batch_size {
                return Err(MedflowError::InvalidConfig {
                    reason: format!(
                        "class weights sum to {}, batch_size is {}",
                        total, config.batch_size
                    ),
                });
            }
        }

        let mut pools = vec![Vec::new(); num_classes];
        for (index, value) in dataset.values(key)?.iter().enumerate() {
            let sample_id = &dataset.sample_ids()[index];
            let class = class_of(value).ok_or_else(|| MedflowError::InvalidLabel {
                sample_id: sample_id.clone(),
                key: key.to_string(),
                reason: format!("expected an integer class, found {} {}", value.kind(), value),
            })?;
            let pool = usize::try_from(class)
                .ok()
                .and_then(|c| pools.get_mut(c))
                .ok_or_else(|| MedflowError::InvalidLabel {
                    sample_id: sample_id.clone(),
                    key: key.to_string(),
                    reason: format!("class {} outside [0, {})", class, num_classes),
                })?;
            pool.push(index);
        }

        for (class, pool) in pools.iter().enumerate() {
            let required = match &config.balanced_class_weights {
                Some(weights) => weights[class] > 0,
                None => true,
            };
            if required && pool.is_empty() {
                return Err(MedflowError::InvalidConfig {
                    reason: format!("class {} of '{}' has no samples", class, key),
                });
            }
        }
        Ok(pools)
    }

    fn rng(&self, epoch: u64) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
            None => StdRng::from_entropy(),
        }
    }

    /// Per-class counts for one batch
    fn class_counts(&self, rng: &mut StdRng) -> Vec<usize> {
        if let Some(weights) = &self.config.balanced_class_weights {
            return weights.clone();
        }
        let num_classes = self.pools.len();
        let base = self.config.batch_size / num_classes;
        let remainder = self.config.batch_size % num_classes;

        let mut counts = vec![base; num_classes];
        // Distinct classes get the leftovers, so counts differ by at most one
        for class in index::sample(rng, num_classes, remainder) {
            counts[class] += 1;
        }
        counts
    }

    fn balanced_batches(&self, rng: &mut StdRng) -> Vec<Vec<usize>> {
        let mut pools: Vec<Vec<usize>> = self.pools.clone();
        let mut cursors = vec![0usize; pools.len()];
        for pool in &mut pools {
            pool.shuffle(rng);
        }

        let mut batches = Vec::with_capacity(self.num_batches);
        for _ in 0..self.num_batches {
            let counts = self.class_counts(rng);
            let mut batch = Vec::with_capacity(self.config.batch_size);
            for (class, &count) in counts.iter().enumerate() {
                for _ in 0..count {
                    // Recycle an exhausted pool in a fresh order
                    if cursors[class] == pools[class].len() {
                        pools[class].shuffle(rng);
                        cursors[class] = 0;
                    }
                    batch.push(pools[class][cursors[class]]);
                    cursors[class] += 1;
                }
            }
            if self.config.shuffle {
                batch.shuffle(rng);
            }
            batches.push(batch);
        }
        batches
    }

    fn plain_batches(&self, rng: &mut StdRng) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.len).collect();
        if self.config.shuffle {
            order.shuffle(rng);
        }
        order
            .chunks(self.config.batch_size)
            .take(self.num_batches)
            .map(<[usize]>::to_vec)
            .collect()
    }
}

impl BatchSampler for BalancedBatchSampler {
    fn num_batches(&self) -> usize {
        self.num_batches
    }

    fn batches(&self, epoch: u64) -> Vec<Vec<usize>> {
        let mut rng = self.rng(epoch);
        if self.pools.is_empty() {
            self.plain_batches(&mut rng)
        } else {
            self.balanced_batches(&mut rng)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{OpContext, OpLambda};
    use crate::pipeline::Pipeline;
    use crate::runtime::{PipelineRuntime, RuntimeConfig};
    use crate::sample::SampleDict;
    use std::sync::Arc;

    /// Ids are "<class>_<n>"; the static pipeline parses the class
    fn labelled(ids: &[&str]) -> Dataset {
        let pipeline = Pipeline::empty("static").then(OpLambda::new(
            "parse_label",
            1,
            |mut s: SampleDict, _: &OpContext| {
                let label: i64 = s.sample_id()[..1].parse().unwrap_or(-1);
                s.set("data.label", label)?;
                Ok(s)
            },
        ));
        let ds = Dataset::new(
            ids.iter().map(|s| s.to_string()).collect(),
            Arc::new(pipeline),
            None,
            None,
        )
        .unwrap();
        let runtime = PipelineRuntime::new(RuntimeConfig {
            io_threads: 1,
            compute_threads: 1,
        })
        .unwrap();
        runtime.block_on(ds.create(&runtime)).unwrap();
        runtime.shutdown();
        ds
    }

    fn class_count(ds: &Dataset, batch: &[usize], class: i64) -> usize {
        batch
            .iter()
            .filter(|&&i| ds.get_static(i).unwrap().int("data.label").unwrap() == class)
            .count()
    }

    #[test]
    fn test_odd_batch_imbalance_at_most_one() {
        let ds = labelled(&["0_a", "0_b", "0_c", "1_a", "1_b", "1_c", "2_a"]);
        let sampler =
            BalancedBatchSampler::new(&ds, SamplerConfig::balanced(5, "data.label", 3).with_seed(3))
                .unwrap();

        assert_eq!(sampler.num_batches(), 2);
        for batch in sampler.batches(0) {
            assert_eq!(batch.len(), 5);
            let counts: Vec<usize> = (0..3).map(|c| class_count(&ds, &batch, c)).collect();
            let max = *counts.iter().max().unwrap();
            let min = *counts.iter().min().unwrap();
            assert!(max - min <= 1, "counts {counts:?}");
        }
    }

    #[test]
    fn test_weights_are_honoured() {
        let ds = labelled(&["0_a", "0_b", "1_a", "1_b"]);
        let mut config = SamplerConfig::balanced(4, "data.label", 2).with_seed(1);
        config.balanced_class_weights = Some(vec![3, 1]);
        let sampler = BalancedBatchSampler::new(&ds, config).unwrap();

        for batch in sampler.batches(7) {
            assert_eq!(class_count(&ds, &batch, 0), 3);
            assert_eq!(class_count(&ds, &batch, 1), 1);
        }
    }

    #[test]
    fn test_bad_weights_rejected() {
        let ds = labelled(&["0_a", "1_a"]);
        let mut config = SamplerConfig::balanced(4, "data.label", 2);
        config.balanced_class_weights = Some(vec![1, 1]);
        assert!(matches!(
            BalancedBatchSampler::new(&ds, config),
            Err(MedflowError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_label_out_of_range() {
        let ds = labelled(&["0_a", "5_a"]);
        let err = BalancedBatchSampler::new(&ds, SamplerConfig::balanced(2, "data.label", 2))
            .unwrap_err();
        assert!(matches!(err, MedflowError::InvalidLabel { .. }));
    }

    #[test]
    fn test_plain_mode_covers_every_index() {
        let ds = labelled(&["0_a", "0_b", "1_a", "1_b", "1_c"]);
        let config = SamplerConfig {
            batch_size: 2,
            seed: Some(11),
            ..Default::default()
        };
        let sampler = BalancedBatchSampler::new(&ds, config).unwrap();

        let batches = sampler.batches(0);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 1);
        let mut all: Vec<usize> = batches.concat();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3, 4]);

        assert_eq!(sampler.batches(0), batches);
    }

    #[test]
    fn test_default_plain_order_is_sequential() {
        let ds = labelled(&["0_a", "0_b", "1_a", "1_b", "1_c"]);
        let config = SamplerConfig {
            batch_size: 2,
            ..Default::default()
        };
        let sampler = BalancedBatchSampler::new(&ds, config.clone()).unwrap();
        assert_eq!(sampler.batches(4), vec![vec![0, 1], vec![2, 3], vec![4]]);

        let shuffled = BalancedBatchSampler::new(
            &ds,
            SamplerConfig {
                shuffle: true,
                seed: Some(3),
                ..config
            },
        )
        .unwrap();
        let mut all = shuffled.batches(0).concat();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3, 4]);
    }
}
