//! Random augmentations for the dynamic pipeline
//!
//! Without a seed every call draws fresh randomness. With a seed the draw is
//! derived from the seed and the sample id, so each sample always receives
//! the same augmentation (useful for visual checks and tests).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::BTreeMap;

use super::{Op, OpContext};
use crate::error::{MedflowError, Result};
use crate::sample::{SampleDict, Value};

fn sample_rng(seed: Option<u64>, ctx: &OpContext) -> StdRng {
    match seed {
        Some(seed) => {
            let mix = crc32c::crc32c(ctx.sample_id.as_bytes()) as u64;
            StdRng::seed_from_u64(seed ^ (mix << 32 | mix))
        }
        None => StdRng::from_entropy(),
    }
}

/// Flip `key` along `axis` with probability `prob`.
///
/// Whether the flip happened is recorded, so reverse is exact.
#[derive(Debug, Clone)]
pub struct OpRandomFlip {
    key: String,
    axis: usize,
    prob: f64,
    seed: Option<u64>,
}

impl OpRandomFlip {
    pub fn new(key: impl Into<String>, axis: usize) -> Self {
        Self {
            key: key.into(),
            axis,
            prob: 0.5,
            seed: None,
        }
    }

    pub fn with_prob(mut self, prob: f64) -> Self {
        self.prob = prob;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl Op for OpRandomFlip {
    fn name(&self) -> &str {
        "OpRandomFlip"
    }

    fn config(&self) -> serde_json::Value {
        json!({ "key": self.key, "axis": self.axis, "prob": self.prob, "seed": self.seed })
    }

    fn forward(&self, mut sample: SampleDict, ctx: &OpContext) -> Result<SampleDict> {
        if !(0.0..=1.0).contains(&self.prob) {
            return Err(MedflowError::InvalidConfig {
                reason: format!("flip probability {} outside [0, 1]", self.prob),
            });
        }
        let flipped = sample_rng(self.seed, ctx).gen_bool(self.prob);
        if flipped {
            let out = sample.array(&self.key)?.flip(self.axis)?;
            sample.set(&self.key, out)?;
        } else {
            // Still validate the key so a typo fails on every access
            sample.array(&self.key)?;
        }

        let mut info = BTreeMap::new();
        info.insert("flipped".to_string(), Value::Bool(flipped));
        ctx.save_info(&mut sample, Value::Dict(info))?;
        Ok(sample)
    }

    fn reverse(
        &self,
        mut sample: SampleDict,
        key_to_reverse: &str,
        key_to_follow: &str,
        ctx: &OpContext,
    ) -> Result<SampleDict> {
        if key_to_follow != self.key {
            return Ok(sample);
        }
        let flipped = matches!(
            ctx.load_info(&sample),
            Some(Value::Dict(info)) if info.get("flipped") == Some(&Value::Bool(true))
        );
        if flipped {
            let out = sample.array(key_to_reverse)?.flip(self.axis)?;
            sample.set(key_to_reverse, out)?;
        }
        Ok(sample)
    }
}

/// Add uniform noise in `[-amplitude, amplitude]` to `key`.
/// Lossy: reverse is the identity.
#[derive(Debug, Clone)]
pub struct OpRandomNoise {
    key: String,
    amplitude: f32,
    seed: Option<u64>,
}

impl OpRandomNoise {
    pub fn new(key: impl Into<String>, amplitude: f32) -> Self {
        Self {
            key: key.into(),
            amplitude,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl Op for OpRandomNoise {
    fn name(&self) -> &str {
        "OpRandomNoise"
    }

    fn config(&self) -> serde_json::Value {
        json!({ "key": self.key, "amplitude": self.amplitude, "seed": self.seed })
    }

    fn forward(&self, mut sample: SampleDict, ctx: &OpContext) -> Result<SampleDict> {
        if !(self.amplitude >= 0.0) {
            return Err(MedflowError::InvalidConfig {
                reason: format!("noise amplitude must be non-negative, got {}", self.amplitude),
            });
        }
        let mut array = sample.array(&self.key)?.to_f32();
        if self.amplitude > 0.0 {
            let mut rng = sample_rng(self.seed, ctx);
            if let Some(values) = array.as_f32_mut() {
                for v in values.iter_mut() {
                    *v += rng.gen_range(-self.amplitude..=self.amplitude);
                }
            }
        }
        sample.set(&self.key, array)?;
        Ok(sample)
    }
}
