//! Intensity transforms on array-valued keys
//!
//! All of these convert the target array to `f32`.

use serde_json::json;
use std::collections::BTreeMap;
use tracing::debug;

use super::{Op, OpContext};
use crate::error::{MedflowError, Result};
use crate::sample::{SampleDict, Value};

/// Min-max scale `key` into `to_range`.
///
/// The source min/max are recorded per sample, so `reverse` restores the
/// original intensities up to f32 rounding (about 1e-4 of the source range).
/// A constant array maps to the low end of the range and reverses exactly.
#[derive(Debug, Clone)]
pub struct OpNormalize {
    key: String,
    to_range: (f32, f32),
}

impl OpNormalize {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            to_range: (0.0, 1.0),
        }
    }

    pub fn with_range(mut self, lo: f32, hi: f32) -> Self {
        self.to_range = (lo, hi);
        self
    }
}

impl Op for OpNormalize {
    fn name(&self) -> &str {
        "OpNormalize"
    }

    fn config(&self) -> serde_json::Value {
        json!({ "key": self.key, "to_range": [self.to_range.0, self.to_range.1] })
    }

    fn forward(&self, mut sample: SampleDict, ctx: &OpContext) -> Result<SampleDict> {
        let (lo, hi) = self.to_range;
        if !(lo < hi) {
            return Err(MedflowError::InvalidConfig {
                reason: format!("normalize range [{}, {}] is empty", lo, hi),
            });
        }

        let mut array = sample.array(&self.key)?.to_f32();
        let Some((min, max)) = array.min_max() else {
            sample.set(&self.key, array)?;
            return Ok(sample);
        };

        let span = max - min;
        if let Some(values) = array.as_f32_mut() {
            for v in values.iter_mut() {
                *v = if span > 0.0 {
                    lo + ((*v as f64 - min) / span) as f32 * (hi - lo)
                } else {
                    lo
                };
            }
        }

        let mut info = BTreeMap::new();
        info.insert("min".to_string(), Value::Float(min));
        info.insert("max".to_string(), Value::Float(max));
        ctx.save_info(&mut sample, Value::Dict(info))?;
        sample.set(&self.key, array)?;
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
        let (min, max) = match ctx.load_info(&sample) {
            Some(Value::Dict(info)) => match (
                info.get("min").and_then(Value::as_f64),
                info.get("max").and_then(Value::as_f64),
            ) {
                (Some(min), Some(max)) => (min, max),
                _ => return Ok(sample),
            },
            _ => {
                debug!("No normalize info for {} on {}", ctx.op_id, ctx.sample_id);
                return Ok(sample);
            }
        };

        let (lo, hi) = self.to_range;
        let mut array = sample.array(key_to_reverse)?.to_f32();
        if let Some(values) = array.as_f32_mut() {
            for v in values.iter_mut() {
                let unit = (*v - lo) as f64 / (hi - lo) as f64;
                *v = (min + unit * (max - min)) as f32;
            }
        }
        sample.set(key_to_reverse, array)?;
        Ok(sample)
    }
}

/// Standardize `key` with fixed statistics: `(x - mean) / std`.
///
/// Reverse applies `x * std + mean`; exact up to f32 rounding.
#[derive(Debug, Clone)]
pub struct OpStandardize {
    key: String,
    mean: f64,
    std: f64,
}

impl OpStandardize {
    pub fn new(key: impl Into<String>, mean: f64, std: f64) -> Self {
        Self {
            key: key.into(),
            mean,
            std,
        }
    }
}

impl Op for OpStandardize {
    fn name(&self) -> &str {
        "OpStandardize"
    }

    fn config(&self) -> serde_json::Value {
        json!({ "key": self.key, "mean": self.mean, "std": self.std })
    }

    fn forward(&self, mut sample: SampleDict, _ctx: &OpContext) -> Result<SampleDict> {
        if !(self.std > 0.0) {
            return Err(MedflowError::InvalidConfig {
                reason: format!("standardize std must be positive, got {}", self.std),
            });
        }
        let mut array = sample.array(&self.key)?.to_f32();
        if let Some(values) = array.as_f32_mut() {
            for v in values.iter_mut() {
                *v = ((*v as f64 - self.mean) / self.std) as f32;
            }
        }
        sample.set(&self.key, array)?;
        Ok(sample)
    }

    fn reverse(
        &self,
        mut sample: SampleDict,
        key_to_reverse: &str,
        key_to_follow: &str,
        _ctx: &OpContext,
    ) -> Result<SampleDict> {
        if key_to_follow != self.key {
            return Ok(sample);
        }
        let mut array = sample.array(key_to_reverse)?.to_f32();
        if let Some(values) = array.as_f32_mut() {
            for v in values.iter_mut() {
                *v = (*v as f64 * self.std + self.mean) as f32;
            }
        }
        sample.set(key_to_reverse, array)?;
        Ok(sample)
    }
}

/// Clamp `key` into `[min, max]`. Lossy: reverse is the identity.
#[derive(Debug, Clone)]
pub struct OpClip {
    key: String,
    min: f32,
    max: f32,
}

impl OpClip {
    pub fn new(key: impl Into<String>, min: f32, max: f32) -> Self {
        Self {
            key: key.into(),
            min,
            max,
        }
    }
}

impl Op for OpClip {
    fn name(&self) -> &str {
        "OpClip"
    }

    fn config(&self) -> serde_json::Value {
        json!({ "key": self.key, "min": self.min, "max": self.max })
    }

    fn forward(&self, mut sample: SampleDict, _ctx: &OpContext) -> Result<SampleDict> {
        if !(self.min <= self.max) {
            return Err(MedflowError::InvalidConfig {
                reason: format!("clip bounds [{}, {}] are inverted", self.min, self.max),
            });
        }
        let mut array = sample.array(&self.key)?.to_f32();
        if let Some(values) = array.as_f32_mut() {
            for v in values.iter_mut() {
                *v = v.clamp(self.min, self.max);
            }
        }
        sample.set(&self.key, array)?;
        Ok(sample)
    }
}
