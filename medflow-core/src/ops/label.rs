//! Label derivation from clinical values

use serde_json::json;
use std::collections::BTreeMap;

use super::{Op, OpContext};
use crate::error::{MedflowError, Result};
use crate::sample::{NdArray, SampleDict, Value};

/// Map raw integer codes at `key_in` to class values at `key_out`.
///
/// Codes without a mapping get `default`; leaving `default` as `Null`
/// marks the sample as unlabeled for that task. For example a response
/// code where 0 and 2 are "no response", 1 is "response" and anything
/// above 2 is unknown:
///
/// ```ignore
/// OpMapLabel::new("data.clinical.response", "data.gt.label")
///     .map(0, 0i64).map(2, 0i64).map(1, 1i64)
/// ```
#[derive(Debug, Clone)]
pub struct OpMapLabel {
    key_in: String,
    key_out: String,
    mapping: BTreeMap<i64, Value>,
    default: Value,
}

impl OpMapLabel {
    pub fn new(key_in: impl Into<String>, key_out: impl Into<String>) -> Self {
        Self {
            key_in: key_in.into(),
            key_out: key_out.into(),
            mapping: BTreeMap::new(),
            default: Value::Null,
        }
    }

    pub fn map(mut self, code: i64, value: impl Into<Value>) -> Self {
        self.mapping.insert(code, value.into());
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = value.into();
        self
    }
}

impl Op for OpMapLabel {
    fn name(&self) -> &str {
        "OpMapLabel"
    }

    fn config(&self) -> serde_json::Value {
        let mapping: serde_json::Map<String, serde_json::Value> = self
            .mapping
            .iter()
            .map(|(code, v)| (code.to_string(), v.to_json()))
            .collect();
        json!({
            "key_in": self.key_in,
            "key_out": self.key_out,
            "mapping": mapping,
            "default": self.default.to_json(),
        })
    }

    fn forward(&self, mut sample: SampleDict, _ctx: &OpContext) -> Result<SampleDict> {
        let code = sample.int(&self.key_in)?;
        let value = self.mapping.get(&code).unwrap_or(&self.default).clone();
        sample.set(&self.key_out, value)?;
        Ok(sample)
    }
}

/// Binarize a numeric value: `1` if `x >= threshold`, else `0`
#[derive(Debug, Clone)]
pub struct OpThreshold {
    key_in: String,
    key_out: String,
    threshold: f64,
}

impl OpThreshold {
    pub fn new(key_in: impl Into<String>, key_out: impl Into<String>, threshold: f64) -> Self {
        Self {
            key_in: key_in.into(),
            key_out: key_out.into(),
            threshold,
        }
    }
}

impl Op for OpThreshold {
    fn name(&self) -> &str {
        "OpThreshold"
    }

    fn config(&self) -> serde_json::Value {
        json!({ "key_in": self.key_in, "key_out": self.key_out, "threshold": self.threshold })
    }

    fn forward(&self, mut sample: SampleDict, _ctx: &OpContext) -> Result<SampleDict> {
        let x = sample.float(&self.key_in)?;
        sample.set(&self.key_out, Value::Int((x >= self.threshold) as i64))?;
        Ok(sample)
    }
}

/// One-hot encode an integer class index into an `f32` vector
#[derive(Debug, Clone)]
pub struct OpToOneHot {
    key_in: String,
    key_out: String,
    num_classes: usize,
}

impl OpToOneHot {
    pub fn new(key_in: impl Into<String>, key_out: impl Into<String>, num_classes: usize) -> Self {
        Self {
            key_in: key_in.into(),
            key_out: key_out.into(),
            num_classes,
        }
    }
}

impl Op for OpToOneHot {
    fn name(&self) -> &str {
        "OpToOneHot"
    }

    fn config(&self) -> serde_json::Value {
        json!({ "key_in": self.key_in, "key_out": self.key_out, "num_classes": self.num_classes })
    }

    fn forward(&self, mut sample: SampleDict, ctx: &OpContext) -> Result<SampleDict> {
        let class = sample.int(&self.key_in)?;
        if class < 0 || class as usize >= self.num_classes {
            return Err(MedflowError::InvalidLabel {
                sample_id: ctx.sample_id.clone(),
                key: self.key_in.clone(),
                reason: format!("class {} outside [0, {})", class, self.num_classes),
            });
        }
        let mut one_hot = vec![0.0f32; self.num_classes];
        one_hot[class as usize] = 1.0;
        sample.set(&self.key_out, NdArray::from_f32(vec![self.num_classes], one_hot)?)?;
        Ok(sample)
    }
}
