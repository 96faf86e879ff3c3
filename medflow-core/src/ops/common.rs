//! Key-manipulation operators

use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::{Op, OpContext};
use crate::error::{MedflowError, Result};
use crate::sample::{SampleDict, Value, SAMPLE_ID_KEY};

/// Set `key` to a constant value
#[derive(Debug, Clone)]
pub struct OpSet {
    key: String,
    value: Value,
}

impl OpSet {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Op for OpSet {
    fn name(&self) -> &str {
        "OpSet"
    }

    fn config(&self) -> serde_json::Value {
        json!({ "key": self.key, "value": self.value.to_json() })
    }

    fn forward(&self, mut sample: SampleDict, _ctx: &OpContext) -> Result<SampleDict> {
        sample.set(&self.key, self.value.clone())?;
        Ok(sample)
    }
}

/// Copy the value at `key_in` to `key_out`
#[derive(Debug, Clone)]
pub struct OpCopy {
    key_in: String,
    key_out: String,
}

impl OpCopy {
    pub fn new(key_in: impl Into<String>, key_out: impl Into<String>) -> Self {
        Self {
            key_in: key_in.into(),
            key_out: key_out.into(),
        }
    }
}

impl Op for OpCopy {
    fn name(&self) -> &str {
        "OpCopy"
    }

    fn config(&self) -> serde_json::Value {
        json!({ "key_in": self.key_in, "key_out": self.key_out })
    }

    fn forward(&self, mut sample: SampleDict, _ctx: &OpContext) -> Result<SampleDict> {
        let value = sample.value(&self.key_in)?.clone();
        sample.set(&self.key_out, value)?;
        Ok(sample)
    }
}

/// Move the value at `key_in` to `key_out`. Reverse moves it back exactly.
#[derive(Debug, Clone)]
pub struct OpRename {
    key_in: String,
    key_out: String,
}

impl OpRename {
    pub fn new(key_in: impl Into<String>, key_out: impl Into<String>) -> Self {
        Self {
            key_in: key_in.into(),
            key_out: key_out.into(),
        }
    }
}

impl Op for OpRename {
    fn name(&self) -> &str {
        "OpRename"
    }

    fn config(&self) -> serde_json::Value {
        json!({ "key_in": self.key_in, "key_out": self.key_out })
    }

    fn forward(&self, mut sample: SampleDict, _ctx: &OpContext) -> Result<SampleDict> {
        // Validate before removing so a failed set cannot lose the value
        sample.value(&self.key_in)?;
        if let Some(value) = sample.remove(&self.key_in) {
            sample.set(&self.key_out, value)?;
        }
        Ok(sample)
    }

    fn reverse(
        &self,
        mut sample: SampleDict,
        key_to_reverse: &str,
        _key_to_follow: &str,
        _ctx: &OpContext,
    ) -> Result<SampleDict> {
        if key_to_reverse == self.key_out && !sample.contains(&self.key_in) {
            if let Some(value) = sample.remove(&self.key_out) {
                sample.set(&self.key_in, value)?;
            }
        }
        Ok(sample)
    }
}

/// Remove the listed keys. Absent keys are ignored.
#[derive(Debug, Clone)]
pub struct OpDeleteKeys {
    keys: Vec<String>,
}

impl OpDeleteKeys {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl Op for OpDeleteKeys {
    fn name(&self) -> &str {
        "OpDeleteKeys"
    }

    fn config(&self) -> serde_json::Value {
        json!({ "keys": self.keys })
    }

    fn forward(&self, mut sample: SampleDict, _ctx: &OpContext) -> Result<SampleDict> {
        for key in &self.keys {
            sample.remove(key);
        }
        Ok(sample)
    }
}

/// Keep only the listed key paths (and the sample id). A listed key that is
/// missing is an error.
#[derive(Debug, Clone)]
pub struct OpKeepKeyPaths {
    keys: Vec<String>,
}

impl OpKeepKeyPaths {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

impl Op for OpKeepKeyPaths {
    fn name(&self) -> &str {
        "OpKeepKeyPaths"
    }

    fn config(&self) -> serde_json::Value {
        json!({ "keys": self.keys })
    }

    fn forward(&self, sample: SampleDict, _ctx: &OpContext) -> Result<SampleDict> {
        let mut kept = SampleDict::new(sample.sample_id());
        for key in &self.keys {
            if key == SAMPLE_ID_KEY {
                continue;
            }
            kept.set(key, sample.value(key)?.clone())?;
        }
        Ok(kept)
    }
}

/// Look up the value at `key_in` (typically the sample id) in a table and
/// store the result at `key_out`. Used to attach per-patient clinical data.
#[derive(Debug, Clone)]
pub struct OpLookup {
    key_in: String,
    key_out: String,
    table: Arc<BTreeMap<String, Value>>,
}

impl OpLookup {
    pub fn new(
        key_in: impl Into<String>,
        key_out: impl Into<String>,
        table: Arc<BTreeMap<String, Value>>,
    ) -> Self {
        Self {
            key_in: key_in.into(),
            key_out: key_out.into(),
            table,
        }
    }
}

impl Op for OpLookup {
    fn name(&self) -> &str {
        "OpLookup"
    }

    fn config(&self) -> serde_json::Value {
        // Tables can be large; a checksum of their content is enough to
        // invalidate caches when they change.
        let crc = self.table.iter().fold(0u32, |crc, (k, v)| {
            let crc = crc32c::crc32c_append(crc, k.as_bytes());
            crc32c::crc32c_append(crc, v.to_json().to_string().as_bytes())
        });
        json!({
            "key_in": self.key_in,
            "key_out": self.key_out,
            "table_len": self.table.len(),
            "table_crc32c": crc,
        })
    }

    fn forward(&self, mut sample: SampleDict, _ctx: &OpContext) -> Result<SampleDict> {
        let lookup_key = match sample.value(&self.key_in)? {
            Value::Str(s) => s.clone(),
            other => other.to_string(),
        };
        let value = self
            .table
            .get(&lookup_key)
            .cloned()
            .ok_or_else(|| MedflowError::MissingKey {
                key: format!("{}[{}]", self.key_out, lookup_key),
                sample_id: sample.sample_id().to_string(),
            })?;
        sample.set(&self.key_out, value)?;
        Ok(sample)
    }
}

type LambdaFn = dyn Fn(SampleDict, &OpContext) -> Result<SampleDict> + Send + Sync;

/// Wrap a closure as an operator.
///
/// A closure body cannot be fingerprinted, so the cache key uses `name` and
/// `version`; bump `version` whenever the closure's behavior changes.
#[derive(Clone)]
pub struct OpLambda {
    name: String,
    version: u32,
    func: Arc<LambdaFn>,
}

impl OpLambda {
    pub fn new<F>(name: impl Into<String>, version: u32, func: F) -> Self
    where
        F: Fn(SampleDict, &OpContext) -> Result<SampleDict> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            version,
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for OpLambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpLambda")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish()
    }
}

impl Op for OpLambda {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> serde_json::Value {
        json!({ "lambda": self.name, "version": self.version })
    }

    fn forward(&self, sample: SampleDict, ctx: &OpContext) -> Result<SampleDict> {
        (self.func)(sample, ctx)
    }
}
