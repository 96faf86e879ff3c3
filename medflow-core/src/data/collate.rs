//! Batch collation
//!
//! Merges per-sample dictionaries into one batch dictionary with the same
//! key paths. Arrays are stacked along a new leading batch dimension;
//! numeric scalars become 1-d arrays; anything else becomes a list.
//! Incompatible shapes fail the batch instead of padding or truncating.

use std::collections::BTreeSet;

use crate::error::{MedflowError, Result};
use crate::sample::{NdArray, SampleDict, Value, OP_INFO_KEY};

/// Configuration for [`Collate`]
#[derive(Debug, Clone)]
pub struct CollateConfig {
    /// Key paths (or subtrees) left out of the batch
    pub skip_keys: Vec<String>,
    /// Fail when a key is missing from some samples; otherwise fill `Null`
    pub raise_on_missing_key: bool,
}

impl Default for CollateConfig {
    fn default() -> Self {
        Self {
            skip_keys: vec![OP_INFO_KEY.to_string()],
            raise_on_missing_key: true,
        }
    }
}

/// Sample-to-batch collator
#[derive(Debug, Clone, Default)]
pub struct Collate {
    config: CollateConfig,
}

impl Collate {
    pub fn new(config: CollateConfig) -> Self {
        Self { config }
    }

    fn skipped(&self, key: &str) -> bool {
        self.config.skip_keys.iter().any(|skip| {
            key == skip
                || (key.len() > skip.len()
                    && key.starts_with(skip.as_str())
                    && key.as_bytes()[skip.len()] == b'.')
        })
    }

    /// Merge `samples` into one batch dictionary
    pub fn collate(&self, samples: &[SampleDict]) -> Result<SampleDict> {
        if samples.is_empty() {
            return Err(MedflowError::InvalidConfig {
                reason: "cannot collate an empty batch".into(),
            });
        }

        let keys: BTreeSet<String> = samples
            .iter()
            .flat_map(SampleDict::keypaths)
            .filter(|key| !self.skipped(key))
            .collect();

        let null = Value::Null;
        let mut batch = SampleDict::empty();
        for key in &keys {
            let mut column = Vec::with_capacity(samples.len());
            for sample in samples {
                match sample.get(key) {
                    Some(value) => column.push(value),
                    None if self.config.raise_on_missing_key => {
                        return Err(MedflowError::MissingBatchKey {
                            key: key.clone(),
                            sample_id: sample.sample_id().to_string(),
                        });
                    }
                    None => column.push(&null),
                }
            }
            batch.set(key, collate_column(key, &column)?)?;
        }
        Ok(batch)
    }
}

/// Merge the values of one key across the batch
fn collate_column(key: &str, column: &[&Value]) -> Result<Value> {
    if let Some(arrays) = column.iter().map(|v| v.as_array()).collect::<Option<Vec<&NdArray>>>() {
        return NdArray::stack(key, &arrays).map(Value::Array);
    }

    if let Some(position) = column.iter().position(|v| v.as_array().is_some()) {
        // Some samples hold arrays and some do not
        let other = column
            .iter()
            .find(|v| v.as_array().is_none())
            .map(|v| v.kind())
            .unwrap_or("null");
        return Err(MedflowError::TypeMismatch {
            key: key.to_string(),
            expected: format!("array in every sample (sample {} has one)", position),
            found: other.to_string(),
        });
    }

    let n = column.len();
    if column.iter().all(|v| matches!(v, Value::Int(_) | Value::Bool(_))) {
        let data = column.iter().filter_map(|v| v.as_int()).collect();
        return Ok(Value::Array(NdArray::from_i64(vec![n], data)?));
    }
    if column
        .iter()
        .all(|v| matches!(v, Value::Int(_) | Value::Bool(_) | Value::Float(_)))
    {
        let data = column
            .iter()
            .filter_map(|v| v.as_f64())
            .map(|x| x as f32)
            .collect();
        return Ok(Value::Array(NdArray::from_f32(vec![n], data)?));
    }

    Ok(Value::List(column.iter().map(|v| (*v).clone()).collect()))
}
