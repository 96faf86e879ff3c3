//! Nested sample dictionary addressed by dotted key paths

use std::collections::BTreeMap;

use super::array::NdArray;
use super::value::Value;
use crate::error::{MedflowError, Result};

/// Key path holding the sample identifier
pub const SAMPLE_ID_KEY: &str = "data.sample_id";

/// Key path prefix under which operators keep per-sample reversal info
pub const OP_INFO_KEY: &str = "_op_info";

/// One data sample threaded through every pipeline stage.
///
/// Keys are dotted paths: `set("data.input.img", ..)` creates the `data`
/// and `input` levels on demand. No schema is enforced; producers and
/// consumers agree on key conventions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleDict {
    root: BTreeMap<String, Value>,
}

impl SampleDict {
    /// Create a sample holding only its identifier
    pub fn new(sample_id: impl Into<String>) -> Self {
        let mut root = BTreeMap::new();
        let mut data = BTreeMap::new();
        data.insert("sample_id".to_string(), Value::Str(sample_id.into()));
        root.insert("data".to_string(), Value::Dict(data));
        Self { root }
    }

    /// An empty dictionary (no sample id), used for batches
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_root(root: BTreeMap<String, Value>) -> Self {
        Self { root }
    }

    pub(crate) fn root(&self) -> &BTreeMap<String, Value> {
        &self.root
    }

    /// Sample identifier, or `"<unknown>"` when absent
    pub fn sample_id(&self) -> &str {
        self.get(SAMPLE_ID_KEY)
            .and_then(Value::as_str)
            .unwrap_or("<unknown>")
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.root.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Dict(map) => map.get(part)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Value> {
        let mut parts = path.split('.');
        let mut current = self.root.get_mut(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Dict(map) => map.get_mut(part)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Insert `value` at `path`, creating intermediate levels.
    ///
    /// Fails if an intermediate level exists and is not a dict, rather than
    /// replacing it.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> Result<()> {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(MedflowError::InvalidConfig {
                reason: format!("invalid key path '{}'", path),
            });
        }

        let (parents, leaf) = match path.rsplit_once('.') {
            Some((parents, leaf)) => (Some(parents), leaf),
            None => (None, path),
        };

        let mut map = &mut self.root;
        if let Some(parents) = parents {
            let mut walked = String::new();
            for segment in parents.split('.') {
                if !walked.is_empty() {
                    walked.push('.');
                }
                walked.push_str(segment);

                let entry = map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Dict(BTreeMap::new()));
                match entry {
                    Value::Dict(inner) => map = inner,
                    other => {
                        return Err(MedflowError::TypeMismatch {
                            key: walked,
                            expected: "dict".into(),
                            found: other.kind().into(),
                        })
                    }
                }
            }
        }

        map.insert(leaf.to_string(), value.into());
        Ok(())
    }

    /// Remove and return the value at `path`
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        match path.rsplit_once('.') {
            None => self.root.remove(path),
            Some((parents, leaf)) => match self.get_mut(parents)? {
                Value::Dict(map) => map.remove(leaf),
                _ => None,
            },
        }
    }

    /// All leaf key paths in sorted order. Empty dicts are not leaves.
    pub fn keypaths(&self) -> Vec<String> {
        fn walk(prefix: &str, map: &BTreeMap<String, Value>, out: &mut Vec<String>) {
            for (key, value) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                match value {
                    Value::Dict(inner) => walk(&path, inner, out),
                    _ => out.push(path),
                }
            }
        }

        let mut out = Vec::new();
        walk("", &self.root, &mut out);
        out
    }

    /// Value at `path` or a `MissingKey` error naming this sample
    pub fn value(&self, path: &str) -> Result<&Value> {
        self.get(path).ok_or_else(|| MedflowError::MissingKey {
            key: path.to_string(),
            sample_id: self.sample_id().to_string(),
        })
    }

    pub fn array(&self, path: &str) -> Result<&NdArray> {
        match self.value(path)? {
            Value::Array(a) => Ok(a),
            other => Err(self.mismatch(path, "array", other)),
        }
    }

    pub fn array_mut(&mut self, path: &str) -> Result<&mut NdArray> {
        let sample_id = self.sample_id().to_string();
        match self.get_mut(path) {
            Some(Value::Array(a)) => Ok(a),
            Some(other) => Err(MedflowError::TypeMismatch {
                key: path.to_string(),
                expected: "array".into(),
                found: other.kind().into(),
            }),
            None => Err(MedflowError::MissingKey {
                key: path.to_string(),
                sample_id,
            }),
        }
    }

    pub fn int(&self, path: &str) -> Result<i64> {
        let value = self.value(path)?;
        value.as_int().ok_or_else(|| self.mismatch(path, "int", value))
    }

    pub fn float(&self, path: &str) -> Result<f64> {
        let value = self.value(path)?;
        value.as_f64().ok_or_else(|| self.mismatch(path, "number", value))
    }

    pub fn str(&self, path: &str) -> Result<&str> {
        let value = self.value(path)?;
        value.as_str().ok_or_else(|| self.mismatch(path, "string", value))
    }

    fn mismatch(&self, path: &str, expected: &str, found: &Value) -> MedflowError {
        MedflowError::TypeMismatch {
            key: path.to_string(),
            expected: expected.to_string(),
            found: found.kind().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_set_and_get() {
        let mut sample = SampleDict::new("case_00001");
        sample.set("data.input.clinical.age", 54i64).unwrap();
        sample.set("data.gt.label", 1i64).unwrap();

        assert_eq!(sample.sample_id(), "case_00001");
        assert_eq!(sample.int("data.input.clinical.age").unwrap(), 54);
        assert_eq!(
            sample.keypaths(),
            vec!["data.gt.label", "data.input.clinical.age", "data.sample_id"]
        );
    }

    #[test]
    fn test_set_refuses_to_clobber_leaf() {
        let mut sample = SampleDict::new("s");
        sample.set("data.label", 1i64).unwrap();
        let err = sample.set("data.label.sub", 2i64).unwrap_err();
        assert!(matches!(err, MedflowError::TypeMismatch { .. }));
        assert_eq!(sample.int("data.label").unwrap(), 1);
    }

    #[test]
    fn test_missing_key_names_sample() {
        let sample = SampleDict::new("s7");
        match sample.array("data.img").unwrap_err() {
            MedflowError::MissingKey { key, sample_id } => {
                assert_eq!(key, "data.img");
                assert_eq!(sample_id, "s7");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_remove_nested() {
        let mut sample = SampleDict::new("s");
        sample.set("a.b", "x").unwrap();
        assert_eq!(sample.remove("a.b"), Some(Value::from("x")));
        assert!(!sample.contains("a.b"));
        assert!(sample.remove("a.b.c").is_none());
    }

    #[test]
    fn test_invalid_paths() {
        let mut sample = SampleDict::empty();
        assert!(sample.set("", 1i64).is_err());
        assert!(sample.set("a..b", 1i64).is_err());
    }
}
