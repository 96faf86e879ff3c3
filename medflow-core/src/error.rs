//! Error types for medflow
//!
//! One taxonomy for sample access, operators, the on-disk cache,
//! collation and runtime failures.

use std::path::PathBuf;
use thiserror::Error;

/// Primary error type for all medflow operations
#[derive(Debug, Error)]
pub enum MedflowError {
    // ========== Sample Errors ==========

    /// Required key is absent from a sample dictionary
    #[error("Missing key '{key}' in sample {sample_id}")]
    MissingKey { key: String, sample_id: String },

    /// Key exists but holds a value of the wrong kind
    #[error("Key '{key}': expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: String,
        found: String,
    },

    /// Array shape does not match its element count
    #[error("Invalid array shape {shape:?} for {len} elements")]
    InvalidShape { shape: Vec<usize>, len: usize },

    // ========== Load Errors ==========

    /// File format cannot be loaded
    #[error("Unsupported format '{format}' for {path}")]
    UnsupportedFormat { path: PathBuf, format: String },

    /// File has a supported suffix but could not be decoded
    #[error("Failed to decode {path}: {reason}")]
    ImageDecode { path: PathBuf, reason: String },

    /// Filesystem operation failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ========== Cache Errors ==========

    /// Cache entry is truncated or malformed
    #[error("Corrupt cache entry {path}: {reason}")]
    CacheCorrupt { path: PathBuf, reason: String },

    /// Checksum mismatch on cache read
    #[error("Checksum mismatch for {path}: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    /// Cache manifest validation failed
    #[error("Cache manifest invalid: {reason}")]
    ManifestInvalid { reason: String },

    /// Cache written by a newer format; never overwritten
    #[error("Cache manifest version {found} is newer than supported {supported}")]
    ManifestVersion { found: u32, supported: u32 },

    /// JSON (de)serialization failed
    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    // ========== Batch Errors ==========

    /// Arrays under the same key have different shapes
    #[error("Shape mismatch for '{key}' at batch position {sample_index}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        found: Vec<usize>,
        sample_index: usize,
    },

    /// Key present in some samples of a batch but not all
    #[error("Key '{key}' missing from sample {sample_id} in batch")]
    MissingBatchKey { key: String, sample_id: String },

    /// Class label outside the balancing range
    #[error("Invalid label for sample {sample_id} at '{key}': {reason}")]
    InvalidLabel {
        sample_id: String,
        key: String,
        reason: String,
    },

    // ========== Pipeline Errors ==========

    /// Operator failed; wraps the underlying error with its context
    #[error("Op {op} ({op_id}) failed on sample {sample_id}: {source}")]
    Op {
        op: String,
        op_id: String,
        sample_id: String,
        #[source]
        source: Box<MedflowError>,
    },

    // ========== Dataset / Config Errors ==========

    /// Invalid configuration
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Dataset accessed before create()
    #[error("Dataset not created; call create() first")]
    NotCreated,

    /// Index past the end of the dataset
    #[error("Index {index} out of range for dataset of {len} samples")]
    IndexOutOfRange { index: usize, len: usize },

    // ========== Runtime Errors ==========

    /// Shutdown in progress
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl MedflowError {
    /// Build an I/O error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MedflowError::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true if this error means stored bytes cannot be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            MedflowError::CacheCorrupt { .. }
                | MedflowError::ChecksumMismatch { .. }
                | MedflowError::ManifestInvalid { .. }
        )
    }

    /// Returns true if retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            MedflowError::Io { .. } => true,
            MedflowError::Op { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Innermost error, skipping operator context
    pub fn root_cause(&self) -> &MedflowError {
        match self {
            MedflowError::Op { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for MedflowError {
    fn from(e: serde_json::Error) -> Self {
        MedflowError::Serialization {
            reason: e.to_string(),
        }
    }
}

/// Result type alias for medflow operations
pub type Result<T> = std::result::Result<T, MedflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_op_context() {
        let inner = MedflowError::MissingKey {
            key: "img".into(),
            sample_id: "s1".into(),
        };
        let wrapped = MedflowError::Op {
            op: "OpNormalize".into(),
            op_id: "static.1".into(),
            sample_id: "s1".into(),
            source: Box::new(inner),
        };

        assert!(matches!(wrapped.root_cause(), MedflowError::MissingKey { .. }));
        assert!(wrapped.to_string().contains("static.1"));
        assert!(!wrapped.is_corruption());
    }

    #[test]
    fn test_corruption_classification() {
        let err = MedflowError::ChecksumMismatch {
            path: "a.msc".into(),
            expected: 1,
            actual: 2,
        };
        assert!(err.is_corruption());
        assert!(!err.is_retryable());
    }
}
