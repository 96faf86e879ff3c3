//! Cache manifest file handling
//!
//! Each fingerprint directory holds a `pipeline.json` describing the static
//! pipeline that produced its entries. It lets a reader tell which pipeline
//! a directory belongs to without re-deriving the fingerprint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MedflowError, Result};
use crate::pipeline::PipelineDescription;

/// Cache manifest - identifies the pipeline behind a fingerprint directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheManifest {
    /// Manifest version for compatibility
    pub version: u32,
    /// Cacher name
    pub cacher_name: String,
    /// Static pipeline fingerprint
    pub fingerprint: String,
    /// Static pipeline description
    pub pipeline: PipelineDescription,
    /// Creation time of the fingerprint directory
    pub created_at: DateTime<Utc>,
}

impl CacheManifest {
    /// Current manifest version
    pub const CURRENT_VERSION: u32 = 1;

    /// File name inside the fingerprint directory
    pub const FILE_NAME: &'static str = "pipeline.json";

    pub fn new(cacher_name: String, fingerprint: String, pipeline: PipelineDescription) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            cacher_name,
            fingerprint,
            pipeline,
            created_at: Utc::now(),
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| MedflowError::ManifestInvalid {
            reason: format!("Serialization failed: {}", e),
        })
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let manifest: Self =
            serde_json::from_str(json).map_err(|e| MedflowError::ManifestInvalid {
                reason: format!("Deserialization failed: {}", e),
            })?;

        if manifest.version > Self::CURRENT_VERSION {
            return Err(MedflowError::ManifestVersion {
                found: manifest.version,
                supported: Self::CURRENT_VERSION,
            });
        }

        Ok(manifest)
    }

    /// Check the manifest belongs to the expected cacher and fingerprint
    pub fn validate(&self, cacher_name: &str, fingerprint: &str) -> Result<()> {
        if self.cacher_name != cacher_name {
            return Err(MedflowError::ManifestInvalid {
                reason: format!(
                    "manifest belongs to cacher '{}', expected '{}'",
                    self.cacher_name, cacher_name
                ),
            });
        }
        if self.fingerprint != fingerprint {
            return Err(MedflowError::ManifestInvalid {
                reason: format!(
                    "manifest fingerprint {} does not match directory {}",
                    self.fingerprint, fingerprint
                ),
            });
        }
        let recomputed = self.pipeline.fingerprint()?;
        if recomputed != self.fingerprint {
            return Err(MedflowError::ManifestInvalid {
                reason: format!(
                    "stored pipeline hashes to {}, manifest says {}",
                    recomputed, self.fingerprint
                ),
            });
        }
        Ok(())
    }

    /// Manifest path inside a fingerprint directory
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(Self::FILE_NAME)
    }

    /// Read and validate the manifest in `dir`, if one exists
    pub fn load(dir: &Path, cacher_name: &str, fingerprint: &str) -> Result<Option<Self>> {
        let path = Self::path_in(dir);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MedflowError::io(path, e)),
        };
        let manifest = Self::from_json(&json)?;
        manifest.validate(cacher_name, fingerprint)?;
        Ok(Some(manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::OpClip;
    use crate::pipeline::Pipeline;

    fn manifest() -> CacheManifest {
        let pipeline = Pipeline::empty("static").then(OpClip::new("img", 0.0, 1.0));
        let fingerprint = pipeline.fingerprint().unwrap();
        CacheManifest::new("kits".into(), fingerprint, pipeline.describe())
    }

    #[test]
    fn test_manifest_roundtrip() {
        let original = manifest();
        let json = original.to_json().unwrap();
        let restored = CacheManifest::from_json(&json).unwrap();

        assert_eq!(restored.pipeline, original.pipeline);
        restored.validate("kits", &original.fingerprint).unwrap();
    }

    #[test]
    fn test_manifest_rejects_foreign_fingerprint() {
        let m = manifest();
        assert!(m.validate("kits", "0000000000000000").is_err());
        assert!(m.validate("other", &m.fingerprint).is_err());
    }

    #[test]
    fn test_manifest_rejects_future_version() {
        let mut m = manifest();
        m.version = CacheManifest::CURRENT_VERSION + 1;
        let json = serde_json::to_string(&m).unwrap();
        let err = CacheManifest::from_json(&json).unwrap_err();
        assert!(matches!(err, MedflowError::ManifestVersion { .. }));
        assert!(!err.is_corruption());

        let err = CacheManifest::from_json("{trunc").unwrap_err();
        assert!(err.is_corruption());
    }
}
