//! Image loading operator

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::npy::read_npy;
use super::{Op, OpContext};
use crate::error::{MedflowError, Result};
use crate::sample::SampleDict;

/// How to decode the file named by the sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Pick the decoder from the file suffix
    #[default]
    Infer,
    /// NumPy `.npy`
    Npy,
}

impl ImageFormat {
    fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Infer => "infer",
            ImageFormat::Npy => "npy",
        }
    }
}

/// Load the volume whose file name is stored at `key_in` into `key_out`.
///
/// The file is resolved relative to `dir`. Only `.npy` volumes are decoded;
/// NIfTI, DICOM and every other suffix fail with `UnsupportedFormat`.
#[derive(Debug, Clone)]
pub struct OpLoadImage {
    dir: PathBuf,
    key_in: String,
    key_out: String,
    format: ImageFormat,
}

impl OpLoadImage {
    pub fn new(dir: impl Into<PathBuf>, key_in: impl Into<String>, key_out: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            key_in: key_in.into(),
            key_out: key_out.into(),
            format: ImageFormat::Infer,
        }
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }

    fn resolve_format(&self, path: &Path) -> Result<ImageFormat> {
        let suffix = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();

        match (self.format, suffix.as_str()) {
            (ImageFormat::Npy, _) | (ImageFormat::Infer, "npy") => Ok(ImageFormat::Npy),
            (ImageFormat::Infer, other) => Err(MedflowError::UnsupportedFormat {
                path: path.to_path_buf(),
                format: if other.is_empty() { "<none>".into() } else { other.into() },
            }),
        }
    }
}

impl Op for OpLoadImage {
    fn name(&self) -> &str {
        "OpLoadImage"
    }

    fn config(&self) -> serde_json::Value {
        json!({
            "dir": self.dir.to_string_lossy(),
            "key_in": self.key_in,
            "key_out": self.key_out,
            "format": self.format.as_str(),
        })
    }

    fn forward(&self, mut sample: SampleDict, _ctx: &OpContext) -> Result<SampleDict> {
        let path = self.dir.join(sample.str(&self.key_in)?);

        let image = match self.resolve_format(&path)? {
            ImageFormat::Npy => read_npy(&path)?,
            ImageFormat::Infer => {
                return Err(MedflowError::Internal {
                    message: "format resolved to infer".into(),
                })
            }
        };

        debug!(
            "Loaded {} ({:?} {})",
            path.display(),
            image.shape(),
            image.dtype()
        );
        sample.set(&self.key_out, image)?;
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::npy::encode_npy;
    use crate::sample::NdArray;

    #[test]
    fn test_load_npy_volume() {
        let dir = tempfile::tempdir().unwrap();
        let volume = NdArray::from_f32(vec![2, 2, 2], (0..8).map(|v| v as f32).collect()).unwrap();
        std::fs::write(dir.path().join("case_1.npy"), encode_npy(&volume)).unwrap();

        let op = OpLoadImage::new(dir.path(), "data.input.path", "data.input.img");
        let mut sample = SampleDict::new("case_1");
        sample.set("data.input.path", "case_1.npy").unwrap();

        let out = op.forward(sample, &OpContext::new("static.0", "case_1")).unwrap();
        assert_eq!(out.array("data.input.img").unwrap(), &volume);
        assert_eq!(out.str("data.input.path").unwrap(), "case_1.npy");
    }

    #[test]
    fn test_nifti_is_unsupported() {
        let op = OpLoadImage::new("/nonexistent", "path", "img");
        let mut sample = SampleDict::new("s");
        sample.set("path", "scan.nii").unwrap();

        match op.forward(sample, &OpContext::new("p.0", "s")).unwrap_err() {
            MedflowError::UnsupportedFormat { format, .. } => assert_eq!(format, "nii"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_missing_path_key() {
        let op = OpLoadImage::new("/nonexistent", "path", "img");
        let err = op
            .forward(SampleDict::new("s"), &OpContext::new("p.0", "s"))
            .unwrap_err();
        assert!(matches!(err, MedflowError::MissingKey { .. }));
    }
}
