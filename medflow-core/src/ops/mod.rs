//! Sample operators
//!
//! An operator is one deterministic step of a pipeline: it takes a sample
//! dictionary and returns the updated dictionary. Operators may add or
//! overwrite keys but never drop unrelated ones (the key-removal operators
//! drop exactly what they are configured to drop).
//!
//! `config()` must describe every parameter that influences `forward`,
//! because the static pipeline's cache fingerprint is derived from it.

pub mod augment;
pub mod common;
pub mod image;
pub mod intensity;
pub mod label;
pub mod npy;

pub use augment::{OpRandomFlip, OpRandomNoise};
pub use common::{
    OpCopy, OpDeleteKeys, OpKeepKeyPaths, OpLambda, OpLookup, OpRename, OpSet,
};
pub use image::{ImageFormat, OpLoadImage};
pub use intensity::{OpClip, OpNormalize, OpStandardize};
pub use label::{OpMapLabel, OpThreshold, OpToOneHot};

use crate::error::Result;
use crate::sample::{SampleDict, Value, OP_INFO_KEY};

/// Per-invocation context handed to an operator
#[derive(Debug, Clone)]
pub struct OpContext {
    /// Position of the operator in its pipeline, `"{pipeline}.{index}"`
    pub op_id: String,
    /// Identifier of the sample being processed
    pub sample_id: String,
}

impl OpContext {
    pub fn new(op_id: impl Into<String>, sample_id: impl Into<String>) -> Self {
        Self {
            op_id: op_id.into(),
            sample_id: sample_id.into(),
        }
    }

    /// Key path where this operator keeps reversal info for the sample
    pub fn info_key(&self) -> String {
        format!("{}.{}", OP_INFO_KEY, self.op_id)
    }

    /// Store reversal info for this operator
    pub fn save_info(&self, sample: &mut SampleDict, info: Value) -> Result<()> {
        sample.set(&self.info_key(), info)
    }

    /// Reversal info stored during `forward`, if any
    pub fn load_info<'s>(&self, sample: &'s SampleDict) -> Option<&'s Value> {
        sample.get(&self.info_key())
    }
}

/// A pipeline step
pub trait Op: Send + Sync {
    /// Operator type name
    fn name(&self) -> &str;

    /// Full parameterisation as JSON; feeds the cache fingerprint
    fn config(&self) -> serde_json::Value;

    /// Apply the operator
    fn forward(&self, sample: SampleDict, ctx: &OpContext) -> Result<SampleDict>;

    /// Undo the operator on `key_to_reverse`, for operators that processed
    /// `key_to_follow`. Best effort; the default leaves the sample untouched.
    fn reverse(
        &self,
        sample: SampleDict,
        _key_to_reverse: &str,
        _key_to_follow: &str,
        _ctx: &OpContext,
    ) -> Result<SampleDict> {
        Ok(sample)
    }
}
