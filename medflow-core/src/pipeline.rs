//! Ordered operator pipelines
//!
//! A pipeline runs its operators strictly in sequence: the output of step
//! *i* is the input of step *i + 1*. The first failure aborts the sample and
//! is returned wrapped with the operator and sample identity. No retries and
//! no partial results.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

use crate::error::{MedflowError, Result};
use crate::ops::{Op, OpContext};
use crate::sample::SampleDict;

/// Serializable identity of a pipeline: name plus ordered operator configs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDescription {
    pub name: String,
    pub steps: Vec<StepDescription>,
}

/// One operator in a [`PipelineDescription`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescription {
    pub op: String,
    pub config: serde_json::Value,
}

impl PipelineDescription {
    /// Canonical JSON; object keys are sorted so equal pipelines serialize
    /// identically.
    pub fn canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 16 hex digit fingerprint over the canonical JSON
    pub fn fingerprint(&self) -> Result<String> {
        let json = self.canonical_json()?;
        let forward = crc32c::crc32c(json.as_bytes());
        let reversed: Vec<u8> = json.bytes().rev().collect();
        let backward = crc32c::crc32c(&reversed);
        Ok(format!("{:08x}{:08x}", forward, backward))
    }
}

/// Named, ordered sequence of operators
#[derive(Clone)]
pub struct Pipeline {
    name: String,
    steps: Vec<Arc<dyn Op>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, steps: Vec<Arc<dyn Op>>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Pipeline with no steps; `run` returns its input
    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }

    /// Append an operator
    pub fn then(mut self, op: impl Op + 'static) -> Self {
        self.steps.push(Arc::new(op));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[Arc<dyn Op>] {
        &self.steps
    }

    fn op_id(&self, index: usize) -> String {
        format!("{}.{}", self.name, index)
    }

    /// Run every step on `sample`
    pub fn run(&self, mut sample: SampleDict) -> Result<SampleDict> {
        let sample_id = sample.sample_id().to_string();

        for (index, op) in self.steps.iter().enumerate() {
            let ctx = OpContext::new(self.op_id(index), sample_id.clone());
            trace!("{} running {} on {}", ctx.op_id, op.name(), sample_id);

            sample = op.forward(sample, &ctx).map_err(|e| MedflowError::Op {
                op: op.name().to_string(),
                op_id: ctx.op_id.clone(),
                sample_id: sample_id.clone(),
                source: Box::new(e),
            })?;
        }

        Ok(sample)
    }

    /// Undo the steps in reverse order for `key_to_reverse`, following the
    /// operators that processed `key_to_follow`
    pub fn reverse(
        &self,
        mut sample: SampleDict,
        key_to_reverse: &str,
        key_to_follow: &str,
    ) -> Result<SampleDict> {
        let sample_id = sample.sample_id().to_string();

        for (index, op) in self.steps.iter().enumerate().rev() {
            let ctx = OpContext::new(self.op_id(index), sample_id.clone());
            sample = op
                .reverse(sample, key_to_reverse, key_to_follow, &ctx)
                .map_err(|e| MedflowError::Op {
                    op: op.name().to_string(),
                    op_id: ctx.op_id.clone(),
                    sample_id: sample_id.clone(),
                    source: Box::new(e),
                })?;
        }

        Ok(sample)
    }

    pub fn describe(&self) -> PipelineDescription {
        PipelineDescription {
            name: self.name.clone(),
            steps: self
                .steps
                .iter()
                .map(|op| StepDescription {
                    op: op.name().to_string(),
                    config: op.config(),
                })
                .collect(),
        }
    }

    /// Fingerprint of name and every operator's configuration
    pub fn fingerprint(&self) -> Result<String> {
        self.describe().fingerprint()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field(
                "steps",
                &self.steps.iter().map(|op| op.name().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Pipelines nest: a pipeline can be a step of another pipeline
impl Op for Pipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> serde_json::Value {
        serde_json::to_value(self.describe()).unwrap_or(serde_json::Value::Null)
    }

    fn forward(&self, sample: SampleDict, _ctx: &OpContext) -> Result<SampleDict> {
        self.run(sample)
    }

    fn reverse(
        &self,
        sample: SampleDict,
        key_to_reverse: &str,
        key_to_follow: &str,
        _ctx: &OpContext,
    ) -> Result<SampleDict> {
        Pipeline::reverse(self, sample, key_to_reverse, key_to_follow)
    }
}
