//! medflow core - sample pipelines for medical imaging
//!
//! This crate provides:
//! - Sample dictionaries addressed by dotted key paths
//! - Operators and ordered pipelines with reverse support
//! - A fingerprint-keyed disk cache for static pipeline output
//! - Datasets, class-balanced batch sampling and collation
//! - A background batch loader on dual Tokio runtimes

pub mod cache;
pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod metrics;
pub mod ops;
pub mod pipeline;
pub mod runtime;
pub mod sample;
pub mod telemetry;

pub use cache::{CacheReport, CacherConfig, SamplesCacher};
pub use config::MedflowConfig;
pub use context::Context;
pub use data::{BalancedBatchSampler, BatchSampler, Collate, DataLoader, Dataset};
pub use error::{MedflowError, Result};
pub use pipeline::Pipeline;
pub use runtime::PipelineRuntime;
pub use sample::{NdArray, SampleDict, Value};

/// Crate version, logged at startup
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default number of batches assembled ahead of the consumer
pub const DEFAULT_PREFETCH_BATCHES: usize = 2;
