//! Async runtime management for medflow
//!
//! Provides dual Tokio runtimes: one for file I/O and prefetching, one for
//! pipeline execution.

pub mod executor;
pub mod shutdown;

pub use executor::{PipelineRuntime, RuntimeConfig};
pub use shutdown::ShutdownSignal;
