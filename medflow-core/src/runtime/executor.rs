//! Tokio runtime executor configuration
//!
//! Separate I/O and compute runtimes keep slow disk reads from stalling
//! CPU-bound operator work such as normalization and checksumming.

use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{MedflowError, Result};

/// Configuration for the medflow runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of threads for I/O operations
    pub io_threads: usize,
    /// Number of threads for pipeline execution
    pub compute_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            io_threads: (cpus / 2).max(2),
            compute_threads: cpus.max(2),
        }
    }
}

/// Dual-runtime executor
///
/// Must be created and dropped outside of any async context.
pub struct PipelineRuntime {
    io_runtime: Runtime,
    compute_runtime: Runtime,
    config: RuntimeConfig,
}

impl PipelineRuntime {
    /// Create a new runtime with the given configuration
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        if config.io_threads == 0 || config.compute_threads == 0 {
            return Err(MedflowError::InvalidConfig {
                reason: format!(
                    "runtime needs at least one thread per pool (io={}, compute={})",
                    config.io_threads, config.compute_threads
                ),
            });
        }

        let io_runtime = Builder::new_multi_thread()
            .worker_threads(config.io_threads)
            .thread_name("medflow-io")
            .enable_all()
            .build()
            .map_err(|e| MedflowError::Internal {
                message: format!("Failed to create I/O runtime: {}", e),
            })?;

        let compute_runtime = Builder::new_multi_thread()
            .worker_threads(config.compute_threads)
            .thread_name("medflow-compute")
            .enable_all()
            .build()
            .map_err(|e| MedflowError::Internal {
                message: format!("Failed to create compute runtime: {}", e),
            })?;

        debug!(
            "Runtime started: {} io threads, {} compute threads",
            config.io_threads, config.compute_threads
        );

        Ok(Self {
            io_runtime,
            compute_runtime,
            config,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Spawn an I/O-bound task
    pub fn spawn_io<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.io_runtime.spawn(future)
    }

    /// Run a synchronous pipeline job on the compute runtime's blocking pool
    pub fn spawn_pipeline<F, R>(&self, job: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.compute_runtime.spawn_blocking(job)
    }

    /// Run a future on the I/O runtime, blocking until complete
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.io_runtime.block_on(future)
    }

    /// Get the compute runtime handle
    pub fn compute_handle(&self) -> Handle {
        self.compute_runtime.handle().clone()
    }

    /// Shut down both runtimes
    pub fn shutdown(self) {
        // Compute work is abandoned; cache writes are atomic renames so an
        // interrupted one leaves only a pending file behind
        self.compute_runtime.shutdown_timeout(Duration::from_secs(5));
        self.io_runtime.shutdown_timeout(Duration::from_secs(30));
        debug!("Runtime shut down");
    }
}
