//! Batch data loader
//!
//! Main consumer interface: iterate collated batches in sampler order while
//! later batches are assembled in the background.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::collate::Collate;
use super::dataset::Dataset;
use super::prefetcher::{Prefetcher, PrefetcherConfig};
use crate::error::{MedflowError, Result};
use crate::runtime::{PipelineRuntime, ShutdownSignal};
use crate::sample::SampleDict;

/// Configuration for the data loader
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Batches assembled ahead of the consumer
    pub prefetch_batches: usize,
    /// Samples produced concurrently
    pub num_workers: usize,
    /// Finished batches buffered for the consumer
    pub channel_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        let prefetch = PrefetcherConfig::default();
        Self {
            prefetch_batches: prefetch.prefetch_batches,
            num_workers: prefetch.num_workers,
            channel_size: 4,
        }
    }
}

/// Async batch loader
///
/// A batch whose sample fails is delivered as an error in its slot; the
/// following batches are unaffected.
pub struct DataLoader {
    receiver: mpsc::Receiver<Result<SampleDict>>,
    shutdown: ShutdownSignal,
    dataset: Arc<Dataset>,
    num_batches: usize,
    batches_loaded: u64,
    prefetch_handle: Option<JoinHandle<()>>,
}

impl DataLoader {
    /// Start loading `batches` (index lists, usually from a sampler)
    pub fn new(
        runtime: &PipelineRuntime,
        dataset: Arc<Dataset>,
        batches: Vec<Vec<usize>>,
        collate: Collate,
        config: LoaderConfig,
    ) -> Result<Self> {
        Self::with_shutdown(runtime, dataset, batches, collate, config, ShutdownSignal::new())
    }

    /// Like [`new`](Self::new), stopping when `shutdown` fires
    pub fn with_shutdown(
        runtime: &PipelineRuntime,
        dataset: Arc<Dataset>,
        batches: Vec<Vec<usize>>,
        collate: Collate,
        config: LoaderConfig,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        if config.prefetch_batches == 0 || config.num_workers == 0 || config.channel_size == 0 {
            return Err(MedflowError::InvalidConfig {
                reason: format!("loader sizes must be positive: {:?}", config),
            });
        }
        if !dataset.is_created() {
            return Err(MedflowError::NotCreated);
        }

        let (sender, receiver) = mpsc::channel(config.channel_size);
        let num_batches = batches.len();

        let prefetcher = Prefetcher::new(
            sender,
            batches,
            Arc::clone(&dataset),
            collate,
            runtime.compute_handle(),
            shutdown.clone(),
            PrefetcherConfig {
                prefetch_batches: config.prefetch_batches,
                num_workers: config.num_workers,
            },
        );
        let prefetch_handle = runtime.spawn_io(prefetcher.run());

        Ok(Self {
            receiver,
            shutdown,
            dataset,
            num_batches,
            batches_loaded: 0,
            prefetch_handle: Some(prefetch_handle),
        })
    }

    /// Next batch, or `None` once every batch has been delivered
    pub async fn next_batch(&mut self) -> Option<Result<SampleDict>> {
        let batch = self.receiver.recv().await?;
        self.batches_loaded += 1;
        Some(batch)
    }

    /// Blocking variant of [`next_batch`](Self::next_batch) for synchronous
    /// training loops. Must not be called from an async context.
    pub fn blocking_next(&mut self) -> Option<Result<SampleDict>> {
        let batch = self.receiver.blocking_recv()?;
        self.batches_loaded += 1;
        Some(batch)
    }

    pub fn batches_loaded(&self) -> u64 {
        self.batches_loaded
    }

    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Signal that stops this loader's prefetcher
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Stop prefetching and wait for the prefetcher. Batches not yet
    /// delivered are dropped.
    pub async fn shutdown(mut self) {
        self.shutdown.shutdown();
        drop(self.receiver);

        if let Some(handle) = self.prefetch_handle.take() {
            let _ = handle.await;
        }

        debug!("DataLoader shutdown complete, loaded {} batches", self.batches_loaded);
    }
}
