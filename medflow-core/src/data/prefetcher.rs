//! Async batch prefetcher
//!
//! Runs on the I/O runtime, assembling batches ahead of consumption. Each
//! sample of a batch is produced on the compute runtime's blocking pool,
//! then the batch is collated and sent on in sampler order.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::collate::Collate;
use super::dataset::Dataset;
use crate::error::{MedflowError, Result};
use crate::runtime::ShutdownSignal;
use crate::sample::SampleDict;

/// Configuration for the prefetcher
#[derive(Debug, Clone)]
pub struct PrefetcherConfig {
    /// Batches assembled ahead of the consumer
    pub prefetch_batches: usize,
    /// Samples produced concurrently across all batches
    pub num_workers: usize,
}

impl Default for PrefetcherConfig {
    fn default() -> Self {
        Self {
            prefetch_batches: crate::DEFAULT_PREFETCH_BATCHES,
            num_workers: num_cpus::get().max(1),
        }
    }
}

/// Assembles batches ahead of consumption
pub struct Prefetcher {
    sender: mpsc::Sender<Result<SampleDict>>,
    queue: VecDeque<Vec<usize>>,
    dataset: Arc<Dataset>,
    collate: Arc<Collate>,
    compute: Handle,
    workers: Arc<Semaphore>,
    shutdown: ShutdownSignal,
    config: PrefetcherConfig,
}

impl Prefetcher {
    pub fn new(
        sender: mpsc::Sender<Result<SampleDict>>,
        batches: Vec<Vec<usize>>,
        dataset: Arc<Dataset>,
        collate: Collate,
        compute: Handle,
        shutdown: ShutdownSignal,
        config: PrefetcherConfig,
    ) -> Self {
        Self {
            sender,
            queue: VecDeque::from(batches),
            dataset,
            collate: Arc::new(collate),
            compute,
            workers: Arc::new(Semaphore::new(config.num_workers)),
            shutdown,
            config,
        }
    }

    fn spawn_batch(&self, indices: Vec<usize>) -> JoinHandle<Result<SampleDict>> {
        tokio::spawn(assemble_batch(
            Arc::clone(&self.dataset),
            Arc::clone(&self.collate),
            self.compute.clone(),
            Arc::clone(&self.workers),
            indices,
        ))
    }

    /// Run the prefetcher loop until every batch is delivered, the consumer
    /// goes away or shutdown is signalled
    pub async fn run(mut self) {
        debug!("Prefetcher starting with {} batches", self.queue.len());
        let mut in_flight: VecDeque<JoinHandle<Result<SampleDict>>> = VecDeque::new();

        loop {
            while in_flight.len() < self.config.prefetch_batches {
                match self.queue.pop_front() {
                    Some(indices) => in_flight.push_back(self.spawn_batch(indices)),
                    None => break,
                }
            }
            let Some(mut front) = in_flight.pop_front() else {
                break;
            };

            let joined = tokio::select! {
                biased;
                _ = self.shutdown.wait() => None,
                joined = &mut front => Some(joined),
            };
            let Some(joined) = joined else {
                debug!("Prefetcher: shutdown, abandoning {} batches", in_flight.len() + 1);
                front.abort();
                in_flight.iter().for_each(JoinHandle::abort);
                return;
            };

            let batch = joined.unwrap_or_else(|e| {
                Err(MedflowError::Internal {
                    message: format!("batch task failed: {}", e),
                })
            });
            if let Err(e) = &batch {
                warn!("Batch failed: {}", e);
            }
            // A full channel must not hold up shutdown
            let sent = tokio::select! {
                biased;
                _ = self.shutdown.wait() => {
                    debug!("Prefetcher: shutdown while delivering");
                    false
                }
                sent = self.sender.send(batch) => sent.is_ok(),
            };
            if !sent {
                debug!("Prefetcher: stopping with {} batches in flight", in_flight.len());
                in_flight.iter().for_each(JoinHandle::abort);
                return;
            }
        }

        debug!("Prefetcher completed, all batches delivered");
    }
}

/// Produce every sample of one batch and collate them
async fn assemble_batch(
    dataset: Arc<Dataset>,
    collate: Arc<Collate>,
    compute: Handle,
    workers: Arc<Semaphore>,
    indices: Vec<usize>,
) -> Result<SampleDict> {
    let mut handles = Vec::with_capacity(indices.len());
    for index in indices {
        let permit = workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MedflowError::ShutdownInProgress)?;
        let dataset = Arc::clone(&dataset);
        handles.push(compute.spawn_blocking(move || {
            let sample = dataset.get(index);
            drop(permit);
            sample
        }));
    }

    let mut samples = Vec::with_capacity(handles.len());
    for handle in handles {
        let sample = handle.await.map_err(|e| MedflowError::Internal {
            message: format!("sample task failed: {}", e),
        })??;
        samples.push(sample);
    }

    let batch = collate.collate(&samples)?;
    dataset.metrics().batches_collated.inc();
    Ok(batch)
}
