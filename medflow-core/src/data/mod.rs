//! Dataset, batching and loading
//!
//! Turns sample ids into collated batches: the dataset produces samples,
//! a sampler groups indices and the loader collates them in the background.

pub mod collate;
pub mod dataset;
pub mod loader;
pub mod prefetcher;
pub mod sampler;

pub use collate::{Collate, CollateConfig};
pub use dataset::{describe_sample, Dataset, DatasetSummary, KeySummary};
pub use loader::{DataLoader, LoaderConfig};
pub use prefetcher::{Prefetcher, PrefetcherConfig};
pub use sampler::{BalancedBatchSampler, BatchSampler, SamplerConfig};
