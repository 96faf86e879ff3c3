//! On-disk cache of static pipeline output
//!
//! Provides:
//! - Binary entry codec with crc32c verification
//! - Per-fingerprint manifest
//! - Parallel, at-most-once population

pub mod cacher;
pub mod codec;
pub mod manifest;

pub use cacher::{CacheReport, CacheStats, CacherConfig, EntryStatus, SamplesCacher};
pub use manifest::CacheManifest;
