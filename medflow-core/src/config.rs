//! Process configuration
//!
//! Plain structs with defaults, overridable from `MEDFLOW_*` environment
//! variables or a JSON file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cache::CacherConfig;
use crate::data::{LoaderConfig, SamplerConfig};
use crate::error::{MedflowError, Result};
use crate::runtime::RuntimeConfig;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MedflowConfig {
    /// Directory holding the input images
    pub data_dir: PathBuf,
    /// Root of the sample cache
    pub cache_dir: PathBuf,
    /// Cacher name; one subdirectory of `cache_dir`
    pub cache_name: String,
    pub cache_workers: usize,
    pub loader_workers: usize,
    pub batch_size: usize,
    /// Drop existing cache entries on first use
    pub restart_cache: bool,
    /// Log filter directive, e.g. `info` or `medflow_core=debug`
    pub log_filter: String,
    pub io_threads: usize,
    pub compute_threads: usize,
}

impl Default for MedflowConfig {
    fn default() -> Self {
        let runtime = RuntimeConfig::default();
        Self {
            data_dir: PathBuf::from("data"),
            cache_dir: PathBuf::from("cache"),
            cache_name: "samples".into(),
            cache_workers: num_cpus::get().max(1),
            loader_workers: num_cpus::get().max(1),
            batch_size: 8,
            restart_cache: false,
            log_filter: "info".into(),
            io_threads: runtime.io_threads,
            compute_threads: runtime.compute_threads,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, current: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| MedflowError::InvalidConfig {
            reason: format!("{}='{}' is not valid", name, raw),
        }),
        Err(_) => Ok(current),
    }
}

fn env_bool(name: &str, current: bool) -> Result<bool> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(MedflowError::InvalidConfig {
                reason: format!("{}='{}' is not a boolean", name, raw),
            }),
        },
        Err(_) => Ok(current),
    }
}

impl MedflowConfig {
    /// Defaults overridden by `MEDFLOW_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().with_env()
    }

    /// Apply `MEDFLOW_*` environment overrides on top of `self`
    pub fn with_env(self) -> Result<Self> {
        let config = Self {
            data_dir: std::env::var_os("MEDFLOW_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(self.data_dir),
            cache_dir: std::env::var_os("MEDFLOW_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(self.cache_dir),
            cache_name: std::env::var("MEDFLOW_CACHE_NAME").unwrap_or(self.cache_name),
            cache_workers: env_parse("MEDFLOW_CACHE_WORKERS", self.cache_workers)?,
            loader_workers: env_parse("MEDFLOW_LOADER_WORKERS", self.loader_workers)?,
            batch_size: env_parse("MEDFLOW_BATCH_SIZE", self.batch_size)?,
            restart_cache: env_bool("MEDFLOW_RESTART_CACHE", self.restart_cache)?,
            log_filter: std::env::var("MEDFLOW_LOG").unwrap_or(self.log_filter),
            io_threads: env_parse("MEDFLOW_IO_THREADS", self.io_threads)?,
            compute_threads: env_parse("MEDFLOW_COMPUTE_THREADS", self.compute_threads)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| MedflowError::io(path, e))?;
        let config: Self = serde_json::from_str(&json).map_err(|e| MedflowError::InvalidConfig {
            reason: format!("{}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("cache_workers", self.cache_workers),
            ("loader_workers", self.loader_workers),
            ("batch_size", self.batch_size),
            ("io_threads", self.io_threads),
            ("compute_threads", self.compute_threads),
        ] {
            if value == 0 {
                return Err(MedflowError::InvalidConfig {
                    reason: format!("{} must be positive", name),
                });
            }
        }
        if self.cache_name.is_empty() {
            return Err(MedflowError::InvalidConfig {
                reason: "cache_name must not be empty".into(),
            });
        }
        Ok(())
    }

    pub fn runtime(&self) -> RuntimeConfig {
        RuntimeConfig {
            io_threads: self.io_threads,
            compute_threads: self.compute_threads,
        }
    }

    pub fn cacher(&self) -> CacherConfig {
        CacherConfig {
            restart_cache: self.restart_cache,
            workers: self.cache_workers,
            ..Default::default()
        }
    }

    pub fn loader(&self) -> LoaderConfig {
        LoaderConfig {
            num_workers: self.loader_workers,
            ..Default::default()
        }
    }

    /// Sampler settings with the configured batch size; balancing is
    /// chosen by the caller
    pub fn sampler(&self) -> SamplerConfig {
        SamplerConfig {
            batch_size: self.batch_size,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_json_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"cache_name": "kits", "batch_size": 4}}"#).unwrap();

        let config = MedflowConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.cache_name, "kits");
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.cacher().workers, config.cache_workers);
    }

    #[test]
    fn test_sampler_and_loader_follow_config() {
        let config = MedflowConfig {
            batch_size: 3,
            loader_workers: 5,
            ..Default::default()
        };
        let sampler = config.sampler();
        assert_eq!(sampler.batch_size, 3);
        assert!(!sampler.shuffle);
        assert_eq!(config.loader().num_workers, 5);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = MedflowConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
