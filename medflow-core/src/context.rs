//! Process-wide context
//!
//! Built once at startup from a [`MedflowConfig`]: installs logging, starts
//! the runtimes and owns the shared metrics. Torn down explicitly with
//! [`Context::shutdown`], which also stops the cachers and loaders it built.

use std::sync::Arc;
use tracing::info;

use crate::cache::SamplesCacher;
use crate::config::MedflowConfig;
use crate::data::{Collate, DataLoader, Dataset};
use crate::error::Result;
use crate::metrics::PipelineMetrics;
use crate::pipeline::Pipeline;
use crate::runtime::{PipelineRuntime, ShutdownSignal};
use crate::telemetry;

pub struct Context {
    config: MedflowConfig,
    runtime: PipelineRuntime,
    metrics: Arc<PipelineMetrics>,
    shutdown: ShutdownSignal,
}

impl Context {
    pub fn init(config: MedflowConfig) -> Result<Self> {
        config.validate()?;
        telemetry::init_logging(&config.log_filter);

        let runtime = PipelineRuntime::new(config.runtime())?;
        info!(
            "medflow {} started (cache {}/{})",
            crate::VERSION,
            config.cache_dir.display(),
            config.cache_name
        );

        Ok(Self {
            config,
            runtime,
            metrics: Arc::new(PipelineMetrics::new()),
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn config(&self) -> &MedflowConfig {
        &self.config
    }

    pub fn runtime(&self) -> &PipelineRuntime {
        &self.runtime
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Cacher for `pipeline` at the configured location, reporting into the
    /// shared metrics
    pub fn cacher(&self, pipeline: Arc<Pipeline>) -> Result<Arc<SamplesCacher>> {
        let cacher = SamplesCacher::new(
            self.config.cache_name.clone(),
            pipeline,
            self.config.cache_dir.clone(),
            self.config.cacher(),
        )?
        .with_metrics(Arc::clone(&self.metrics))
        .with_shutdown(self.shutdown.clone());
        Ok(Arc::new(cacher))
    }

    /// Loader over `batches` with the configured workers. It stops when the
    /// context shuts down.
    pub fn loader(
        &self,
        dataset: Arc<Dataset>,
        batches: Vec<Vec<usize>>,
        collate: Collate,
    ) -> Result<DataLoader> {
        DataLoader::with_shutdown(
            &self.runtime,
            dataset,
            batches,
            collate,
            self.config.loader(),
            self.shutdown.clone(),
        )
    }

    /// Signal shutdown and stop the runtimes. Must be called outside of any
    /// async context.
    pub fn shutdown(self) {
        self.shutdown.shutdown();
        info!(
            "medflow shutting down: {} cache hits, {} misses, {} samples processed",
            self.metrics.cache_hits.get(),
            self.metrics.cache_misses.get(),
            self.metrics.samples_processed.get()
        );
        self.runtime.shutdown();
    }
}
