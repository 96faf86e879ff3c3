//! Cache population binary
//!
//! Lists the `.npy` volumes in the data directory, runs the static
//! load-and-normalize pipeline over them and stores the results in the
//! sample cache. Configuration comes from `MEDFLOW_*` variables, optionally
//! on top of a JSON file given as the first argument.

use medflow_core::ops::{OpLoadImage, OpNormalize};
use medflow_core::sample::SAMPLE_ID_KEY;
use medflow_core::{Context, Dataset, MedflowConfig, MedflowError, Pipeline};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

fn list_volumes(dir: &Path) -> Result<Vec<String>, MedflowError> {
    let entries = std::fs::read_dir(dir).map_err(|e| MedflowError::io(dir, e))?;
    let mut ids = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| MedflowError::io(dir, e))?.path();
        let is_npy = path
            .extension()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.eq_ignore_ascii_case("npy"));
        if let (true, Some(name)) = (is_npy, path.file_name().and_then(|n| n.to_str())) {
            ids.push(name.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

fn run(context: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let config = context.config();

    let ids = list_volumes(&config.data_dir)?;
    if ids.is_empty() {
        warn!("No .npy volumes found in {}", config.data_dir.display());
    }
    info!("Found {} volumes in {}", ids.len(), config.data_dir.display());

    let pipeline = Arc::new(
        Pipeline::empty("static")
            .then(OpLoadImage::new(&config.data_dir, SAMPLE_ID_KEY, "data.input.img"))
            .then(OpNormalize::new("data.input.img")),
    );
    let cacher = context.cacher(Arc::clone(&pipeline))?;
    info!("Static pipeline fingerprint {}", cacher.fingerprint());

    let dataset = Dataset::new(ids, pipeline, None, Some(cacher))?;
    let runtime = context.runtime();
    let report = runtime.block_on(dataset.create(runtime))?;
    print!("{}", report);

    if !dataset.is_empty() {
        print!("{}", dataset.summary(&["data.input.img"])?);
    }
    debug!("Metrics:\n{}", context.metrics().to_prometheus());

    if !report.is_complete() {
        return Err(format!("{} of {} samples failed", report.failures.len(), report.total).into());
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => MedflowConfig::from_json_file(path)?.with_env()?,
        None => MedflowConfig::from_env()?,
    };

    let context = Context::init(config)?;
    let result = run(&context);
    if let Err(e) = &result {
        error!("Cache population failed: {}", e);
    }
    context.shutdown();
    result
}
