//! Pipeline metrics
//!
//! Cache, dataset and loader counters on atomics, exported in the Prometheus
//! text format.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Upper bounds in seconds for per-sample pipeline latency
const LATENCY_BUCKETS: [f64; 11] = [0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 10.0, 60.0];

fn write_header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = write!(out, "# HELP {name} {help}\n# TYPE {name} {kind}\n");
}

/// Monotonic count
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String) {
        write_header(out, self.name, self.help, "counter");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Level that rises and falls with work in progress
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicI64,
}

impl Gauge {
    const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicI64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String) {
        write_header(out, self.name, self.help, "gauge");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Latency distribution over [`LATENCY_BUCKETS`]
///
/// Bucket counts are cumulative, as the exposition format expects. The sum
/// is kept in whole microseconds.
pub struct LatencyHistogram {
    name: &'static str,
    help: &'static str,
    buckets: [AtomicU64; LATENCY_BUCKETS.len()],
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, seconds: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((seconds * 1e6) as u64, Ordering::Relaxed);
        for (bound, bucket) in LATENCY_BUCKETS.iter().zip(&self.buckets) {
            if seconds <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Run `f` and record how long it took
    pub fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn render(&self, out: &mut String) {
        write_header(out, self.name, self.help, "histogram");
        for (bound, bucket) in LATENCY_BUCKETS.iter().zip(&self.buckets) {
            let _ = writeln!(
                out,
                "{}_bucket{{le=\"{}\"}} {}",
                self.name,
                bound,
                bucket.load(Ordering::Relaxed)
            );
        }
        let count = self.count();
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1e6;
        let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", self.name, count);
        let _ = writeln!(out, "{}_sum {}", self.name, sum);
        let _ = writeln!(out, "{}_count {}", self.name, count);
    }
}

/// Metrics shared by the cacher, dataset and loader
pub struct PipelineMetrics {
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_corrupt: Counter,
    pub cache_bytes_written: Counter,
    pub samples_processed: Counter,
    pub batches_collated: Counter,
    /// Samples being cached right now
    pub samples_in_flight: Gauge,
    pub static_pipeline_duration: LatencyHistogram,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            cache_hits: Counter::new("medflow_cache_hits_total", "Samples served from the cache"),
            cache_misses: Counter::new(
                "medflow_cache_misses_total",
                "Samples computed by the static pipeline",
            ),
            cache_corrupt: Counter::new(
                "medflow_cache_corrupt_total",
                "Corrupt cache entries and manifests discarded",
            ),
            cache_bytes_written: Counter::new(
                "medflow_cache_bytes_written_total",
                "Bytes written to cache entries",
            ),
            samples_processed: Counter::new(
                "medflow_samples_processed_total",
                "Samples returned by the dataset",
            ),
            batches_collated: Counter::new(
                "medflow_batches_collated_total",
                "Batches produced by the collator",
            ),
            samples_in_flight: Gauge::new(
                "medflow_samples_in_flight",
                "Samples currently being cached",
            ),
            static_pipeline_duration: LatencyHistogram::new(
                "medflow_static_pipeline_duration_seconds",
                "Static pipeline latency per sample",
            ),
        }
    }

    /// All metrics in the Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        for counter in [
            &self.cache_hits,
            &self.cache_misses,
            &self.cache_corrupt,
            &self.cache_bytes_written,
            &self.samples_processed,
            &self.batches_collated,
        ] {
            counter.render(&mut out);
        }
        self.samples_in_flight.render(&mut out);
        self.static_pipeline_duration.render(&mut out);
        out
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let metrics = PipelineMetrics::new();
        let histogram = &metrics.static_pipeline_duration;
        histogram.observe(0.002);
        histogram.observe(0.2);
        histogram.observe(120.0);

        let mut text = String::new();
        histogram.render(&mut text);
        let name = "medflow_static_pipeline_duration_seconds";
        assert!(text.contains(&format!("{name}_bucket{{le=\"0.001\"}} 0")));
        assert!(text.contains(&format!("{name}_bucket{{le=\"0.005\"}} 1")));
        assert!(text.contains(&format!("{name}_bucket{{le=\"60\"}} 2")));
        assert!(text.contains(&format!("{name}_bucket{{le=\"+Inf\"}} 3")));
        assert!(text.contains(&format!("{name}_count 3")));
    }

    #[test]
    fn test_export_reflects_activity() {
        let metrics = PipelineMetrics::new();
        metrics.cache_hits.inc_by(3);
        metrics.samples_in_flight.inc();
        metrics.samples_in_flight.inc();
        metrics.samples_in_flight.dec();
        assert_eq!(metrics.static_pipeline_duration.time(|| 7), 7);

        let text = metrics.to_prometheus();
        assert!(text.contains("# TYPE medflow_cache_hits_total counter\n"));
        assert!(text.contains("medflow_cache_hits_total 3\n"));
        assert!(text.contains("medflow_samples_in_flight 1\n"));
        assert!(text.contains("medflow_static_pipeline_duration_seconds_count 1\n"));
        assert_eq!(text.matches("# TYPE").count(), 8);
    }
}
