use metrics::{Counter, Gauge, Histogram};
use std::time::Duration;
use tracing::info;

/// Engine-level metrics recorded by the worker pool and job manager.
///
/// Handles are noop until a recorder is installed, so tests and one-shot CLI
/// runs pay nothing for instrumentation.
pub struct EngineMetrics {
    pub items_succeeded: Counter,
    pub items_failed: Counter,
    pub items_reclaimed: Counter,
    pub render_attempts: Counter,
    pub render_retries: Counter,
    pub render_fallbacks: Counter,
    pub render_duration: Histogram,
    pub artifacts_uploaded: Counter,
    pub rate_limit_timeouts: Counter,
    pub items_in_progress: Gauge,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            items_succeeded: Counter::noop(),
            items_failed: Counter::noop(),
            items_reclaimed: Counter::noop(),
            render_attempts: Counter::noop(),
            render_retries: Counter::noop(),
            render_fallbacks: Counter::noop(),
            render_duration: Histogram::noop(),
            artifacts_uploaded: Counter::noop(),
            rate_limit_timeouts: Counter::noop(),
            items_in_progress: Gauge::noop(),
        }
    }

    pub fn record_item(&self, duration: Duration, success: bool) {
        if success {
            self.items_succeeded.increment(1);
        } else {
            self.items_failed.increment(1);
        }
        self.render_duration.record(duration.as_secs_f64());
    }

    pub fn record_attempt(&self, retry: bool) {
        self.render_attempts.increment(1);
        if retry {
            self.render_retries.increment(1);
        }
    }

    pub fn record_fallback(&self) {
        self.render_fallbacks.increment(1);
    }

    pub fn record_upload(&self) {
        self.artifacts_uploaded.increment(1);
    }

    pub fn record_rate_limit_timeout(&self) {
        self.rate_limit_timeouts.increment(1);
    }

    pub fn record_reclaimed(&self, count: usize) {
        self.items_reclaimed.increment(count as u64);
    }

    pub fn set_in_progress(&self, count: usize) {
        self.items_in_progress.set(count as f64);
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install a process-global Prometheus recorder.
///
/// Optional: without it every metric handle stays a noop.
pub fn install_prometheus_recorder() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
    metrics::set_boxed_recorder(Box::new(recorder))?;
    info!("Prometheus metrics recorder installed");
    Ok(())
}
