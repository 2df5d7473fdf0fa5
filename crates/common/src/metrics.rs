//! Metrics collection for tabscore
//!
//! This module provides Prometheus metrics for the scoring path.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for tabscore
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub scoring: ScoringMetrics,
    pub models: ModelMetrics,
}

/// Request-level metrics
#[derive(Debug, Clone)]
pub struct ScoringMetrics {
    /// Total number of prediction requests
    pub requests_total: IntCounter,

    /// Total number of successful requests
    pub requests_success: IntCounter,

    /// Total number of failed requests
    pub requests_failed: IntCounter,

    /// End-to-end request duration
    pub request_duration: Histogram,

    /// Transformer duration
    pub transform_duration: Histogram,

    /// Rows scored total
    pub rows_scored_total: IntCounter,

    /// Current active requests
    pub active_requests: IntGauge,
}

/// Model and schema cache metrics
#[derive(Debug, Clone)]
pub struct ModelMetrics {
    /// Model deserializations performed
    pub model_loads: IntCounter,

    /// Model cache hits
    pub model_cache_hits: IntCounter,

    /// Schema file reads
    pub schema_loads: IntCounter,

    /// Model inference duration
    pub inference_duration: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("metric name and help are static and valid")
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("histogram options are static and valid")
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let requests_total = counter(
            "scoring_requests_total",
            "Total number of prediction requests",
        );
        let requests_success = counter(
            "scoring_requests_success_total",
            "Total number of successful prediction requests",
        );
        let requests_failed = counter(
            "scoring_requests_failed_total",
            "Total number of failed prediction requests",
        );
        let request_duration = histogram(
            "scoring_request_duration_seconds",
            "Prediction request duration in seconds",
            vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5],
        );
        let transform_duration = histogram(
            "scoring_transform_duration_seconds",
            "Tabular transformer duration in seconds",
            vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1],
        );
        let rows_scored_total = counter("scoring_rows_total", "Total number of rows scored");
        let active_requests = IntGauge::new(
            "scoring_active_requests",
            "Current number of active prediction requests",
        )
        .expect("gauge name and help are static and valid");

        let model_loads = counter("model_loads_total", "Total number of model deserializations");
        let model_cache_hits =
            counter("model_cache_hits_total", "Total number of model cache hits");
        let schema_loads = counter("schema_loads_total", "Total number of schema file reads");
        let inference_duration = histogram(
            "model_inference_duration_seconds",
            "Model inference duration in seconds",
            vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5],
        );

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(requests_total.clone()),
            Box::new(requests_success.clone()),
            Box::new(requests_failed.clone()),
            Box::new(request_duration.clone()),
            Box::new(transform_duration.clone()),
            Box::new(rows_scored_total.clone()),
            Box::new(active_requests.clone()),
            Box::new(model_loads.clone()),
            Box::new(model_cache_hits.clone()),
            Box::new(schema_loads.clone()),
            Box::new(inference_duration.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .expect("metric names are unique within the registry");
        }

        MetricsRegistry {
            registry,
            scoring: ScoringMetrics {
                requests_total,
                requests_success,
                requests_failed,
                request_duration,
                transform_duration,
                rows_scored_total,
                active_requests,
            },
            models: ModelMetrics {
                model_loads,
                model_cache_hits,
                schema_loads,
                inference_duration,
            },
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        metrics.scoring.requests_total.inc();
        metrics.scoring.active_requests.inc();
        metrics.models.model_cache_hits.inc();

        let output = metrics.gather();
        assert!(output.contains("scoring_requests_total"));
        assert!(output.contains("model_cache_hits_total"));
    }

    #[test]
    fn test_latency_timer() {
        let metrics = MetricsRegistry::new();
        let value = metrics.scoring.transform_duration.time(|| 41 + 1);
        assert_eq!(value, 42);
        assert_eq!(metrics.scoring.transform_duration.get_sample_count(), 1);
    }
}
