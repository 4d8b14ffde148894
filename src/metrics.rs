//! Prometheus metrics for the orchestrator.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`record_request`, `record_cache_lookup`, …) are no-ops if `init_metrics`
//! was never called, so the orchestrator is always safe to run.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `ai_requests_total` | Counter | `operation`, `outcome` |
//! | `ai_cache_lookups_total` | Counter | `operation`, `result` |
//! | `ai_errors_total` | Counter | `operation`, `code` |
//! | `ai_tokens_total` | Counter | `model` |
//! | `ai_request_duration_seconds` | Histogram | `operation` |
//! | `ai_queue_depth` | Gauge | |

use crate::OrchestratorError;
use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

/// All Prometheus metrics for the orchestrator, stored in a single
/// [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Registry that owns every descriptor below.
    pub registry: Registry,
    /// Completed operations by outcome (`success`, `cached`, `degraded`, `error`).
    pub requests_total: CounterVec,
    /// Cache lookups by result (`hit`, `miss`).
    pub cache_lookups: CounterVec,
    /// Failures by stable error code.
    pub errors_total: CounterVec,
    /// Upstream tokens consumed per model.
    pub tokens_total: IntCounterVec,
    /// End-to-end latency per operation.
    pub request_duration: HistogramVec,
    /// Items waiting across every queue shard.
    pub queue_depth: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C>(registry: &Registry, collector: C) -> Result<C, OrchestratorError>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| OrchestratorError::Other(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

fn build(prefix: &str) -> Result<Metrics, OrchestratorError> {
    let init_err =
        |e: prometheus::Error| OrchestratorError::Other(format!("metrics init failed: {e}"));
    let registry = Registry::new();

    let requests_total = register(
        &registry,
        CounterVec::new(
            Opts::new(format!("{prefix}requests_total"), "Completed operations by outcome"),
            &["operation", "outcome"],
        )
        .map_err(init_err)?,
    )?;
    let cache_lookups = register(
        &registry,
        CounterVec::new(
            Opts::new(format!("{prefix}cache_lookups_total"), "Cache lookups by result"),
            &["operation", "result"],
        )
        .map_err(init_err)?,
    )?;
    let errors_total = register(
        &registry,
        CounterVec::new(
            Opts::new(format!("{prefix}errors_total"), "Failures by error code"),
            &["operation", "code"],
        )
        .map_err(init_err)?,
    )?;
    let tokens_total = register(
        &registry,
        IntCounterVec::new(
            Opts::new(format!("{prefix}tokens_total"), "Upstream tokens consumed"),
            &["model"],
        )
        .map_err(init_err)?,
    )?;
    let request_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                format!("{prefix}request_duration_seconds"),
                "End-to-end operation latency",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["operation"],
        )
        .map_err(init_err)?,
    )?;
    let queue_depth = register(
        &registry,
        IntGauge::new(format!("{prefix}queue_depth"), "Items waiting across all shards")
            .map_err(init_err)?,
    )?;

    Ok(Metrics {
        registry,
        requests_total,
        cache_lookups,
        errors_total,
        tokens_total,
        request_duration,
        queue_depth,
    })
}

/// Initialise all Prometheus metrics in a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if metric construction or registry
/// registration fails.
pub fn init_metrics() -> Result<(), OrchestratorError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(build("ai_")?);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

/// Record one completed operation and its latency.
pub fn record_request(operation: &str, outcome: &str, latency: Duration) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .requests_total
            .get_metric_with_label_values(&[operation, outcome])
        {
            c.inc();
        }
        if let Ok(h) = m.request_duration.get_metric_with_label_values(&[operation]) {
            h.observe(latency.as_secs_f64());
        }
    }
}

/// Record a cache lookup.
pub fn record_cache_lookup(operation: &str, hit: bool) {
    if let Some(m) = metrics() {
        let result = if hit { "hit" } else { "miss" };
        if let Ok(c) = m
            .cache_lookups
            .get_metric_with_label_values(&[operation, result])
        {
            c.inc();
        }
    }
}

/// Increment the error counter for an operation and error code.
pub fn inc_error(operation: &str, code: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.errors_total.get_metric_with_label_values(&[operation, code]) {
            c.inc();
        }
    }
}

/// Add consumed tokens for `model`.
pub fn add_tokens(model: &str, tokens: u64) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.tokens_total.get_metric_with_label_values(&[model]) {
            c.inc_by(tokens);
        }
    }
}

/// Set the queue depth gauge.
pub fn set_queue_depth(depth: usize) {
    if let Some(m) = metrics() {
        m.queue_depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }
}

/// Gather all registered metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Counter snapshot for the health report.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MetricsSummary {
    /// Request counts keyed by `"operation:outcome"`.
    pub requests_total: HashMap<String, u64>,
    /// Error counts keyed by `"operation:code"`.
    pub errors_total: HashMap<String, u64>,
}

fn label_pair(metric: &prometheus::proto::Metric, a: &str, b: &str) -> String {
    let find = |name: &str| {
        metric
            .get_label()
            .iter()
            .find(|l| l.get_name() == name)
            .map_or("unknown", |l| l.get_value())
            .to_string()
    };
    format!("{}:{}", find(a), find(b))
}

fn summarize(m: &Metrics) -> MetricsSummary {
    let mut summary = MetricsSummary::default();
    for family in m.requests_total.collect() {
        for metric in family.get_metric() {
            summary.requests_total.insert(
                label_pair(metric, "operation", "outcome"),
                metric.get_counter().get_value() as u64,
            );
        }
    }
    for family in m.errors_total.collect() {
        for metric in family.get_metric() {
            summary.errors_total.insert(
                label_pair(metric, "operation", "code"),
                metric.get_counter().get_value() as u64,
            );
        }
    }
    summary
}

/// Structured summary of current counter values.
///
/// Returns a zeroed [`MetricsSummary`] if metrics have not been initialised.
pub fn get_metrics_summary() -> MetricsSummary {
    metrics().map(summarize).unwrap_or_default()
}
