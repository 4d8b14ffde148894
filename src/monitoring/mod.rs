//! # Stage: Monitoring & Alerting
//!
//! ## Responsibility
//! Retain recent per-request metrics in a bounded ring buffer, aggregate them
//! over rolling windows, and drive the alert rule lifecycle.
//!
//! ## Guarantees
//! - Bounded memory: the oldest metric is dropped once the buffer is full
//! - Alerts are evaluated synchronously on every `record_metric`
//! - At most one open alert per rule
//!
//! ## NOT Responsible For
//! - Long-term storage of metrics
//! - Prometheus export (see `metrics`)

pub mod alerts;

pub use alerts::{
    default_rules, Alert, AlertBook, AlertCondition, AlertContext, AlertDispatcher, AlertEvent,
    AlertRule, Severity, TracingDispatcher,
};

use crate::config::MonitoringConfig;
use crate::{OperationKind, SessionId};
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One observed operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AiMetric {
    /// Completion time.
    pub timestamp: DateTime<Local>,
    /// Operation served.
    pub operation: OperationKind,
    /// Model used, or the model that would have been used.
    pub model: String,
    /// Tokens consumed upstream (0 on a cache hit).
    pub tokens: u64,
    /// End-to-end latency in milliseconds.
    pub latency_ms: u64,
    /// USD spent upstream.
    pub cost_usd: f64,
    /// Whether the caller got a result.
    pub success: bool,
    /// Stable error code on failure.
    pub error_type: Option<String>,
    /// Caller session.
    pub session_id: SessionId,
    /// Served from cache.
    pub cache_hit: bool,
}

impl AiMetric {
    /// Successful, uncached metric stamped now.
    pub fn new(operation: OperationKind, model: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            timestamp: Local::now(),
            operation,
            model: model.into(),
            tokens: 0,
            latency_ms: 0,
            cost_usd: 0.0,
            success: true,
            error_type: None,
            session_id,
            cache_hit: false,
        }
    }

    /// Set token usage and cost.
    pub fn with_usage(mut self, tokens: u64, cost_usd: f64) -> Self {
        self.tokens = tokens;
        self.cost_usd = cost_usd;
        self
    }

    /// Set latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = latency.as_millis() as u64;
        self
    }

    /// Mark as failed with `code`.
    pub fn failed(mut self, code: impl Into<String>) -> Self {
        self.success = false;
        self.error_type = Some(code.into());
        self
    }

    /// Mark as a cache hit.
    pub fn cached(mut self) -> Self {
        self.cache_hit = true;
        self
    }

    /// Override the timestamp.
    pub fn at(mut self, timestamp: DateTime<Local>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Aggregates for one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelPerformance {
    /// Requests served.
    pub requests: u64,
    /// Tokens consumed.
    pub tokens: u64,
    /// USD spent.
    pub cost: f64,
    /// Mean latency.
    pub avg_latency_ms: f64,
}

/// Requests in one clock hour.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyBucket {
    /// Start of the hour.
    pub hour_start: DateTime<Local>,
    /// Requests recorded.
    pub requests: u64,
    /// Mean latency.
    pub avg_latency_ms: f64,
}

/// Aggregates over a rolling window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    /// Window length.
    pub window_hours: u32,
    /// Metrics in the window.
    pub total_requests: u64,
    /// Successful fraction; 1.0 on an empty window.
    pub success_rate: f64,
    /// Mean latency; 0 on an empty window.
    pub avg_latency_ms: f64,
    /// Tokens consumed.
    pub total_tokens: u64,
    /// USD spent.
    pub total_cost: f64,
    /// Fraction served from cache.
    pub cache_hit_rate: f64,
    /// Failure count per error code.
    pub error_types: BTreeMap<String, u64>,
    /// Breakdown per model.
    pub by_model: BTreeMap<String, ModelPerformance>,
    /// Per-hour series, oldest first.
    pub hourly: Vec<HourlyBucket>,
}

impl PerformanceMetrics {
    /// Aggregates of an empty window.
    pub fn empty(window_hours: u32) -> Self {
        Self {
            window_hours,
            total_requests: 0,
            success_rate: 1.0,
            avg_latency_ms: 0.0,
            total_tokens: 0,
            total_cost: 0.0,
            cache_hit_rate: 0.0,
            error_types: BTreeMap::new(),
            by_model: BTreeMap::new(),
            hourly: Vec::new(),
        }
    }

    fn aggregate<'a>(window_hours: u32, metrics: impl Iterator<Item = &'a AiMetric>) -> Self {
        let mut out = Self::empty(window_hours);
        let mut successes = 0u64;
        let mut cache_hits = 0u64;
        let mut latency_sum = 0u64;
        let mut model_latency: BTreeMap<String, u64> = BTreeMap::new();
        let mut hours: BTreeMap<DateTime<Local>, (u64, u64)> = BTreeMap::new();

        for m in metrics {
            out.total_requests += 1;
            latency_sum += m.latency_ms;
            out.total_tokens += m.tokens;
            out.total_cost += m.cost_usd;
            if m.success {
                successes += 1;
            }
            if m.cache_hit {
                cache_hits += 1;
            }
            if let Some(code) = &m.error_type {
                *out.error_types.entry(code.clone()).or_default() += 1;
            }

            let model = out.by_model.entry(m.model.clone()).or_default();
            model.requests += 1;
            model.tokens += m.tokens;
            model.cost += m.cost_usd;
            *model_latency.entry(m.model.clone()).or_default() += m.latency_ms;

            let hour = m
                .timestamp
                .duration_trunc(ChronoDuration::hours(1))
                .unwrap_or(m.timestamp);
            let bucket = hours.entry(hour).or_default();
            bucket.0 += 1;
            bucket.1 += m.latency_ms;
        }

        if out.total_requests == 0 {
            return out;
        }
        let n = out.total_requests as f64;
        out.success_rate = successes as f64 / n;
        out.cache_hit_rate = cache_hits as f64 / n;
        out.avg_latency_ms = latency_sum as f64 / n;
        for (name, perf) in out.by_model.iter_mut() {
            let sum = model_latency.get(name).copied().unwrap_or(0);
            perf.avg_latency_ms = sum as f64 / perf.requests.max(1) as f64;
        }
        out.hourly = hours
            .into_iter()
            .map(|(hour_start, (requests, latency))| HourlyBucket {
                hour_start,
                requests,
                avg_latency_ms: latency as f64 / requests.max(1) as f64,
            })
            .collect();
        out
    }
}

/// Overall verdict of [`Monitor::generate_health_report`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No high or critical alerts, success rate on target.
    Healthy,
    /// A high alert is open or success rate is below target.
    Degraded,
    /// A critical alert is open.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        })
    }
}

/// Monitoring view of service health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Verdict.
    pub status: HealthStatus,
    /// Aggregates over the alert window.
    pub performance: PerformanceMetrics,
    /// Open alerts, most severe first.
    pub open_alerts: Vec<Alert>,
    /// Operator hints.
    pub recommendations: Vec<String>,
    /// Report time.
    pub generated_at: DateTime<Local>,
}

struct MonitorState {
    buffer: VecDeque<AiMetric>,
    book: AlertBook,
    monthly_spent: f64,
}

/// Ring buffer plus alert engine.
pub struct Monitor {
    config: MonitoringConfig,
    monthly_budget: f64,
    state: Mutex<MonitorState>,
    dispatcher: Arc<dyn AlertDispatcher>,
}

impl Monitor {
    /// Monitor with the default rules, logging alerts via `tracing`.
    pub fn new(config: &MonitoringConfig, monthly_budget: f64) -> Self {
        Self::with_dispatcher(config, monthly_budget, Arc::new(TracingDispatcher))
    }

    /// Monitor delivering alerts to `dispatcher`.
    pub fn with_dispatcher(
        config: &MonitoringConfig,
        monthly_budget: f64,
        dispatcher: Arc<dyn AlertDispatcher>,
    ) -> Self {
        Self {
            config: config.clone(),
            monthly_budget,
            state: Mutex::new(MonitorState {
                buffer: VecDeque::with_capacity(config.buffer_capacity.min(1_024)),
                book: AlertBook::new(default_rules(config)),
                monthly_spent: 0.0,
            }),
            dispatcher,
        }
    }

    /// Append `metric` and evaluate alerts.
    pub fn record_metric(&self, metric: AiMetric) -> Vec<AlertEvent> {
        let now = Local::now().max(metric.timestamp);
        {
            let mut state = self.state.lock();
            if state.buffer.len() >= self.config.buffer_capacity.max(1) {
                state.buffer.pop_front();
            }
            debug!(
                op = %metric.operation,
                success = metric.success,
                cache_hit = metric.cache_hit,
                latency_ms = metric.latency_ms,
                "metric recorded"
            );
            state.buffer.push_back(metric);
        }
        self.check_alerts_at(now)
    }

    /// Set the month-to-date spend and evaluate alerts.
    pub fn update_spend(&self, monthly_spent: f64) -> Vec<AlertEvent> {
        self.state.lock().monthly_spent = monthly_spent;
        self.check_alerts()
    }

    /// Number of metrics held.
    pub fn buffered(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Aggregates over the last `window_hours`.
    pub fn get_performance_metrics(&self, window_hours: u32) -> PerformanceMetrics {
        self.performance_metrics_at(window_hours, Local::now())
    }

    fn performance_metrics_at(
        &self,
        window_hours: u32,
        now: DateTime<Local>,
    ) -> PerformanceMetrics {
        let since = now - ChronoDuration::hours(i64::from(window_hours));
        let state = self.state.lock();
        PerformanceMetrics::aggregate(
            window_hours,
            state.buffer.iter().filter(|m| m.timestamp >= since),
        )
    }

    /// Evaluate every rule now.
    pub fn check_alerts(&self) -> Vec<AlertEvent> {
        self.check_alerts_at(Local::now())
    }

    fn check_alerts_at(&self, now: DateTime<Local>) -> Vec<AlertEvent> {
        let window = self.config.alert_window_hours.max(1);
        let performance = self.performance_metrics_at(window, now);
        let hour_ago = now - ChronoDuration::hours(1);

        let events = {
            let mut state = self.state.lock();
            let hourly_requests = state
                .buffer
                .iter()
                .filter(|m| m.timestamp >= hour_ago)
                .count() as u64;
            let ctx = AlertContext {
                performance: &performance,
                hourly_requests,
                monthly_spent: state.monthly_spent,
                monthly_budget: self.monthly_budget,
            };
            state.book.evaluate(&ctx, now)
        };

        for event in &events {
            self.dispatcher.dispatch(event);
        }
        events
    }

    /// Add or replace a rule.
    pub fn add_rule(&self, rule: AlertRule) {
        self.state.lock().book.upsert_rule(rule);
    }

    /// Enable or disable a rule. Returns `false` for unknown ids.
    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        self.state.lock().book.set_enabled(rule_id, enabled)
    }

    /// Open alerts, most severe first.
    pub fn open_alerts(&self) -> Vec<Alert> {
        self.state.lock().book.open_alerts()
    }

    /// Recently resolved alerts.
    pub fn alert_history(&self) -> Vec<Alert> {
        self.state.lock().book.history()
    }

    /// Health verdict with recommendations.
    pub fn generate_health_report(&self) -> HealthReport {
        let now = Local::now();
        let performance = self.performance_metrics_at(self.config.alert_window_hours.max(1), now);
        let open_alerts = self.open_alerts();

        let worst = open_alerts.iter().map(|a| a.severity).max();
        let below_target = performance.total_requests > 0
            && performance.success_rate < self.config.success_rate_threshold;
        let status = match worst {
            Some(Severity::Critical) => HealthStatus::Unhealthy,
            Some(Severity::High) => HealthStatus::Degraded,
            _ if below_target => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        };

        let recommendations = self.recommendations(&performance, &open_alerts);
        HealthReport {
            status,
            performance,
            open_alerts,
            recommendations,
            generated_at: now,
        }
    }

    fn recommendations(&self, perf: &PerformanceMetrics, open: &[Alert]) -> Vec<String> {
        let mut out = Vec::new();
        if perf.total_requests > 0 && perf.success_rate < self.config.success_rate_threshold {
            let top_error = perf
                .error_types
                .iter()
                .max_by_key(|(_, count)| **count)
                .map(|(code, _)| code.as_str())
                .unwrap_or("UNKNOWN");
            out.push(format!(
                "Success rate is {:.1}%; most frequent error is {top_error}. \
                 Check provider status and fallback model.",
                perf.success_rate * 100.0
            ));
        }
        if perf.avg_latency_ms > self.config.latency_threshold_ms as f64 {
            out.push(
                "Average latency is high; lower queue concurrency or use a faster model.".into(),
            );
        }
        if perf.total_requests >= 10 && perf.cache_hit_rate < 0.1 {
            out.push(
                "Cache hit rate is below 10%; review cache TTLs and input normalization.".into(),
            );
        }
        if open.iter().any(|a| a.rule_id.starts_with("budget_")) {
            out.push(
                "Monthly budget is running low; cheaper models will be selected automatically."
                    .to_string(),
            );
        }
        if open.iter().any(|a| a.rule_id == "high_request_rate") {
            out.push(
                "Hourly request volume is near capacity; consider tighter per-session limits."
                    .to_string(),
            );
        }
        out
    }

    /// Drop buffered metrics, alerts and spend.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.buffer.clear();
        state.book.clear();
        state.monthly_spent = 0.0;
    }
}
