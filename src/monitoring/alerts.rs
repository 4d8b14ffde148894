//! Alert rules and their open/resolved lifecycle.
//!
//! A rule is a predicate over aggregated metrics. [`AlertBook::evaluate`]
//! opens an alert when a rule turns true and resolves it when the rule turns
//! false again, so each rule has at most one open alert at a time.

use super::PerformanceMetrics;
use crate::config::MonitoringConfig;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Resolved alerts kept for inspection.
const HISTORY_CAPACITY: usize = 200;

/// Alert severity, least severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Low,
    /// Worth a look.
    Medium,
    /// Service quality is affected.
    High,
    /// Service is failing or about to stop.
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        })
    }
}

/// Everything a rule may look at.
#[derive(Debug, Clone)]
pub struct AlertContext<'a> {
    /// Aggregates over the alert window.
    pub performance: &'a PerformanceMetrics,
    /// Requests recorded in the last hour.
    pub hourly_requests: u64,
    /// USD spent this month.
    pub monthly_spent: f64,
    /// Monthly USD ceiling.
    pub monthly_budget: f64,
}

impl AlertContext<'_> {
    fn budget_pct(&self) -> f64 {
        if self.monthly_budget > 0.0 {
            self.monthly_spent / self.monthly_budget * 100.0
        } else {
            0.0
        }
    }
}

/// Custom predicate signature.
pub type AlertPredicate = Arc<dyn Fn(&AlertContext<'_>) -> bool + Send + Sync>;

/// What a rule checks.
#[derive(Clone)]
pub enum AlertCondition {
    /// Success rate strictly below the value.
    SuccessRateBelow(f64),
    /// Average latency strictly above the value in milliseconds.
    AvgLatencyAbove(u64),
    /// Monthly spend strictly above this percentage of the budget.
    BudgetSpentAbove(f64),
    /// Last-hour requests strictly above `pct` % of `cap`.
    HourlyRequestsAbove {
        /// Percentage of the cap.
        pct: f64,
        /// Expected hourly ceiling.
        cap: u64,
    },
    /// Caller-supplied predicate.
    Custom(AlertPredicate),
}

impl std::fmt::Debug for AlertCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SuccessRateBelow(v) => f.debug_tuple("SuccessRateBelow").field(v).finish(),
            Self::AvgLatencyAbove(v) => f.debug_tuple("AvgLatencyAbove").field(v).finish(),
            Self::BudgetSpentAbove(v) => f.debug_tuple("BudgetSpentAbove").field(v).finish(),
            Self::HourlyRequestsAbove { pct, cap } => f
                .debug_struct("HourlyRequestsAbove")
                .field("pct", pct)
                .field("cap", cap)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl AlertCondition {
    /// Evaluate against `ctx`. Sample-based conditions never hold on an empty window.
    pub fn holds(&self, ctx: &AlertContext<'_>) -> bool {
        let has_samples = ctx.performance.total_requests > 0;
        match self {
            Self::SuccessRateBelow(min) => has_samples && ctx.performance.success_rate < *min,
            Self::AvgLatencyAbove(max_ms) => {
                has_samples && ctx.performance.avg_latency_ms > *max_ms as f64
            }
            Self::BudgetSpentAbove(pct) => ctx.budget_pct() > *pct,
            Self::HourlyRequestsAbove { pct, cap } => {
                ctx.hourly_requests > 0 && ctx.hourly_requests as f64 > *cap as f64 * pct / 100.0
            }
            Self::Custom(predicate) => predicate(ctx),
        }
    }

    fn describe(&self, ctx: &AlertContext<'_>) -> String {
        match self {
            Self::SuccessRateBelow(min) => format!(
                "success rate {:.1}% below {:.1}%",
                ctx.performance.success_rate * 100.0,
                min * 100.0
            ),
            Self::AvgLatencyAbove(max_ms) => format!(
                "average latency {:.0}ms above {max_ms}ms",
                ctx.performance.avg_latency_ms
            ),
            Self::BudgetSpentAbove(pct) => format!(
                "monthly spend ${:.2} is {:.1}% of ${:.2} budget (threshold {pct}%)",
                ctx.monthly_spent,
                ctx.budget_pct(),
                ctx.monthly_budget
            ),
            Self::HourlyRequestsAbove { pct, cap } => format!(
                "{} requests in the last hour, above {pct}% of {cap}",
                ctx.hourly_requests
            ),
            Self::Custom(_) => "custom condition met".to_string(),
        }
    }
}

/// A named condition with a severity.
#[derive(Debug, Clone)]
pub struct AlertRule {
    /// Stable identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Predicate.
    pub condition: AlertCondition,
    /// Severity of alerts raised by this rule.
    pub severity: Severity,
    /// Disabled rules are skipped, and their open alert is resolved.
    pub enabled: bool,
}

impl AlertRule {
    /// Enabled rule.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        condition: AlertCondition,
        severity: Severity,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            condition,
            severity,
            enabled: true,
        }
    }
}

/// Built-in rules.
pub fn default_rules(config: &MonitoringConfig) -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "low_success_rate",
            "Low success rate",
            AlertCondition::SuccessRateBelow(config.success_rate_threshold),
            Severity::High,
        ),
        AlertRule::new(
            "high_latency",
            "High average latency",
            AlertCondition::AvgLatencyAbove(config.latency_threshold_ms),
            Severity::Medium,
        ),
        AlertRule::new(
            "budget_warning",
            "Monthly budget warning",
            AlertCondition::BudgetSpentAbove(config.budget_warning_pct),
            Severity::High,
        ),
        AlertRule::new(
            "budget_critical",
            "Monthly budget critical",
            AlertCondition::BudgetSpentAbove(config.budget_critical_pct),
            Severity::Critical,
        ),
        AlertRule::new(
            "high_request_rate",
            "High hourly request rate",
            AlertCondition::HourlyRequestsAbove {
                pct: config.hourly_rate_pct,
                cap: config.hourly_request_cap,
            },
            Severity::Medium,
        ),
    ]
}

/// One raised alert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    /// Unique alert id.
    pub id: String,
    /// Rule that raised it.
    pub rule_id: String,
    /// Rule name at trigger time.
    pub rule_name: String,
    /// Rule severity at trigger time.
    pub severity: Severity,
    /// Description of the triggering values.
    pub message: String,
    /// When the rule turned true.
    pub triggered_at: DateTime<Local>,
    /// When the rule turned false again.
    pub resolved_at: Option<DateTime<Local>>,
}

impl Alert {
    /// Whether the alert is still open.
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// A lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "alert", rename_all = "lowercase")]
pub enum AlertEvent {
    /// A rule turned true.
    Triggered(Alert),
    /// A rule turned false.
    Resolved(Alert),
}

impl AlertEvent {
    /// The alert carried by this event.
    pub fn alert(&self) -> &Alert {
        match self {
            Self::Triggered(a) | Self::Resolved(a) => a,
        }
    }
}

/// Delivery of alert events.
pub trait AlertDispatcher: Send + Sync {
    /// Deliver one event. Must not block.
    fn dispatch(&self, event: &AlertEvent);
}

/// Logs alert events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDispatcher;

impl AlertDispatcher for TracingDispatcher {
    fn dispatch(&self, event: &AlertEvent) {
        match event {
            AlertEvent::Triggered(a) if a.severity >= Severity::High => error!(
                rule = %a.rule_id,
                severity = %a.severity,
                message = %a.message,
                "alert triggered"
            ),
            AlertEvent::Triggered(a) => warn!(
                rule = %a.rule_id,
                severity = %a.severity,
                message = %a.message,
                "alert triggered"
            ),
            AlertEvent::Resolved(a) => info!(
                rule = %a.rule_id,
                severity = %a.severity,
                "alert resolved"
            ),
        }
    }
}

/// Rules plus their open alerts.
#[derive(Debug, Default)]
pub struct AlertBook {
    rules: Vec<AlertRule>,
    open: HashMap<String, Alert>,
    history: VecDeque<Alert>,
}

impl AlertBook {
    /// Book over `rules`.
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self {
            rules,
            open: HashMap::new(),
            history: VecDeque::new(),
        }
    }

    /// Add or replace a rule by id.
    pub fn upsert_rule(&mut self, rule: AlertRule) {
        match self.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    /// Enable or disable a rule. Returns `false` for unknown ids.
    pub fn set_enabled(&mut self, rule_id: &str, enabled: bool) -> bool {
        match self.rules.iter_mut().find(|r| r.id == rule_id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Configured rules.
    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    /// Currently open alerts, most severe first.
    pub fn open_alerts(&self) -> Vec<Alert> {
        let mut open: Vec<Alert> = self.open.values().cloned().collect();
        open.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.rule_id.cmp(&b.rule_id)));
        open
    }

    /// Recently resolved alerts, oldest first.
    pub fn history(&self) -> Vec<Alert> {
        self.history.iter().cloned().collect()
    }

    /// Evaluate every rule and apply lifecycle transitions.
    pub fn evaluate(&mut self, ctx: &AlertContext<'_>, now: DateTime<Local>) -> Vec<AlertEvent> {
        let mut events = Vec::new();
        for rule in &self.rules {
            let active = rule.enabled && rule.condition.holds(ctx);
            match (active, self.open.contains_key(&rule.id)) {
                (true, false) => {
                    let alert = Alert {
                        id: uuid::Uuid::new_v4().to_string(),
                        rule_id: rule.id.clone(),
                        rule_name: rule.name.clone(),
                        severity: rule.severity,
                        message: rule.condition.describe(ctx),
                        triggered_at: now,
                        resolved_at: None,
                    };
                    self.open.insert(rule.id.clone(), alert.clone());
                    events.push(AlertEvent::Triggered(alert));
                }
                (false, true) => {
                    if let Some(mut alert) = self.open.remove(&rule.id) {
                        alert.resolved_at = Some(now);
                        if self.history.len() >= HISTORY_CAPACITY {
                            self.history.pop_front();
                        }
                        self.history.push_back(alert.clone());
                        events.push(AlertEvent::Resolved(alert));
                    }
                }
                _ => {}
            }
        }
        events
    }

    /// Drop open alerts and history; rules are kept.
    pub fn clear(&mut self) {
        self.open.clear();
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perf(total: u64, success_rate: f64, avg_latency_ms: f64) -> PerformanceMetrics {
        PerformanceMetrics {
            total_requests: total,
            success_rate,
            avg_latency_ms,
            ..PerformanceMetrics::empty(1)
        }
    }

    fn ctx(p: &PerformanceMetrics) -> AlertContext<'_> {
        AlertContext {
            performance: p,
            hourly_requests: p.total_requests,
            monthly_spent: 0.0,
            monthly_budget: 50.0,
        }
    }

    #[test]
    fn test_empty_window_never_fires_sample_rules() {
        let p = perf(0, 0.0, 99_999.0);
        let c = ctx(&p);
        assert!(!AlertCondition::SuccessRateBelow(0.95).holds(&c));
        assert!(!AlertCondition::AvgLatencyAbove(10).holds(&c));
        assert!(!AlertCondition::HourlyRequestsAbove { pct: 90.0, cap: 0 }.holds(&c));
    }

    #[test]
    fn test_budget_thresholds_are_strict() {
        let p = perf(0, 1.0, 0.0);
        let mut c = ctx(&p);
        c.monthly_spent = 40.0; // exactly 80 %
        assert!(!AlertCondition::BudgetSpentAbove(80.0).holds(&c));
        c.monthly_spent = 40.5;
        assert!(AlertCondition::BudgetSpentAbove(80.0).holds(&c));
    }

    #[test]
    fn test_lifecycle_trigger_hold_resolve_retrigger() {
        let mut book = AlertBook::new(vec![AlertRule::new(
            "sr",
            "success",
            AlertCondition::SuccessRateBelow(0.95),
            Severity::High,
        )]);
        let now = Local::now();
        let bad = perf(10, 0.5, 100.0);
        let good = perf(10, 1.0, 100.0);

        let events = book.evaluate(&ctx(&bad), now);
        assert!(matches!(events.as_slice(), [AlertEvent::Triggered(_)]));
        // Still bad: no duplicate.
        assert!(book.evaluate(&ctx(&bad), now).is_empty());
        assert_eq!(book.open_alerts().len(), 1);

        let events = book.evaluate(&ctx(&good), now);
        assert!(matches!(events.as_slice(), [AlertEvent::Resolved(a)] if a.resolved_at.is_some()));
        assert!(book.open_alerts().is_empty());
        assert_eq!(book.history().len(), 1);

        let events = book.evaluate(&ctx(&bad), now);
        assert!(matches!(events.as_slice(), [AlertEvent::Triggered(_)]));
    }

    #[test]
    fn test_disabling_rule_resolves_open_alert() {
        let mut book = AlertBook::new(vec![AlertRule::new(
            "lat",
            "latency",
            AlertCondition::AvgLatencyAbove(100),
            Severity::Medium,
        )]);
        let slow = perf(3, 1.0, 500.0);
        book.evaluate(&ctx(&slow), Local::now());
        assert!(book.set_enabled("lat", false));
        let events = book.evaluate(&ctx(&slow), Local::now());
        assert!(matches!(events.as_slice(), [AlertEvent::Resolved(_)]));
        assert!(!book.set_enabled("missing", true));
    }

    #[test]
    fn test_custom_rule() {
        let mut book = AlertBook::default();
        book.upsert_rule(AlertRule::new(
            "tokens",
            "Token burst",
            AlertCondition::Custom(Arc::new(|c| c.performance.total_tokens > 1_000)),
            Severity::Low,
        ));
        let mut p = perf(1, 1.0, 1.0);
        p.total_tokens = 5_000;
        assert_eq!(book.evaluate(&ctx(&p), Local::now()).len(), 1);
    }

    #[test]
    fn test_default_rules_cover_documented_conditions() {
        let rules = default_rules(&MonitoringConfig::default());
        assert_eq!(rules.len(), 5);
        let critical: Vec<_> = rules.iter().filter(|r| r.severity == Severity::Critical).collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].id, "budget_critical");
    }

    #[test]
    fn test_open_alerts_sorted_by_severity() {
        let mut book = AlertBook::new(default_rules(&MonitoringConfig::default()));
        let p = perf(10, 0.1, 50_000.0);
        let mut c = ctx(&p);
        c.monthly_spent = 49.0;
        book.evaluate(&c, Local::now());
        let open = book.open_alerts();
        assert_eq!(open[0].severity, Severity::Critical);
        assert!(open.windows(2).all(|w| w[0].severity >= w[1].severity));
    }
}
