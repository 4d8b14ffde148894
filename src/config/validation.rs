//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`OrchestratorConfig`] that cannot
//! be expressed through the type system alone (range checks, cross-field
//! invariants such as `base_delay_ms ≤ max_delay_ms`).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::OrchestratorConfig;

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "retry.base_delay_ms").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl From<ConfigError> for crate::OrchestratorError {
    fn from(e: ConfigError) -> Self {
        crate::OrchestratorError::ConfigError(e.to_string())
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn is_fraction(v: f64) -> bool {
    (0.0..=1.0).contains(&v)
}

fn is_percentage(v: f64) -> bool {
    (0.0..=100.0).contains(&v)
}

/// Validate all semantic constraints on an [`OrchestratorConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &OrchestratorConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Security ─────────────────────────────────────────────────────
    let sec = &config.security;
    if sec.max_input_chars == 0 {
        errors.push(invalid("security.max_input_chars", 0, "must be at least 1"));
    }
    if sec.requests_per_minute == 0 {
        errors.push(invalid("security.requests_per_minute", 0, "must be at least 1"));
    }
    if sec.requests_per_hour < sec.requests_per_minute {
        errors.push(invalid(
            "security.requests_per_hour",
            sec.requests_per_hour,
            "must be \u{2265} requests_per_minute",
        ));
    }
    if !is_fraction(sec.injection_threshold) {
        errors.push(invalid(
            "security.injection_threshold",
            sec.injection_threshold,
            "must be between 0.0 and 1.0",
        ));
    }

    // ── Cache ────────────────────────────────────────────────────────
    let cache = &config.cache;
    if cache.max_entries == 0 {
        errors.push(invalid("cache.max_entries", 0, "must be at least 1"));
    }
    if cache.sweep_interval_secs == 0 {
        errors.push(invalid("cache.sweep_interval_secs", 0, "must be at least 1 second"));
    }
    if cache.min_input_chars > cache.max_input_chars {
        errors.push(invalid(
            "cache.min_input_chars",
            cache.min_input_chars,
            "must be \u{2264} max_input_chars",
        ));
    }

    // ── Queue ────────────────────────────────────────────────────────
    let queue = &config.queue;
    if queue.shards == 0 {
        errors.push(invalid("queue.shards", 0, "must be at least 1"));
    }
    if queue.max_concurrent == 0 {
        errors.push(invalid("queue.max_concurrent", 0, "must be at least 1"));
    }
    if queue.max_queue_size == 0 {
        errors.push(invalid("queue.max_queue_size", 0, "must be at least 1"));
    }
    if queue.timeout_ms == 0 {
        errors.push(invalid("queue.timeout_ms", 0, "must be at least 1ms"));
    }

    // ── Cost ─────────────────────────────────────────────────────────
    let cost = &config.cost;
    if cost.monthly_budget_usd <= 0.0 {
        errors.push(invalid(
            "cost.monthly_budget_usd",
            cost.monthly_budget_usd,
            "must be greater than zero",
        ));
    }
    if !is_fraction(cost.warning_threshold) {
        errors.push(invalid(
            "cost.warning_threshold",
            cost.warning_threshold,
            "must be between 0.0 and 1.0",
        ));
    }
    if !is_fraction(cost.critical_threshold) || cost.critical_threshold > cost.warning_threshold
    {
        errors.push(invalid(
            "cost.critical_threshold",
            cost.critical_threshold,
            "must be between 0.0 and warning_threshold",
        ));
    }
    for (field, model) in [
        ("cost.premium_model", &cost.premium_model),
        ("cost.balanced_model", &cost.balanced_model),
        ("cost.budget_model", &cost.budget_model),
    ] {
        if model.trim().is_empty() {
            errors.push(invalid(field, "", "model name must not be empty"));
        }
    }

    // ── Retry ────────────────────────────────────────────────────────
    let retry = &config.retry;
    if retry.max_attempts == 0 {
        errors.push(invalid("retry.max_attempts", 0, "must be at least 1"));
    }
    if retry.base_delay_ms > retry.max_delay_ms {
        errors.push(invalid(
            "retry.base_delay_ms",
            retry.base_delay_ms,
            "must be \u{2264} max_delay_ms",
        ));
    }
    if retry.multiplier < 1.0 {
        errors.push(invalid("retry.multiplier", retry.multiplier, "must be at least 1.0"));
    }

    // ── Monitoring ───────────────────────────────────────────────────
    let mon = &config.monitoring;
    if mon.buffer_capacity == 0 {
        errors.push(invalid("monitoring.buffer_capacity", 0, "must be at least 1"));
    }
    if mon.alert_window_hours == 0 {
        errors.push(invalid("monitoring.alert_window_hours", 0, "must be at least 1"));
    }
    if !is_fraction(mon.success_rate_threshold) {
        errors.push(invalid(
            "monitoring.success_rate_threshold",
            mon.success_rate_threshold,
            "must be between 0.0 and 1.0",
        ));
    }
    for (field, pct) in [
        ("monitoring.budget_warning_pct", mon.budget_warning_pct),
        ("monitoring.budget_critical_pct", mon.budget_critical_pct),
        ("monitoring.hourly_rate_pct", mon.hourly_rate_pct),
    ] {
        if !is_percentage(pct) {
            errors.push(invalid(field, pct, "must be between 0 and 100"));
        }
    }

    // ── Provider ─────────────────────────────────────────────────────
    let provider = &config.provider;
    if !(0.0..=2.0).contains(&provider.temperature) {
        errors.push(invalid(
            "provider.temperature",
            provider.temperature,
            "must be between 0.0 and 2.0",
        ));
    }
    if provider.max_tokens == 0 {
        errors.push(invalid("provider.max_tokens", 0, "must be at least 1"));
    }
    if !provider.base_url.starts_with("http://") && !provider.base_url.starts_with("https://") {
        errors.push(invalid(
            "provider.base_url",
            &provider.base_url,
            "must be an http(s) URL",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
