//! # Stage: Declarative Orchestrator Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML configuration that sizes every component:
//! security limits, cache tiers, queue shards, budget ceilings, retry
//! backoff, alert thresholds and the provider endpoint.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `OrchestratorConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Complete defaults: an empty file yields [`OrchestratorConfig::default()`]
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building components from config (that belongs to `orchestrator`)
//! - Reading API keys (the provider reads the variable named in `provider.api_key_env`)

pub mod loader;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Default value functions ──────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_max_input_chars() -> usize {
    15_000
}

fn default_requests_per_minute() -> u32 {
    10
}

fn default_requests_per_hour() -> u32 {
    100
}

fn default_session_daily_tokens() -> u64 {
    100_000
}

fn default_injection_threshold() -> f64 {
    0.5
}

fn default_cache_max_entries() -> usize {
    1_000
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_analysis_ttl_secs() -> u64 {
    24 * 3600
}

fn default_generation_ttl_secs() -> u64 {
    6 * 3600
}

fn default_optimization_ttl_secs() -> u64 {
    2 * 3600
}

fn default_min_cache_input_chars() -> usize {
    10
}

fn default_min_cache_output_chars() -> usize {
    20
}

fn default_max_cache_input_chars() -> usize {
    10_000
}

fn default_shards() -> usize {
    2
}

fn default_max_concurrent() -> usize {
    3
}

fn default_max_queue_size() -> usize {
    100
}

fn default_queue_timeout_ms() -> u64 {
    60_000
}

fn default_queue_max_retries() -> u32 {
    1
}

fn default_priority() -> u8 {
    5
}

fn default_daily_token_limit() -> u64 {
    50_000
}

fn default_monthly_budget_usd() -> f64 {
    50.0
}

fn default_warning_threshold() -> f64 {
    0.20
}

fn default_critical_threshold() -> f64 {
    0.05
}

fn default_premium_model() -> String {
    "anthropic/claude-3.5-sonnet".to_string()
}

fn default_balanced_model() -> String {
    "openai/gpt-4o-mini".to_string()
}

fn default_budget_model() -> String {
    "meta-llama/llama-3.1-8b-instruct".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_alert_window_hours() -> u32 {
    1
}

fn default_success_rate_threshold() -> f64 {
    0.95
}

fn default_latency_threshold_ms() -> u64 {
    10_000
}

fn default_budget_warning_pct() -> f64 {
    80.0
}

fn default_budget_critical_pct() -> f64 {
    95.0
}

fn default_hourly_rate_pct() -> f64 {
    90.0
}

fn default_hourly_request_cap() -> u64 {
    1_000
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_api_key_env() -> String {
    "AI_API_KEY".to_string()
}

fn default_provider_timeout_ms() -> u64 {
    30_000
}

fn default_max_tokens() -> u32 {
    1_024
}

fn default_temperature() -> f32 {
    0.7
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for an orchestrator instance.
///
/// Every section is optional in TOML; missing sections take their defaults.
///
/// # Example
///
/// ```toml
/// [queue]
/// shards = 4
/// max_concurrent = 2
///
/// [cost]
/// monthly_budget_usd = 120.0
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct OrchestratorConfig {
    /// Input validation, sanitization and per-session limits.
    #[serde(default)]
    pub security: SecurityConfig,
    /// Response cache sizing and TTL tiers.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Queue shards, concurrency and timeouts.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Budget ceilings and model tiers.
    #[serde(default)]
    pub cost: CostConfig,
    /// Retry backoff for upstream calls.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Metric buffer and alert thresholds.
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    /// Generation provider endpoint.
    #[serde(default)]
    pub provider: ProviderConfig,
}

// ── Security ─────────────────────────────────────────────────────────────

/// Security validator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SecurityConfig {
    /// Maximum accepted input length in characters.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    /// Requests allowed per session per minute.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Requests allowed per session per hour.
    #[serde(default = "default_requests_per_hour")]
    pub requests_per_hour: u32,
    /// Token allowance per session over a rolling 24 h window.
    #[serde(default = "default_session_daily_tokens")]
    pub session_daily_tokens: u64,
    /// Confidence above which a prompt is treated as an injection attempt.
    #[serde(default = "default_injection_threshold")]
    pub injection_threshold: f64,
    /// Reject requests whose injection confidence exceeds the threshold.
    #[serde(default = "default_true")]
    pub block_on_injection: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_input_chars: default_max_input_chars(),
            requests_per_minute: default_requests_per_minute(),
            requests_per_hour: default_requests_per_hour(),
            session_daily_tokens: default_session_daily_tokens(),
            injection_threshold: default_injection_threshold(),
            block_on_injection: true,
        }
    }
}

// ── Cache ────────────────────────────────────────────────────────────────

/// Response cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CacheConfig {
    /// Maximum entries held before the oldest is evicted.
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    /// Interval between background sweeps of expired entries.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Base TTL for analysis results.
    #[serde(default = "default_analysis_ttl_secs")]
    pub analysis_ttl_secs: u64,
    /// Base TTL for generated sections.
    #[serde(default = "default_generation_ttl_secs")]
    pub generation_ttl_secs: u64,
    /// Base TTL for optimized content.
    #[serde(default = "default_optimization_ttl_secs")]
    pub optimization_ttl_secs: u64,
    /// Inputs shorter than this are not cached.
    #[serde(default = "default_min_cache_input_chars")]
    pub min_input_chars: usize,
    /// Outputs shorter than this are not cached.
    #[serde(default = "default_min_cache_output_chars")]
    pub min_output_chars: usize,
    /// Inputs longer than this are not cached.
    #[serde(default = "default_max_cache_input_chars")]
    pub max_input_chars: usize,
    /// Redis URL for the shared backend (requires the `caching` feature).
    pub redis_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_max_entries(),
            sweep_interval_secs: default_sweep_interval_secs(),
            analysis_ttl_secs: default_analysis_ttl_secs(),
            generation_ttl_secs: default_generation_ttl_secs(),
            optimization_ttl_secs: default_optimization_ttl_secs(),
            min_input_chars: default_min_cache_input_chars(),
            min_output_chars: default_min_cache_output_chars(),
            max_input_chars: default_max_cache_input_chars(),
            redis_url: None,
        }
    }
}

// ── Queue ────────────────────────────────────────────────────────────────

/// Request queue and load balancer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct QueueConfig {
    /// Number of independent queue shards.
    #[serde(default = "default_shards")]
    pub shards: usize,
    /// Maximum in-flight jobs per shard.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Maximum queued (not yet running) jobs per shard.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Per-item deadline covering queue wait and execution.
    #[serde(default = "default_queue_timeout_ms")]
    pub timeout_ms: u64,
    /// Queue-level re-enqueues after a retryable failure.
    #[serde(default = "default_queue_max_retries")]
    pub max_retries: u32,
    /// Priority assigned when the caller does not pick one.
    #[serde(default = "default_priority")]
    pub default_priority: u8,
}

impl QueueConfig {
    /// Per-item deadline as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            max_concurrent: default_max_concurrent(),
            max_queue_size: default_max_queue_size(),
            timeout_ms: default_queue_timeout_ms(),
            max_retries: default_queue_max_retries(),
            default_priority: default_priority(),
        }
    }
}

// ── Cost ─────────────────────────────────────────────────────────────────

/// Budget ceilings and model tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CostConfig {
    /// Tokens a session may consume per local calendar day.
    #[serde(default = "default_daily_token_limit")]
    pub daily_token_limit: u64,
    /// Dollar ceiling across all sessions per calendar month.
    #[serde(default = "default_monthly_budget_usd")]
    pub monthly_budget_usd: f64,
    /// Remaining-budget fraction at which premium work moves to the balanced tier.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    /// Remaining-budget fraction at which all work moves to the budget tier.
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
    /// Model used for the premium tier.
    #[serde(default = "default_premium_model")]
    pub premium_model: String,
    /// Model used for the balanced tier.
    #[serde(default = "default_balanced_model")]
    pub balanced_model: String,
    /// Model used for the budget tier.
    #[serde(default = "default_budget_model")]
    pub budget_model: String,
    /// Model used when the caller names none. Defaults to the balanced model.
    pub default_model: Option<String>,
    /// Model tried after the primary exhausts its retries. Defaults to the budget model.
    pub fallback_model: Option<String>,
    /// Models-listing endpoint used to refresh pricing.
    pub registry_url: Option<String>,
}

impl CostConfig {
    /// Model used when the caller names none.
    pub fn default_model(&self) -> &str {
        self.default_model.as_deref().unwrap_or(&self.balanced_model)
    }

    /// Model tried after the primary exhausts its retries.
    pub fn fallback_model(&self) -> &str {
        self.fallback_model.as_deref().unwrap_or(&self.budget_model)
    }
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            daily_token_limit: default_daily_token_limit(),
            monthly_budget_usd: default_monthly_budget_usd(),
            warning_threshold: default_warning_threshold(),
            critical_threshold: default_critical_threshold(),
            premium_model: default_premium_model(),
            balanced_model: default_balanced_model(),
            budget_model: default_budget_model(),
            default_model: None,
            fallback_model: None,
            registry_url: None,
        }
    }
}

// ── Retry ────────────────────────────────────────────────────────────────

/// Retry backoff configuration for upstream calls.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RetryConfig {
    /// Attempts per model (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt. Must be ≤ `max_delay_ms`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single backoff delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Add up to 25 % random jitter to each delay.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: false,
        }
    }
}

// ── Monitoring ───────────────────────────────────────────────────────────

/// Metric buffer and alert threshold configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MonitoringConfig {
    /// Metrics retained in the ring buffer.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Window the alert rules aggregate over.
    #[serde(default = "default_alert_window_hours")]
    pub alert_window_hours: u32,
    /// Success rate below which the success-rate alert fires.
    #[serde(default = "default_success_rate_threshold")]
    pub success_rate_threshold: f64,
    /// Average latency above which the latency alert fires.
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: u64,
    /// Monthly spend percentage for the budget warning alert.
    #[serde(default = "default_budget_warning_pct")]
    pub budget_warning_pct: f64,
    /// Monthly spend percentage for the budget critical alert.
    #[serde(default = "default_budget_critical_pct")]
    pub budget_critical_pct: f64,
    /// Percentage of `hourly_request_cap` at which the rate alert fires.
    #[serde(default = "default_hourly_rate_pct")]
    pub hourly_rate_pct: f64,
    /// Expected ceiling on requests per hour across all sessions.
    #[serde(default = "default_hourly_request_cap")]
    pub hourly_request_cap: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            alert_window_hours: default_alert_window_hours(),
            success_rate_threshold: default_success_rate_threshold(),
            latency_threshold_ms: default_latency_threshold_ms(),
            budget_warning_pct: default_budget_warning_pct(),
            budget_critical_pct: default_budget_critical_pct(),
            hourly_rate_pct: default_hourly_rate_pct(),
            hourly_request_cap: default_hourly_request_cap(),
        }
    }
}

// ── Provider ─────────────────────────────────────────────────────────────

/// Generation provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ProviderConfig {
    /// Base URL of the OpenAI-compatible API.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// HTTP timeout for one upstream call.
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
    /// Completion token cap per request.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timeout_ms: default_provider_timeout_ms(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Export the JSON Schema for [`OrchestratorConfig`].
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(OrchestratorConfig);
    serde_json::to_string_pretty(&schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_documented_values() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.security.max_input_chars, 15_000);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.monitoring.success_rate_threshold, 0.95);
        assert_eq!(cfg.queue.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_default_model_falls_back_to_balanced_tier() {
        let cost = CostConfig::default();
        assert_eq!(cost.default_model(), cost.balanced_model);
        assert_eq!(cost.fallback_model(), cost.budget_model);
    }

    #[test]
    fn test_explicit_default_model_wins() {
        let cost = CostConfig {
            default_model: Some("x/y".into()),
            ..CostConfig::default()
        };
        assert_eq!(cost.default_model(), "x/y");
    }

    #[test]
    fn test_empty_toml_yields_defaults() {
        let cfg: OrchestratorConfig = toml::from_str("").expect("test: empty toml");
        assert_eq!(cfg, OrchestratorConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let cfg: OrchestratorConfig =
            toml::from_str("[queue]\nshards = 8\n").expect("test: partial toml");
        assert_eq!(cfg.queue.shards, 8);
        assert_eq!(cfg.queue.max_queue_size, 100);
    }

    #[test]
    fn test_export_schema_produces_valid_json() {
        let schema = export_schema().expect("test: schema export");
        let parsed: serde_json::Value =
            serde_json::from_str(&schema).expect("test: schema is valid JSON");
        assert!(parsed.get("properties").is_some() || parsed.get("$ref").is_some());
    }
}
