//! Caller-facing request and response shapes.

use crate::cache::CacheStats;
use crate::cost::CostReport;
use crate::monitoring::HealthReport;
use crate::queue::BalancerStatus;
use crate::security::SecurityStats;
use crate::OrchestratorError;
use serde::{Deserialize, Serialize};

/// Upstream usage of a freshly generated payload. Never cached.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) struct FreshUsage {
    pub tokens: u64,
    pub cost_usd: f64,
    pub remaining_tokens: u64,
}

/// What the cache stores for one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CachedPayload {
    pub content: String,
    pub model: String,
    pub degraded: bool,
    #[serde(skip)]
    pub fresh: Option<FreshUsage>,
}

/// Metadata attached to every successful response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseMetadata {
    /// Upstream tokens consumed by this call (0 on a cache hit).
    pub tokens_used: u64,
    /// End-to-end latency.
    pub response_time_ms: u64,
    /// Model that produced the content.
    pub model_used: String,
    /// USD charged for this call.
    pub estimated_cost: f64,
    /// Tokens left today for the session; `None` on a cache hit.
    pub remaining_quota: Option<u64>,
    /// Served from cache.
    pub cached: bool,
    /// Canned placeholder served after every upstream path failed.
    pub degraded: bool,
}

/// Successful operation result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResponse {
    /// Always `true`.
    pub success: bool,
    /// Generated analysis, section or rewrite.
    pub content: String,
    /// Call metadata.
    pub metadata: ResponseMetadata,
}

/// Failed operation result for the caller contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureResponse {
    /// Always `false`.
    pub success: bool,
    /// Non-sensitive message.
    pub error: String,
    /// Stable error code.
    pub code: String,
    /// Whether retrying later may succeed.
    pub retryable: bool,
}

impl From<&OrchestratorError> for FailureResponse {
    fn from(err: &OrchestratorError) -> Self {
        Self {
            success: false,
            error: err.public_message(),
            code: err.code().to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Render an operation result in the caller contract shape.
pub fn to_contract(result: &Result<OperationResponse, OrchestratorError>) -> serde_json::Value {
    let value = match result {
        Ok(response) => serde_json::to_value(response),
        Err(err) => serde_json::to_value(FailureResponse::from(err)),
    };
    value.unwrap_or_else(|_| serde_json::json!({ "success": false, "code": "INTERNAL_ERROR" }))
}

/// Combined component health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorHealth {
    /// Alert-driven verdict and window aggregates.
    pub monitoring: HealthReport,
    /// Cache counters.
    pub cache: CacheStats,
    /// Queue shard status.
    pub queue: BalancerStatus,
    /// Screening and rate-limit counters.
    pub security: SecurityStats,
    /// Month-to-date spend; `None` if the usage store is unavailable.
    pub budget: Option<CostReport>,
}
