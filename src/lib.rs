//! # tokio-ai-orchestrator
//!
//! Resilience layer that mediates every call from an application to a metered,
//! rate-limited text-generation provider.
//!
//! ## Architecture
//!
//! ```text
//! caller → security → cache ─hit─────────────────────────────────┐
//!                       └miss→ quota → balancer(shards) → retry/fallback/degrade → provider
//!                                                        ↓
//!                                       monitoring ← usage ledger ← cache store → caller
//! ```
//!
//! The [`orchestrator::Orchestrator`] facade owns every component and exposes
//! three operations: `analyze`, `generate_section` and `optimize`.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod cache;
pub mod config;
pub mod cost;
pub mod metrics;
pub mod monitoring;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod resilience;
pub mod security;

// Re-exports for convenience
pub use config::OrchestratorConfig;
pub use orchestrator::Orchestrator;
pub use provider::{ChatCompletionProvider, EchoProvider, GenerationProvider};
pub use resilience::{ClassifiedError, ErrorCode};
pub use security::{RateWindow, RiskLevel};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`OrchestratorError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), OrchestratorError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| OrchestratorError::Other(format!("tracing init failed: {e}")))
}

/// Top-level orchestrator errors.
///
/// Every failure surfaced to a caller is one of these variants. Each maps to
/// a stable [`code`](OrchestratorError::code) and a retry hint so the caller
/// contract never exposes raw upstream bodies.
#[derive(Error, Debug, Clone)]
pub enum OrchestratorError {
    /// Input failed schema validation. Carries every violation found.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// Content was blocked by security screening.
    #[error("content rejected by security screening (risk: {risk_level})")]
    SecurityRejection {
        /// Names of the threat patterns that matched.
        threats: Vec<String>,
        /// Aggregate risk classification.
        risk_level: RiskLevel,
    },

    /// The session exceeded a per-window request or token allowance.
    #[error("rate limit exceeded for {window} window, retry in {retry_after_secs}s")]
    RateLimitExceeded {
        /// The window whose allowance ran out.
        window: RateWindow,
        /// Seconds until the window resets.
        retry_after_secs: u64,
    },

    /// The daily token ceiling or monthly budget has been reached.
    #[error("usage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The generation provider failed; the error has already been classified.
    #[error("upstream error [{}]: {}", .0.code, .0.message)]
    Upstream(ClassifiedError),

    /// Every queue shard is at capacity.
    #[error("request queue saturated")]
    QueueSaturated,

    /// The request did not settle before its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// An internal channel closed before delivering a result.
    #[error("channel closed unexpectedly")]
    ChannelClosed,

    /// A configuration value is missing or invalid.
    ///
    /// Returned at construction time so that misconfiguration surfaces
    /// immediately rather than at the first request.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    /// Stable machine-readable code for the caller contract.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::SecurityRejection { .. } => "SECURITY_REJECTION",
            Self::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            Self::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            Self::Upstream(c) => c.code.as_str(),
            Self::QueueSaturated => "QUEUE_SATURATED",
            Self::Timeout(_) => "TIMEOUT",
            Self::ChannelClosed | Self::ConfigError(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream(c) => c.retryable,
            Self::RateLimitExceeded { .. } | Self::QueueSaturated | Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// Caller-facing message. Upstream details are replaced by the classified
    /// description so provider bodies never leak.
    pub fn public_message(&self) -> String {
        match self {
            Self::Upstream(c) => resilience::user_message(c.code).to_string(),
            Self::ChannelClosed | Self::ConfigError(_) | Self::Other(_) => {
                "internal error while processing the request".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Unique session identifier used for rate limiting and usage accounting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(
    /// The raw string ID, typically a UUID or user-provided token.
    pub String,
);

impl SessionId {
    /// Create a new [`SessionId`] from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the session ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The three operations the facade exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Analyze a document against a target role.
    Analyze,
    /// Generate one document section.
    GenerateSection,
    /// Rewrite content for a target role.
    Optimize,
}

impl OperationKind {
    /// Snake-case label used in logs, metrics and cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "analyze",
            Self::GenerateSection => "generate_section",
            Self::Optimize => "optimize",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Section types accepted by `generate_section`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionType {
    /// Professional summary.
    Summary,
    /// Work experience entries.
    Experience,
    /// Education history.
    Education,
    /// Skills list.
    Skills,
    /// Project highlights.
    Projects,
    /// Certifications.
    Certifications,
    /// Cover letter body.
    CoverLetter,
}

impl SectionType {
    /// Every accepted section type, in display order.
    pub const ALL: [SectionType; 7] = [
        SectionType::Summary,
        SectionType::Experience,
        SectionType::Education,
        SectionType::Skills,
        SectionType::Projects,
        SectionType::Certifications,
        SectionType::CoverLetter,
    ];

    /// Parse a section type from its snake-case name.
    ///
    /// Returns `None` for unrecognised strings.
    pub fn from_name(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Snake-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Experience => "experience",
            Self::Education => "education",
            Self::Skills => "skills",
            Self::Projects => "projects",
            Self::Certifications => "certifications",
            Self::CoverLetter => "cover_letter",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_as_str_round_trips() {
        let session = SessionId::new("my-session");
        assert_eq!(session.as_str(), "my-session");
        assert_eq!(session.to_string(), "my-session");
    }

    #[test]
    fn test_config_error_display_includes_message() {
        let err = OrchestratorError::ConfigError("AI_API_KEY not set".to_string());
        assert!(err.to_string().contains("AI_API_KEY not set"));
    }

    #[test]
    fn test_validation_error_lists_every_violation() {
        let err = OrchestratorError::Validation(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "validation failed: a; b");
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_public_message_hides_internal_details() {
        let err = OrchestratorError::Other("db password=hunter2".into());
        assert!(!err.public_message().contains("hunter2"));
    }

    #[test]
    fn test_queue_saturated_is_retryable() {
        assert!(OrchestratorError::QueueSaturated.is_retryable());
        assert_eq!(OrchestratorError::QueueSaturated.code(), "QUEUE_SATURATED");
    }

    #[test]
    fn test_section_type_from_name() {
        assert_eq!(SectionType::from_name("summary"), Some(SectionType::Summary));
        assert_eq!(
            SectionType::from_name("cover_letter"),
            Some(SectionType::CoverLetter)
        );
        assert_eq!(SectionType::from_name("hobbies"), None);
    }

    #[test]
    fn test_operation_kind_labels() {
        assert_eq!(OperationKind::GenerateSection.as_str(), "generate_section");
        assert_eq!(OperationKind::Analyze.to_string(), "analyze");
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
