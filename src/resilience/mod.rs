//! # Stage: Error Handler
//!
//! ## Responsibility
//! Classify upstream failures into a fixed taxonomy, retry transient ones
//! with exponential backoff, switch to a fallback model when the failure
//! class allows it, and finally fall back to a canned degraded response.
//!
//! ## Guarantees
//! - Non-retryable failures are never retried
//! - When every path fails, the caller sees the primary error, never a
//!   fallback or degraded-path error
//! - Permanent caller-side errors (`INVALID_REQUEST`, `UNAUTHORIZED`) never
//!   produce a degraded response
//!
//! ## NOT Responsible For
//! - Choosing the fallback model (that belongs to `cost` and `orchestrator`)
//! - Queue-level re-enqueueing (see `queue`)

pub mod degraded;
pub mod retry;

pub use degraded::{degraded_content, is_degraded, DEGRADED_MARKER};
pub use retry::RetryPolicy;

use crate::provider::ProviderError;
use crate::OrchestratorError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tracing::{debug, error, warn};

/// Failure classes for upstream errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// HTTP 400.
    InvalidRequest,
    /// HTTP 401.
    Unauthorized,
    /// HTTP 403.
    Forbidden,
    /// HTTP 429.
    RateLimit,
    /// HTTP 5xx.
    ServerError,
    /// Connection failure.
    NetworkError,
    /// Deadline exceeded.
    Timeout,
    /// HTTP 402 or exhausted credits.
    QuotaExceeded,
    /// HTTP 404 or unknown model id.
    ModelNotFound,
    /// Anything else.
    Unknown,
}

impl ErrorCode {
    /// Stable upper-case code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::RateLimit => "RATE_LIMIT",
            Self::ServerError => "SERVER_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::ModelNotFound => "MODEL_NOT_FOUND",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Whether the same call may succeed if repeated.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::ServerError | Self::NetworkError | Self::Timeout | Self::Unknown
        )
    }

    /// Whether switching to another model may help.
    pub fn fallback_available(&self) -> bool {
        matches!(
            self,
            Self::Forbidden
                | Self::RateLimit
                | Self::ServerError
                | Self::NetworkError
                | Self::Timeout
                | Self::QuotaExceeded
                | Self::ModelNotFound
        )
    }

    /// Map an HTTP status. Returns `None` for statuses outside the taxonomy.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            400 => Some(Self::InvalidRequest),
            401 => Some(Self::Unauthorized),
            402 => Some(Self::QuotaExceeded),
            403 => Some(Self::Forbidden),
            404 => Some(Self::ModelNotFound),
            408 => Some(Self::Timeout),
            429 => Some(Self::RateLimit),
            500..=599 => Some(Self::ServerError),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error after classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    /// Failure class.
    pub code: ErrorCode,
    /// Internal description (may contain upstream text; log only).
    pub message: String,
    /// Copied from [`ErrorCode::retryable`].
    pub retryable: bool,
    /// Copied from [`ErrorCode::fallback_available`].
    pub fallback_available: bool,
    /// HTTP status when one was observed.
    pub status: Option<u16>,
}

impl ClassifiedError {
    /// Classified error with flags derived from `code`.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.retryable(),
            fallback_available: code.fallback_available(),
            status: None,
        }
    }

    /// Attach the observed HTTP status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Neither retrying nor switching models can help.
    pub fn is_permanent(&self) -> bool {
        !self.retryable && !self.fallback_available
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Types that can be mapped onto the [`ErrorCode`] taxonomy.
pub trait Classify {
    /// Classify this error.
    fn classify(&self) -> ClassifiedError;
}

impl Classify for ClassifiedError {
    fn classify(&self) -> ClassifiedError {
        self.clone()
    }
}

impl Classify for ProviderError {
    fn classify(&self) -> ClassifiedError {
        match self {
            ProviderError::Http { status, message } => {
                let code = ErrorCode::from_status(*status)
                    .unwrap_or_else(|| classify_message(message));
                ClassifiedError::new(code, self.to_string()).with_status(*status)
            }
            ProviderError::Network(_) => {
                ClassifiedError::new(ErrorCode::NetworkError, self.to_string())
            }
            ProviderError::Timeout(_) => ClassifiedError::new(ErrorCode::Timeout, self.to_string()),
            ProviderError::Config(_) => {
                ClassifiedError::new(ErrorCode::Unauthorized, self.to_string())
            }
            ProviderError::InvalidResponse(msg) => {
                ClassifiedError::new(classify_message(msg), self.to_string())
            }
        }
    }
}

impl Classify for OrchestratorError {
    fn classify(&self) -> ClassifiedError {
        match self {
            OrchestratorError::Upstream(c) => c.clone(),
            OrchestratorError::Validation(_) | OrchestratorError::SecurityRejection { .. } => {
                ClassifiedError::new(ErrorCode::InvalidRequest, self.to_string())
            }
            OrchestratorError::RateLimitExceeded { .. } | OrchestratorError::QueueSaturated => {
                ClassifiedError::new(ErrorCode::RateLimit, self.to_string())
            }
            OrchestratorError::QuotaExceeded(_) => {
                ClassifiedError::new(ErrorCode::QuotaExceeded, self.to_string())
            }
            OrchestratorError::Timeout(_) => {
                ClassifiedError::new(ErrorCode::Timeout, self.to_string())
            }
            other => ClassifiedError::new(classify_message(&other.to_string()), other.to_string()),
        }
    }
}

impl From<ProviderError> for OrchestratorError {
    fn from(err: ProviderError) -> Self {
        OrchestratorError::Upstream(err.classify())
    }
}

/// Classify any supported error.
pub fn classify_error<E: Classify + ?Sized>(err: &E) -> ClassifiedError {
    err.classify()
}

/// Keyword heuristics for errors that carry no HTTP status.
fn classify_message(message: &str) -> ErrorCode {
    let m = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| m.contains(n));

    if has(&["timeout", "timed out", "deadline"]) {
        ErrorCode::Timeout
    } else if has(&["rate limit", "too many requests"]) {
        ErrorCode::RateLimit
    } else if has(&["quota", "insufficient credits", "payment required", "billing"]) {
        ErrorCode::QuotaExceeded
    } else if has(&["model not found", "no such model", "unknown model"]) {
        ErrorCode::ModelNotFound
    } else if has(&["unauthorized", "invalid api key", "authentication"]) {
        ErrorCode::Unauthorized
    } else if has(&["forbidden", "not allowed"]) {
        ErrorCode::Forbidden
    } else if has(&["connection", "network", "dns", "reset by peer", "broken pipe"]) {
        ErrorCode::NetworkError
    } else if has(&["bad request", "invalid request"]) {
        ErrorCode::InvalidRequest
    } else {
        ErrorCode::Unknown
    }
}

/// Caller-facing text for a failure class. Never contains upstream detail.
pub fn user_message(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::InvalidRequest => "The request could not be processed. Please check your input.",
        ErrorCode::Unauthorized => {
            "The AI service is not configured correctly. Please contact support."
        }
        ErrorCode::Forbidden => "The selected model is not available for this request.",
        ErrorCode::RateLimit => "The AI service is busy. Please try again in a moment.",
        ErrorCode::ServerError => {
            "The AI service is temporarily unavailable. Please try again later."
        }
        ErrorCode::NetworkError => "Could not reach the AI service. Please check back shortly.",
        ErrorCode::Timeout => "The AI service took too long to respond. Please try again.",
        ErrorCode::QuotaExceeded => "The usage limit has been reached. Please try again later.",
        ErrorCode::ModelNotFound => "The requested model is not available.",
        ErrorCode::Unknown => "An unexpected error occurred. Please try again.",
    }
}

/// One attempt at an operation, boxed so primary and fallback can differ.
pub type BoxedAttempt<'a, T, E> = Box<dyn FnMut() -> BoxFuture<'a, Result<T, E>> + Send + 'a>;

/// Synchronous last-resort generator.
pub type DegradedFn<'a, T> = Box<dyn FnOnce() -> Option<T> + Send + 'a>;

/// Which path produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    /// Primary operation succeeded (possibly after retries).
    Primary,
    /// Fallback operation succeeded.
    Fallback,
    /// Canned degraded response.
    Degraded,
}

/// Value returned by [`ErrorHandler::execute_with_fallback`].
#[derive(Debug, Clone, PartialEq)]
pub struct Recovered<T> {
    /// Result value.
    pub value: T,
    /// Path that produced it.
    pub source: RecoverySource,
}

impl<T> Recovered<T> {
    /// `true` for [`RecoverySource::Degraded`].
    pub fn is_degraded(&self) -> bool {
        self.source == RecoverySource::Degraded
    }
}

/// Retry/fallback/degrade executor.
#[derive(Debug, Clone, Default)]
pub struct ErrorHandler {
    policy: RetryPolicy,
}

impl ErrorHandler {
    /// Handler using `policy` for every retry loop.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Active retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `f` up to `max_attempts` times, sleeping between attempts.
    ///
    /// Aborts on the first non-retryable failure.
    pub async fn execute_with_retry<F, Fut, T, E>(&self, label: &str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label, attempt, "retry: operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let classified = e.classify();
                    if !classified.retryable {
                        warn!(label, code = %classified.code, "retry: error is not retryable");
                        return Err(e);
                    }
                    if attempt >= max_attempts {
                        warn!(
                            label,
                            attempts = attempt,
                            code = %classified.code,
                            "retry: all attempts exhausted"
                        );
                        return Err(e);
                    }

                    let delay = self.policy.calculate_delay(attempt);
                    warn!(
                        label,
                        attempt,
                        max = max_attempts,
                        code = %classified.code,
                        delay_ms = delay.as_millis() as u64,
                        "retry: operation failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Retry `primary`; then, if the failure class allows, retry `fallback`;
    /// then call `degraded`. If everything fails the primary error is returned.
    pub async fn execute_with_fallback<'a, T, E>(
        &self,
        mut primary: BoxedAttempt<'a, T, E>,
        fallback: Option<BoxedAttempt<'a, T, E>>,
        degraded: Option<DegradedFn<'a, T>>,
    ) -> Result<Recovered<T>, E>
    where
        E: Classify + Display,
    {
        let primary_err = match self.execute_with_retry("primary", || primary()).await {
            Ok(value) => {
                return Ok(Recovered {
                    value,
                    source: RecoverySource::Primary,
                })
            }
            Err(e) => e,
        };

        let classified = primary_err.classify();
        if classified.is_permanent() {
            return Err(primary_err);
        }

        if classified.fallback_available {
            if let Some(mut fallback) = fallback {
                match self.execute_with_retry("fallback", || fallback()).await {
                    Ok(value) => {
                        warn!(code = %classified.code, "primary failed, served by fallback");
                        return Ok(Recovered {
                            value,
                            source: RecoverySource::Fallback,
                        });
                    }
                    Err(e) => warn!(error = %e, "fallback failed"),
                }
            }
        }

        if let Some(degraded) = degraded {
            if let Some(value) = degraded() {
                warn!(code = %classified.code, "serving degraded response");
                return Ok(Recovered {
                    value,
                    source: RecoverySource::Degraded,
                });
            }
        }

        error!(code = %classified.code, error = %primary_err, "all recovery paths exhausted");
        Err(primary_err)
    }
}
