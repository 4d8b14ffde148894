//! # Stage: Security Validator
//!
//! ## Responsibility
//! Screen every request before it reaches the cache or the provider:
//! schema validation, content sanitization, prompt-injection scoring,
//! per-session rate limiting and PII masking for logs. Provider output is
//! screened with the same sanitizer.
//!
//! ## Guarantees
//! - `validate_input` reports every violation, not just the first
//! - Blocklisted content is never echoed back in `sanitized_content`
//! - Rate-limit and token counters never go negative; denials do not mutate
//!
//! ## NOT Responsible For
//! - Cost ceilings (see `cost`)
//! - Proving a prompt is safe: injection scoring is heuristic

pub mod patterns;
pub mod rate_limit;

pub use rate_limit::{RateLimitDecision, RateWindow, SessionLimiter, SessionUsage};

use crate::cache::SweepHandle;
use crate::config::SecurityConfig;
use crate::{OrchestratorError, SectionType, SessionId};
use patterns::Patterns;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Aggregate risk classification, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Nothing or one suspicious marker.
    Low,
    /// Two suspicious markers.
    Medium,
    /// Three or more suspicious markers, or over-length content.
    High,
    /// Blocklisted content.
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        })
    }
}

/// Threat name used for over-length content.
pub const MAX_LENGTH_EXCEEDED: &str = "max_length_exceeded";

const MAX_TARGET_ROLE_CHARS: usize = 200;

/// Characters of masked input included in injection warnings.
const LOG_PREVIEW_CHARS: usize = 80;

/// Unvalidated caller input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawInput {
    /// Document text, context or content to rewrite.
    pub text: Option<String>,
    /// Caller session.
    pub session_id: Option<String>,
    /// Section to generate (generate-section only).
    pub section_type: Option<String>,
    /// Requested model id.
    pub model: Option<String>,
    /// Target job title.
    pub target_role: Option<String>,
}

/// Input that passed schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedInput {
    /// Trimmed text.
    pub text: String,
    /// Caller session.
    pub session_id: SessionId,
    /// Parsed section type.
    pub section_type: Option<SectionType>,
    /// Requested model id.
    pub model: Option<String>,
    /// Trimmed target role.
    pub target_role: Option<String>,
}

/// Schema validation failure carrying every violation.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid input: {}", .violations.join("; "))]
pub struct ValidationError {
    /// Human-readable violations, one per failed rule.
    pub violations: Vec<String>,
}

impl From<ValidationError> for OrchestratorError {
    fn from(err: ValidationError) -> Self {
        OrchestratorError::Validation(err.violations)
    }
}

/// Result of [`SecurityValidator::sanitize_content`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SanitizationResult {
    /// `false` when the content was blocked.
    pub valid: bool,
    /// Cleaned content; empty when blocked.
    pub sanitized_content: String,
    /// Names of matched blocklist and suspicious patterns.
    pub threats: Vec<String>,
    /// Aggregate risk.
    pub risk_level: RiskLevel,
    /// Whether the content must be rejected.
    pub blocked: bool,
}

impl SanitizationResult {
    fn blocked(threats: Vec<String>, risk_level: RiskLevel) -> Self {
        Self {
            valid: false,
            sanitized_content: String::new(),
            threats,
            risk_level,
            blocked: true,
        }
    }

    /// Convert a blocked result into a rejection error.
    pub fn into_result(self) -> Result<Self, OrchestratorError> {
        if self.blocked {
            Err(OrchestratorError::SecurityRejection {
                threats: self.threats,
                risk_level: self.risk_level,
            })
        } else {
            Ok(self)
        }
    }
}

/// Result of [`SecurityValidator::detect_prompt_injection`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InjectionReport {
    /// `confidence > threshold`.
    pub detected: bool,
    /// Sum of matched weights, capped at 1.0.
    pub confidence: f64,
    /// Names of matched patterns.
    pub patterns: Vec<String>,
}

/// Counters for the health report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SecurityStats {
    /// Sessions with live rate-limit state.
    pub tracked_sessions: usize,
    /// Inputs that passed schema validation.
    pub inputs_validated: u64,
    /// Inputs rejected by schema validation.
    pub inputs_rejected: u64,
    /// Content blocked by the sanitizer.
    pub content_blocked: u64,
    /// Prompts flagged as injections.
    pub injections_detected: u64,
    /// Requests denied by a rate or token limit.
    pub rate_limited: u64,
}

/// Request screening front door.
pub struct SecurityValidator {
    patterns: Patterns,
    limiter: Arc<SessionLimiter>,
    config: SecurityConfig,
    inputs_validated: AtomicU64,
    inputs_rejected: AtomicU64,
    content_blocked: AtomicU64,
    injections_detected: AtomicU64,
    rate_limited: AtomicU64,
}

impl SecurityValidator {
    /// Build a validator from the `[security]` section.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::ConfigError`] if a pattern fails to compile.
    pub fn new(config: &SecurityConfig) -> Result<Self, OrchestratorError> {
        let patterns = Patterns::compile()
            .map_err(|e| OrchestratorError::ConfigError(format!("security pattern: {e}")))?;
        Ok(Self {
            patterns,
            limiter: Arc::new(SessionLimiter::new(
                config.requests_per_minute,
                config.requests_per_hour,
                config.session_daily_tokens,
            )),
            config: config.clone(),
            inputs_validated: AtomicU64::new(0),
            inputs_rejected: AtomicU64::new(0),
            content_blocked: AtomicU64::new(0),
            injections_detected: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
        })
    }

    /// Check the input schema, collecting every violation.
    pub fn validate_input(&self, raw: &RawInput) -> Result<ValidatedInput, ValidationError> {
        let mut violations = Vec::new();

        let text = raw.text.as_deref().map(str::trim).unwrap_or_default();
        let len = text.chars().count();
        if len == 0 {
            violations.push("text is required".to_string());
        } else if len > self.config.max_input_chars {
            violations.push(format!(
                "text must be at most {} characters (got {len})",
                self.config.max_input_chars
            ));
        }

        match raw.session_id.as_deref() {
            None | Some("") => violations.push("session_id is required".to_string()),
            Some(id) if !self.patterns.session_id.is_match(id) => violations.push(
                "session_id must be 8-128 characters of letters, digits, '-' or '_'".to_string(),
            ),
            Some(_) => {}
        }

        let section_type = match raw.section_type.as_deref() {
            None => None,
            Some(name) => {
                let parsed = SectionType::from_name(name);
                if parsed.is_none() {
                    let allowed: Vec<&str> = SectionType::ALL.iter().map(|s| s.as_str()).collect();
                    violations.push(format!(
                        "section_type '{name}' is not one of: {}",
                        allowed.join(", ")
                    ));
                }
                parsed
            }
        };

        if let Some(model) = raw.model.as_deref() {
            if !self.patterns.model_name.is_match(model) {
                violations.push(format!(
                    "model '{model}' must look like provider/model[:variant]"
                ));
            }
        }

        let target_role = raw
            .target_role
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty());
        if let Some(role) = target_role {
            if role.chars().count() > MAX_TARGET_ROLE_CHARS {
                violations.push(format!(
                    "target_role must be at most {MAX_TARGET_ROLE_CHARS} characters"
                ));
            }
        }

        if !violations.is_empty() {
            self.inputs_rejected.fetch_add(1, Ordering::Relaxed);
            debug!(count = violations.len(), "input validation failed");
            return Err(ValidationError { violations });
        }

        self.inputs_validated.fetch_add(1, Ordering::Relaxed);
        Ok(ValidatedInput {
            text: text.to_string(),
            session_id: SessionId::new(raw.session_id.clone().unwrap_or_default()),
            section_type,
            model: raw.model.clone(),
            target_role: target_role.map(str::to_string),
        })
    }

    /// Screen and clean user content, enforcing the configured length cap.
    pub fn sanitize_content(&self, content: &str) -> SanitizationResult {
        self.sanitize(content, Some(self.config.max_input_chars))
    }

    /// Screen generated text. Provider output is untrusted.
    pub fn validate_output(&self, content: &str) -> Result<String, OrchestratorError> {
        self.sanitize(content, None)
            .into_result()
            .map(|r| r.sanitized_content)
    }

    fn sanitize(&self, content: &str, max_chars: Option<usize>) -> SanitizationResult {
        if let Some(max) = max_chars {
            if content.chars().count() > max {
                self.content_blocked.fetch_add(1, Ordering::Relaxed);
                warn!(max, "content blocked: max length exceeded");
                return SanitizationResult::blocked(
                    vec![MAX_LENGTH_EXCEEDED.to_string()],
                    RiskLevel::High,
                );
            }
        }

        let blocked: Vec<String> = self
            .patterns
            .blocklist
            .iter()
            .filter(|p| p.regex.is_match(content))
            .map(|p| p.name.to_string())
            .collect();
        if !blocked.is_empty() {
            self.content_blocked.fetch_add(1, Ordering::Relaxed);
            warn!(threats = ?blocked, "content blocked");
            return SanitizationResult::blocked(blocked, RiskLevel::Critical);
        }

        let threats: Vec<String> = self
            .patterns
            .suspicious
            .iter()
            .filter(|p| p.regex.is_match(content))
            .map(|p| p.name.to_string())
            .collect();
        let risk_level = match threats.len() {
            0 | 1 => RiskLevel::Low,
            2 => RiskLevel::Medium,
            _ => RiskLevel::High,
        };

        let stripped = self.patterns.html_tag.replace_all(content, "");
        let sanitized_content: String = stripped
            .chars()
            .filter(|c| !is_stripped_char(*c))
            .collect::<String>()
            .trim()
            .to_string();

        SanitizationResult {
            valid: true,
            sanitized_content,
            threats,
            risk_level,
            blocked: false,
        }
    }

    /// Score a prompt against weighted injection patterns.
    pub fn detect_prompt_injection(&self, prompt: &str) -> InjectionReport {
        let mut confidence = 0.0;
        let mut patterns = Vec::new();
        for p in &self.patterns.injection {
            if p.regex.is_match(prompt) {
                confidence += p.weight;
                patterns.push(p.name.to_string());
            }
        }
        let confidence = f64::min(confidence, 1.0);
        let detected = confidence > self.config.injection_threshold;
        if detected {
            self.injections_detected.fetch_add(1, Ordering::Relaxed);
            let preview: String = self
                .mask_sensitive_data(prompt)
                .chars()
                .take(LOG_PREVIEW_CHARS)
                .collect();
            warn!(
                confidence,
                patterns = ?patterns,
                preview = %preview,
                "prompt injection detected"
            );
        }
        InjectionReport {
            detected,
            confidence,
            patterns,
        }
    }

    /// Redact emails, phone numbers, SSNs, card numbers and long tokens.
    pub fn mask_sensitive_data(&self, text: &str) -> String {
        self.patterns
            .masks
            .iter()
            .fold(text.to_string(), |acc, m| {
                m.regex.replace_all(&acc, m.replacement).into_owned()
            })
    }

    /// Sanitize, reject blocked content and, when configured, injections.
    ///
    /// Returns the sanitized text.
    pub fn screen(&self, text: &str) -> Result<String, OrchestratorError> {
        let result = self.sanitize_content(text).into_result()?;
        let injection = self.detect_prompt_injection(&result.sanitized_content);
        if injection.detected && self.config.block_on_injection {
            return Err(OrchestratorError::SecurityRejection {
                threats: injection.patterns,
                risk_level: RiskLevel::High,
            });
        }
        Ok(result.sanitized_content)
    }

    /// Count a request against the minute or hour window.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::RateLimitExceeded`] when the window is full.
    pub fn check_rate_limit(
        &self,
        session: &SessionId,
        window: RateWindow,
    ) -> Result<RateLimitDecision, OrchestratorError> {
        let decision = self.limiter.check_rate_limit(session.as_str(), window);
        self.into_limit_result(decision, window)
    }

    /// Count a request against the minute and hour windows together.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::RateLimitExceeded`] naming the full
    /// window; neither window is charged in that case.
    pub fn check_request_rate(
        &self,
        session: &SessionId,
    ) -> Result<RateLimitDecision, OrchestratorError> {
        let (window, decision) = self.limiter.check_request(session.as_str());
        self.into_limit_result(decision, window)
    }

    /// Reserve estimated tokens against the session's 24 h allowance.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::RateLimitExceeded`] for the `day` window.
    pub fn check_token_usage(
        &self,
        session: &SessionId,
        requested: u64,
    ) -> Result<RateLimitDecision, OrchestratorError> {
        let decision = self.limiter.check_token_usage(session.as_str(), requested);
        self.into_limit_result(decision, RateWindow::Day)
    }

    fn into_limit_result(
        &self,
        decision: RateLimitDecision,
        window: RateWindow,
    ) -> Result<RateLimitDecision, OrchestratorError> {
        if decision.allowed {
            return Ok(decision);
        }
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
        Err(OrchestratorError::RateLimitExceeded {
            window,
            retry_after_secs: decision.reset_in.as_secs().max(1),
        })
    }

    /// Per-session counters.
    pub fn session_usage(&self, session: &SessionId) -> Option<SessionUsage> {
        self.limiter.get_usage(session.as_str())
    }

    /// Forget one session's counters.
    pub fn reset_session(&self, session: &SessionId) {
        self.limiter.reset(session.as_str());
    }

    /// Drop sessions whose windows have all expired.
    pub fn prune_expired_sessions(&self) -> usize {
        self.limiter.prune_expired()
    }

    /// Spawn a task that prunes expired sessions every `every`.
    ///
    /// The task holds only a weak reference and stops once the validator
    /// is dropped.
    pub fn spawn_session_sweeper(&self, every: Duration) -> SweepHandle {
        let limiter: Weak<SessionLimiter> = Arc::downgrade(&self.limiter);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                let removed = limiter.prune_expired();
                if removed > 0 {
                    debug!(removed, "pruned expired rate-limit sessions");
                }
            }
        });
        SweepHandle::from_task(handle)
    }

    /// Forget every session and zero the counters.
    pub fn reset(&self) {
        self.limiter.reset_all();
        for counter in [
            &self.inputs_validated,
            &self.inputs_rejected,
            &self.content_blocked,
            &self.injections_detected,
            &self.rate_limited,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Counter snapshot.
    pub fn security_stats(&self) -> SecurityStats {
        SecurityStats {
            tracked_sessions: self.limiter.tracked_sessions(),
            inputs_validated: self.inputs_validated.load(Ordering::Relaxed),
            inputs_rejected: self.inputs_rejected.load(Ordering::Relaxed),
            content_blocked: self.content_blocked.load(Ordering::Relaxed),
            injections_detected: self.injections_detected.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }
}

/// Control characters other than `\n`, `\r`, `\t`, plus bidi overrides.
fn is_stripped_char(c: char) -> bool {
    (c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}
