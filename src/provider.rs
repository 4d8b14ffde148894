//! Generation provider abstraction and implementations
//!
//! Provides the [`GenerationProvider`] trait and two implementations:
//! - [`EchoProvider`]: deterministic, offline provider for tests and demos
//! - [`ChatCompletionProvider`]: OpenAI-compatible `/chat/completions` client
//!
//! Token counts are estimated at roughly four characters per token whenever
//! the upstream omits a `usage` block.
//!
//! ## Environment Variables
//!
//! - `AI_API_KEY` (or the variable named in `provider.api_key_env`): bearer
//!   token for [`ChatCompletionProvider::from_config`]

use crate::config::ProviderConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions that frame the task.
    System,
    /// End-user content.
    User,
    /// Prior model output.
    Assistant,
}

/// One chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// System message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// User message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A single completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Provider model id, e.g. `openai/gpt-4o-mini`.
    pub model: String,
    /// Conversation sent to the model.
    pub messages: Vec<ChatMessage>,
    /// Completion token cap.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl GenerationRequest {
    /// Same request addressed to a different model.
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }

    /// Estimated prompt tokens across all messages.
    pub fn estimated_prompt_tokens(&self) -> u64 {
        self.messages.iter().map(|m| estimate_tokens(&m.content)).sum()
    }
}

/// Completion returned by a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResponse {
    /// Generated text.
    pub content: String,
    /// Model that actually served the request.
    pub model: String,
    /// Prompt tokens (reported or estimated).
    pub prompt_tokens: u64,
    /// Completion tokens (reported or estimated).
    pub completion_tokens: u64,
    /// `true` when token counts were estimated locally.
    pub estimated_usage: bool,
}

impl GenerationResponse {
    /// Prompt plus completion tokens.
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Errors raised by a provider call, before classification.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Upstream answered with a non-success HTTP status.
    #[error("provider returned HTTP {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Upstream error message, truncated.
        message: String,
    },

    /// Connection could not be established or was reset.
    #[error("network error: {0}")]
    Network(String),

    /// The call exceeded its deadline.
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    /// Upstream answered 2xx with an unusable body.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    /// The provider is misconfigured (missing key, bad URL).
    #[error("provider configuration error: {0}")]
    Config(String),
}

/// Trait for text-generation providers.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via `Arc<dyn GenerationProvider>`.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Run one completion.
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError>;

    /// Short name used in logs.
    fn name(&self) -> &str {
        "provider"
    }
}

/// Estimate token count at roughly four characters per token.
///
/// # Panics
///
/// This function never panics.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

// ============================================================================
// Echo Provider (Testing)
// ============================================================================

/// Offline provider that echoes the last user message.
///
/// Useful for smoke tests without network access; counts its calls so tests
/// can assert how often the upstream was reached.
pub struct EchoProvider {
    /// Simulated latency.
    pub delay_ms: u64,
    calls: AtomicU64,
}

impl EchoProvider {
    /// Echo provider with a 10 ms simulated latency.
    pub fn new() -> Self {
        Self::with_delay(10)
    }

    /// Echo provider with a custom simulated latency.
    pub fn with_delay(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            calls: AtomicU64::new(0),
        }
    }

    /// Number of `generate` calls served so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for EchoProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationProvider for EchoProvider {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;

        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let content = format!("Echo ({}): {last_user}", request.model);

        Ok(GenerationResponse {
            completion_tokens: estimate_tokens(&content),
            prompt_tokens: request.estimated_prompt_tokens(),
            content,
            model: request.model.clone(),
            estimated_usage: true,
        })
    }

    fn name(&self) -> &str {
        "echo"
    }
}

// ============================================================================
// OpenAI-compatible chat completion provider
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionReply {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

const MAX_ERROR_MESSAGE_CHARS: usize = 200;

/// OpenAI-compatible chat completion client (OpenRouter, OpenAI, vLLM, ...).
///
/// ## Example
///
/// ```no_run
/// use tokio_ai_orchestrator::ChatCompletionProvider;
/// use std::time::Duration;
///
/// let provider = ChatCompletionProvider::new("https://openrouter.ai/api/v1", "sk-test")
///     .with_timeout(Duration::from_secs(20));
/// ```
pub struct ChatCompletionProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl ChatCompletionProvider {
    /// Create a provider for `base_url` authenticated with `api_key`.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Build from configuration, reading the API key from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] if the key variable is unset or empty.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                ProviderError::Config(format!(
                    "{} environment variable not set",
                    config.api_key_env
                ))
            })?;

        Ok(Self::new(&config.base_url, api_key)
            .with_timeout(Duration::from_millis(config.timeout_ms)))
    }

    /// Override the base URL (used to point at mock servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[async_trait]
impl GenerationProvider for ChatCompletionProvider {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        let body = ChatCompletionBody {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.timeout)
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(ProviderError::Http {
                status: status.as_u16(),
                message: truncate(&message, MAX_ERROR_MESSAGE_CHARS),
            });
        }

        let reply: ChatCompletionReply = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse body: {e}")))?;

        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse("no content in choices".to_string()))?;

        let (prompt_tokens, completion_tokens, estimated_usage) = match reply.usage {
            Some(u) => (u.prompt_tokens, u.completion_tokens, false),
            None => (
                request.estimated_prompt_tokens(),
                estimate_tokens(&content),
                true,
            ),
        };

        Ok(GenerationResponse {
            content,
            model: reply.model.unwrap_or_else(|| request.model.clone()),
            prompt_tokens,
            completion_tokens,
            estimated_usage,
        })
    }

    fn name(&self) -> &str {
        "chat_completion"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(text: &str) -> GenerationRequest {
        GenerationRequest {
            model: "test/model".into(),
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user(text)],
            max_tokens: 64,
            temperature: 0.2,
        }
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_with_model_keeps_messages() {
        let req = request("hello");
        let other = req.with_model("other/model");
        assert_eq!(other.model, "other/model");
        assert_eq!(other.messages, req.messages);
    }

    #[tokio::test]
    async fn test_echo_provider_echoes_last_user_message() {
        let provider = EchoProvider::with_delay(0);
        let resp = provider.generate(&request("hello world")).await.unwrap();
        assert!(resp.content.contains("hello world"));
        assert_eq!(resp.model, "test/model");
        assert!(resp.estimated_usage);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_echo_provider_counts_calls() {
        let provider = EchoProvider::with_delay(0);
        for _ in 0..3 {
            let _ = provider.generate(&request("x")).await;
        }
        assert_eq!(provider.calls(), 3);
    }

    #[test]
    fn test_from_config_missing_key_is_config_error() {
        let cfg = ProviderConfig {
            api_key_env: "TAO_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..ProviderConfig::default()
        };
        assert!(matches!(
            ChatCompletionProvider::from_config(&cfg),
            Err(ProviderError::Config(_))
        ));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let p = ChatCompletionProvider::new("http://localhost:1/v1/", "k");
        assert_eq!(p.base_url, "http://localhost:1/v1");
    }

    #[test]
    fn test_truncate_limits_length() {
        let long = "x".repeat(500);
        assert_eq!(truncate(&long, MAX_ERROR_MESSAGE_CHARS).len(), 200);
    }
}
