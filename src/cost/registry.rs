//! Model pricing catalogue.
//!
//! [`HttpModelRegistry`] reads an OpenAI-compatible `GET {base_url}/models`
//! listing whose `pricing` fields are USD-per-token strings. When the
//! registry is unreachable the [`fallback_models`] table is used.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Price band used for downgrade decisions, cheapest last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Cheapest models.
    Budget,
    /// Mid-priced default models.
    Balanced,
    /// Highest quality and price.
    Premium,
}

impl ModelTier {
    /// Tier implied by the blended price per million tokens.
    pub fn from_price(blended_per_million: f64) -> Self {
        if blended_per_million >= 2.0 {
            Self::Premium
        } else if blended_per_million >= 0.3 {
            Self::Balanced
        } else {
            Self::Budget
        }
    }
}

/// Price of one model, USD per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    /// Provider model id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// USD per million prompt tokens.
    pub prompt_per_million: f64,
    /// USD per million completion tokens.
    pub completion_per_million: f64,
}

impl ModelPricing {
    /// Pricing entry whose display name equals its id.
    pub fn new(
        id: impl Into<String>,
        prompt_per_million: f64,
        completion_per_million: f64,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            prompt_per_million,
            completion_per_million,
        }
    }

    /// Cost of a call in micro-dollars.
    pub fn cost_micros(&self, prompt_tokens: u64, completion_tokens: u64) -> u64 {
        // USD per million tokens == micro-dollars per token.
        let micros = prompt_tokens as f64 * self.prompt_per_million
            + completion_tokens as f64 * self.completion_per_million;
        micros.round().max(0.0) as u64
    }

    /// Mean of prompt and completion prices.
    pub fn blended_per_million(&self) -> f64 {
        (self.prompt_per_million + self.completion_per_million) / 2.0
    }

    /// Tier implied by price.
    pub fn tier(&self) -> ModelTier {
        ModelTier::from_price(self.blended_per_million())
    }
}

/// Hardcoded catalogue used when no registry is reachable.
pub fn fallback_models() -> Vec<ModelPricing> {
    vec![
        ModelPricing::new("anthropic/claude-3.5-sonnet", 3.0, 15.0),
        ModelPricing::new("openai/gpt-4o", 2.5, 10.0),
        ModelPricing::new("openai/gpt-4o-mini", 0.15, 0.6),
        ModelPricing::new("anthropic/claude-3-haiku", 0.25, 1.25),
        ModelPricing::new("google/gemini-flash-1.5", 0.075, 0.3),
        ModelPricing::new("meta-llama/llama-3.1-8b-instruct", 0.06, 0.06),
    ]
}

/// Registry lookup failures.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// Request could not be sent or completed.
    #[error("registry request failed: {0}")]
    Http(String),
    /// Registry answered with a non-success status.
    #[error("registry returned HTTP {0}")]
    Status(u16),
    /// Body could not be parsed.
    #[error("registry response invalid: {0}")]
    Parse(String),
}

/// Source of model pricing.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Every model with known pricing.
    async fn list_models(&self) -> Result<Vec<ModelPricing>, RegistryError>;
}

#[derive(Debug, Deserialize)]
struct ModelsEnvelope {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    name: Option<String>,
    pricing: PricingEntry,
}

#[derive(Debug, Deserialize)]
struct PricingEntry {
    prompt: String,
    completion: String,
}

/// `GET {base_url}/models` client.
pub struct HttpModelRegistry {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpModelRegistry {
    /// Registry at `base_url` with a 10 s timeout.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn per_token_to_per_million(raw: &str, id: &str) -> Result<f64, RegistryError> {
    raw.trim()
        .parse::<f64>()
        .map(|usd| usd * 1_000_000.0)
        .map_err(|e| RegistryError::Parse(format!("{id}: bad price '{raw}': {e}")))
}

#[async_trait]
impl ModelRegistry for HttpModelRegistry {
    async fn list_models(&self) -> Result<Vec<ModelPricing>, RegistryError> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RegistryError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RegistryError::Status(response.status().as_u16()));
        }

        let envelope: ModelsEnvelope = response
            .json()
            .await
            .map_err(|e| RegistryError::Parse(e.to_string()))?;

        envelope
            .data
            .into_iter()
            .map(|m| {
                Ok(ModelPricing {
                    prompt_per_million: per_token_to_per_million(&m.pricing.prompt, &m.id)?,
                    completion_per_million: per_token_to_per_million(&m.pricing.completion, &m.id)?,
                    name: m.name.unwrap_or_else(|| m.id.clone()),
                    id: m.id,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_micros() {
        let p = ModelPricing::new("m/x", 3.0, 15.0);
        // 1000 * 3 + 500 * 15 = 10_500 micro-dollars
        assert_eq!(p.cost_micros(1_000, 500), 10_500);
        assert_eq!(p.cost_micros(0, 0), 0);
    }

    #[test]
    fn test_tiers_from_fallback_table() {
        let models = fallback_models();
        let tier = |id: &str| models.iter().find(|m| m.id == id).unwrap().tier();
        assert_eq!(tier("anthropic/claude-3.5-sonnet"), ModelTier::Premium);
        assert_eq!(tier("openai/gpt-4o-mini"), ModelTier::Balanced);
        assert_eq!(tier("meta-llama/llama-3.1-8b-instruct"), ModelTier::Budget);
    }

    #[test]
    fn test_tier_ordering() {
        assert!(ModelTier::Premium > ModelTier::Balanced);
        assert!(ModelTier::Balanced > ModelTier::Budget);
    }

    #[test]
    fn test_price_string_parsing() {
        let v = per_token_to_per_million("0.000003", "m").unwrap();
        assert!((v - 3.0).abs() < 1e-9);
        assert!(per_token_to_per_million("free", "m").is_err());
    }
}
