//! # Stage: Cost Manager
//!
//! ## Responsibility
//! Keep the usage ledger, enforce the per-session daily token ceiling and
//! the global monthly dollar budget, and recommend cheaper model tiers as
//! the budget runs down.
//!
//! ## Guarantees
//! - Daily token usage resets at local midnight; monthly spend on day 1
//! - `can_proceed` is `false` once either ceiling is reached
//! - Costs accumulate as micro-dollars to avoid floating-point drift
//!
//! ## NOT Responsible For
//! - Per-minute request limits (see `security`)
//! - Long-term analytics beyond the current month

pub mod registry;
pub mod store;

pub use registry::{
    fallback_models, HttpModelRegistry, ModelPricing, ModelRegistry, ModelTier, RegistryError,
};
pub use store::{InMemoryUsageStore, StoreError, UsageRecord, UsageStore};

use crate::config::CostConfig;
use crate::{OperationKind, OrchestratorError, SessionId};
use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Convert a USD value to micro-dollars.
pub(crate) fn f64_to_micro(usd: f64) -> u64 {
    (usd * 1_000_000.0).round().max(0.0) as u64
}

/// Convert micro-dollars to USD.
pub(crate) fn micro_to_f64(micro: u64) -> f64 {
    micro as f64 / 1_000_000.0
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        OrchestratorError::Other(err.to_string())
    }
}

/// Result of [`CostManager::check_usage_quota`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaStatus {
    /// Both ceilings still have headroom.
    pub can_proceed: bool,
    /// Tokens left today for this session.
    pub remaining_tokens: u64,
    /// USD left this month.
    pub remaining_budget: f64,
    /// Model tier appropriate for the remaining budget.
    pub recommended_model: String,
    /// Tokens used today by this session.
    pub daily_usage: u64,
    /// USD spent this month across all sessions.
    pub monthly_spent: f64,
}

/// Usage of one model this month.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ModelUsage {
    /// Calls served.
    pub requests: u64,
    /// Tokens consumed.
    pub tokens: u64,
    /// USD spent.
    pub cost: f64,
}

/// Result of [`CostManager::generate_cost_report`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostReport {
    /// Tokens used today across all sessions.
    pub daily_tokens: u64,
    /// USD spent this month.
    pub monthly_spent: f64,
    /// Monthly ceiling.
    pub monthly_budget: f64,
    /// `monthly_spent / monthly_budget * 100`.
    pub utilization_pct: f64,
    /// Spend extrapolated to month end.
    pub projected_monthly_spend: f64,
    /// Per-model breakdown for the month.
    pub by_model: BTreeMap<String, ModelUsage>,
    /// Report time.
    pub generated_at: DateTime<Local>,
}

/// Start of the local day containing `now`.
fn start_of_day(now: DateTime<Local>) -> DateTime<Local> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
        .unwrap_or(now - chrono::Duration::hours(24))
}

/// Start of the local month containing `now`.
fn start_of_month(now: DateTime<Local>) -> DateTime<Local> {
    now.date_naive()
        .with_day(1)
        .and_then(|first| first.and_hms_opt(0, 0, 0))
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
        .unwrap_or_else(|| start_of_day(now))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let first = NaiveDate::from_ymd_opt(year, month, 1);
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    match (first, next) {
        (Some(first), Some(next)) => next.signed_duration_since(first).num_days() as u32,
        _ => 30,
    }
}

/// Budget-aware usage ledger.
pub struct CostManager {
    config: CostConfig,
    store: Arc<dyn UsageStore>,
    registry: Option<Arc<dyn ModelRegistry>>,
    pricing: RwLock<HashMap<String, ModelPricing>>,
}

/// Conservative price for models missing from the catalogue.
const UNKNOWN_MODEL_PRICING: (f64, f64) = (1.0, 2.0);

impl CostManager {
    /// Manager over `store` priced from the fallback table.
    pub fn new(config: &CostConfig, store: Arc<dyn UsageStore>) -> Self {
        let pricing = fallback_models()
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();
        Self {
            config: config.clone(),
            store,
            registry: None,
            pricing: RwLock::new(pricing),
        }
    }

    /// Use `registry` for [`refresh_pricing`](Self::refresh_pricing).
    pub fn with_registry(mut self, registry: Arc<dyn ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Ledger backing this manager.
    pub fn store(&self) -> &Arc<dyn UsageStore> {
        &self.store
    }

    /// Reload prices from the registry. Keeps the current table on failure.
    ///
    /// Returns the number of models now priced.
    pub async fn refresh_pricing(&self) -> usize {
        let Some(registry) = &self.registry else {
            return self.pricing.read().len();
        };
        match registry.list_models().await {
            Ok(models) if !models.is_empty() => {
                let mut table = self.pricing.write();
                for m in models {
                    table.insert(m.id.clone(), m);
                }
                info!(models = table.len(), "model pricing refreshed");
                table.len()
            }
            Ok(_) => {
                warn!("model registry returned no models, keeping fallback pricing");
                self.pricing.read().len()
            }
            Err(e) => {
                warn!(error = %e, "model registry unreachable, keeping fallback pricing");
                self.pricing.read().len()
            }
        }
    }

    /// Pricing for `model`, if known.
    pub fn pricing_for(&self, model: &str) -> Option<ModelPricing> {
        self.pricing.read().get(model).cloned()
    }

    fn cost_micros(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> u64 {
        match self.pricing.read().get(model) {
            Some(p) => p.cost_micros(prompt_tokens, completion_tokens),
            None => {
                warn!(model, "no pricing for model, billing at the conservative default");
                let (prompt, completion) = UNKNOWN_MODEL_PRICING;
                ModelPricing::new(model, prompt, completion)
                    .cost_micros(prompt_tokens, completion_tokens)
            }
        }
    }

    /// Estimated USD cost of a call.
    pub fn estimate_cost(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        micro_to_f64(self.cost_micros(model, prompt_tokens, completion_tokens))
    }

    /// Tier of `model`: configured ids first, then price.
    pub fn tier_of(&self, model: &str) -> ModelTier {
        if model == self.config.premium_model {
            ModelTier::Premium
        } else if model == self.config.balanced_model {
            ModelTier::Balanced
        } else if model == self.config.budget_model {
            ModelTier::Budget
        } else {
            self.pricing_for(model)
                .map(|p| p.tier())
                .unwrap_or(ModelTier::Balanced)
        }
    }

    fn model_for_tier(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Premium => &self.config.premium_model,
            ModelTier::Balanced => &self.config.balanced_model,
            ModelTier::Budget => &self.config.budget_model,
        }
    }

    /// Tier appropriate for a remaining-budget fraction.
    pub fn recommended_tier(&self, remaining_fraction: f64) -> ModelTier {
        if remaining_fraction <= self.config.critical_threshold {
            ModelTier::Budget
        } else if remaining_fraction <= self.config.warning_threshold {
            ModelTier::Balanced
        } else {
            ModelTier::Premium
        }
    }

    async fn monthly_spent_micros(&self, now: DateTime<Local>) -> Result<u64, StoreError> {
        let records = self.store.records_since(start_of_month(now)).await?;
        Ok(records.iter().map(|r| r.cost_micros).sum())
    }

    fn remaining_fraction(&self, spent_micros: u64) -> f64 {
        let budget = f64_to_micro(self.config.monthly_budget_usd);
        if budget == 0 {
            return 0.0;
        }
        budget.saturating_sub(spent_micros) as f64 / budget as f64
    }

    /// Check both ceilings for `session`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Other`] if the store fails.
    pub async fn check_usage_quota(
        &self,
        session: &SessionId,
    ) -> Result<QuotaStatus, OrchestratorError> {
        self.check_usage_quota_at(session, Local::now()).await
    }

    pub(crate) async fn check_usage_quota_at(
        &self,
        session: &SessionId,
        now: DateTime<Local>,
    ) -> Result<QuotaStatus, OrchestratorError> {
        let month = self.store.records_since(start_of_month(now)).await?;
        let day_start = start_of_day(now);

        let daily_usage: u64 = month
            .iter()
            .filter(|r| r.timestamp >= day_start && &r.session_id == session)
            .map(UsageRecord::total_tokens)
            .sum();
        let spent_micros: u64 = month.iter().map(|r| r.cost_micros).sum();
        let budget_micros = f64_to_micro(self.config.monthly_budget_usd);

        let remaining_tokens = self.config.daily_token_limit.saturating_sub(daily_usage);
        let remaining_micros = budget_micros.saturating_sub(spent_micros);
        let can_proceed =
            daily_usage < self.config.daily_token_limit && spent_micros < budget_micros;
        let tier = self.recommended_tier(self.remaining_fraction(spent_micros));

        let status = QuotaStatus {
            can_proceed,
            remaining_tokens,
            remaining_budget: micro_to_f64(remaining_micros),
            recommended_model: self.model_for_tier(tier).to_string(),
            daily_usage,
            monthly_spent: micro_to_f64(spent_micros),
        };
        if !can_proceed {
            warn!(
                session = %session,
                daily_usage,
                monthly_spent = status.monthly_spent,
                "usage quota exhausted"
            );
        }
        Ok(status)
    }

    /// Append a usage record for a completed upstream call.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Other`] if the store fails.
    pub async fn track_usage(
        &self,
        session: &SessionId,
        operation: OperationKind,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        latency: Duration,
    ) -> Result<UsageRecord, OrchestratorError> {
        self.track_usage_at(
            session,
            operation,
            model,
            prompt_tokens,
            completion_tokens,
            latency,
            Local::now(),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn track_usage_at(
        &self,
        session: &SessionId,
        operation: OperationKind,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        latency: Duration,
        now: DateTime<Local>,
    ) -> Result<UsageRecord, OrchestratorError> {
        let record = UsageRecord {
            session_id: session.clone(),
            operation,
            model: model.to_string(),
            prompt_tokens,
            completion_tokens,
            cost_micros: self.cost_micros(model, prompt_tokens, completion_tokens),
            latency_ms: latency.as_millis() as u64,
            timestamp: now,
        };
        debug!(
            session = %session,
            op = %operation,
            model,
            tokens = record.total_tokens(),
            cost_micros = record.cost_micros,
            "usage tracked"
        );
        self.store.append(record.clone()).await?;
        Ok(record)
    }

    /// Spend summary for the current month.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Other`] if the store fails.
    pub async fn generate_cost_report(&self) -> Result<CostReport, OrchestratorError> {
        self.generate_cost_report_at(Local::now()).await
    }

    pub(crate) async fn generate_cost_report_at(
        &self,
        now: DateTime<Local>,
    ) -> Result<CostReport, OrchestratorError> {
        let month = self.store.records_since(start_of_month(now)).await?;
        let day_start = start_of_day(now);

        let mut by_model: BTreeMap<String, ModelUsage> = BTreeMap::new();
        let mut spent_micros = 0u64;
        let mut daily_tokens = 0u64;
        for r in &month {
            spent_micros += r.cost_micros;
            if r.timestamp >= day_start {
                daily_tokens += r.total_tokens();
            }
            let entry = by_model.entry(r.model.clone()).or_default();
            entry.requests += 1;
            entry.tokens += r.total_tokens();
            entry.cost += r.cost_usd();
        }

        let monthly_spent = micro_to_f64(spent_micros);
        let day_of_month = now.day().max(1);
        let days = days_in_month(now.year(), now.month());
        let projected_monthly_spend = monthly_spent / f64::from(day_of_month) * f64::from(days);
        let utilization_pct = if self.config.monthly_budget_usd > 0.0 {
            monthly_spent / self.config.monthly_budget_usd * 100.0
        } else {
            0.0
        };

        Ok(CostReport {
            daily_tokens,
            monthly_spent,
            monthly_budget: self.config.monthly_budget_usd,
            utilization_pct,
            projected_monthly_spend,
            by_model,
            generated_at: now,
        })
    }

    /// Cheaper model to use instead of `current`, if the budget calls for one.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Other`] if the store fails.
    pub async fn should_downgrade_model(
        &self,
        current: &str,
    ) -> Result<Option<String>, OrchestratorError> {
        let spent = self.monthly_spent_micros(Local::now()).await?;
        Ok(self.downgrade_for(current, spent))
    }

    pub(crate) fn downgrade_for(&self, current: &str, spent_micros: u64) -> Option<String> {
        let recommended = self.recommended_tier(self.remaining_fraction(spent_micros));
        let current_tier = self.tier_of(current);
        if current_tier > recommended {
            let target = self.model_for_tier(recommended).to_string();
            info!(from = current, to = %target, "downgrading model for budget");
            Some(target)
        } else {
            None
        }
    }

    /// Model with the most tokens per dollar this month, or the default.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Other`] if the store fails.
    pub async fn get_most_cost_effective_model(&self) -> Result<String, OrchestratorError> {
        let month = self.store.records_since(start_of_month(Local::now())).await?;
        let mut totals: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
        for r in &month {
            let entry = totals.entry(r.model.as_str()).or_default();
            entry.0 += r.total_tokens();
            entry.1 += r.cost_micros;
        }

        let best = totals
            .into_iter()
            .filter(|(_, (tokens, _))| *tokens > 0)
            .map(|(model, (tokens, micros))| (model, tokens as f64 / micros.max(1) as f64))
            .fold(None::<(&str, f64)>, |best, (model, ratio)| match best {
                Some((_, best_ratio)) if best_ratio >= ratio => best,
                _ => Some((model, ratio)),
            });

        Ok(best
            .map(|(model, _)| model.to_string())
            .unwrap_or_else(|| self.config.default_model().to_string()))
    }

    /// Remove every usage record.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Other`] if the store fails.
    pub async fn reset(&self) -> Result<(), OrchestratorError> {
        self.store.clear().await?;
        Ok(())
    }
}
