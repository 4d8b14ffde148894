//! # Stage: Orchestration Facade
//!
//! ## Responsibility
//! Compose every component around the three public operations. Each call
//! flows through:
//!
//! ```text
//! validate → screen → rate limit → cache ─hit→ metric → caller
//!                                    └miss→ quota → token allowance → model choice
//!                                           → balancer → retry/fallback/degrade → provider
//!                                           → usage ledger → output screen → cache store
//! ```
//!
//! ## Guarantees
//! - A cache hit never consumes quota or token allowance
//! - Degraded responses are never cached and never billed
//! - A response rejected by the output screen is still billed
//! - Every call that passed schema validation records a monitoring metric
//!
//! ## NOT Responsible For
//! - Rendering results (the caller formats [`OperationResponse`])
//! - Persisting usage beyond the configured [`UsageStore`]

pub mod prompts;
pub mod types;

pub use types::{
    to_contract, FailureResponse, OperationResponse, OrchestratorHealth, ResponseMetadata,
};

use crate::cache::{generate_key, with_cache, CacheLayer, CachePolicy, SweepHandle};
use crate::config::{validation, OrchestratorConfig};
use crate::cost::{
    f64_to_micro, CostManager, HttpModelRegistry, InMemoryUsageStore, ModelRegistry, UsageStore,
};
use crate::monitoring::{AiMetric, Monitor};
use crate::provider::{GenerationProvider, GenerationRequest, GenerationResponse, ProviderError};
use crate::queue::{EnqueueOptions, Job, LoadBalancer, Priority};
use crate::resilience::{
    degraded_content, BoxedAttempt, DegradedFn, ErrorHandler, Recovered, RetryPolicy,
};
use crate::security::{RawInput, SecurityValidator, ValidatedInput};
use crate::{metrics, OperationKind, OrchestratorError, SectionType, SessionId};
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use types::{CachedPayload, FreshUsage};

/// Model label recorded for canned degraded payloads.
const DEGRADED_MODEL: &str = "degraded";

type Outcome = Recovered<GenerationResponse>;

/// Owner of every component; the single entry point for callers.
pub struct Orchestrator {
    config: OrchestratorConfig,
    provider: Arc<dyn GenerationProvider>,
    security: SecurityValidator,
    cache: CacheLayer,
    cache_policy: CachePolicy,
    cost: CostManager,
    handler: ErrorHandler,
    balancer: LoadBalancer<Outcome>,
    monitor: Monitor,
    _sweeper: Option<SweepHandle>,
    _session_sweeper: SweepHandle,
}

/// Screened fields of one request.
struct Prepared {
    op: OperationKind,
    session: SessionId,
    text: String,
    target_role: Option<String>,
    section: Option<SectionType>,
    model: String,
}

impl Orchestrator {
    /// Orchestrator with an in-memory usage ledger.
    ///
    /// Must be called inside a Tokio runtime: the cache sweep task is
    /// spawned here.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::ConfigError`] if `config` is invalid or the
    /// configured Redis cache is unreachable.
    pub async fn new(
        config: OrchestratorConfig,
        provider: Arc<dyn GenerationProvider>,
    ) -> Result<Self, OrchestratorError> {
        Self::with_store(config, provider, Arc::new(InMemoryUsageStore::new())).await
    }

    /// Orchestrator over a caller-supplied usage ledger. Pricing is loaded from
    /// `cost.registry_url` when set.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::new`].
    pub async fn with_store(
        config: OrchestratorConfig,
        provider: Arc<dyn GenerationProvider>,
        store: Arc<dyn UsageStore>,
    ) -> Result<Self, OrchestratorError> {
        let registry = config.cost.registry_url.as_deref().map(|url| {
            Arc::new(
                HttpModelRegistry::new(url)
                    .with_timeout(Duration::from_millis(config.provider.timeout_ms)),
            ) as Arc<dyn ModelRegistry>
        });
        Self::with_components(config, provider, store, registry).await
    }

    /// Orchestrator with every collaborator supplied.
    ///
    /// # Errors
    ///
    /// See [`Orchestrator::new`].
    pub async fn with_components(
        config: OrchestratorConfig,
        provider: Arc<dyn GenerationProvider>,
        store: Arc<dyn UsageStore>,
        registry: Option<Arc<dyn ModelRegistry>>,
    ) -> Result<Self, OrchestratorError> {
        if let Err(errors) = validation::validate(&config) {
            let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
            return Err(OrchestratorError::ConfigError(joined.join("; ")));
        }

        let security = SecurityValidator::new(&config.security)?;
        let cache = Self::build_cache(&config).await?;
        let sweep_every = Duration::from_secs(config.cache.sweep_interval_secs);
        let sweeper = cache.spawn_sweeper(sweep_every);
        let session_sweeper = security.spawn_session_sweeper(sweep_every);

        let mut cost = CostManager::new(&config.cost, store);
        if let Some(registry) = registry {
            cost = cost.with_registry(registry);
            let priced = cost.refresh_pricing().await;
            debug!(models = priced, "pricing loaded");
        }

        // Alerts see spend already in the ledger, not just this process's calls.
        let monitor = Monitor::new(&config.monitoring, config.cost.monthly_budget_usd);
        match cost.generate_cost_report().await {
            Ok(report) => {
                let opened = monitor.update_spend(report.monthly_spent);
                debug!(
                    monthly_spent = report.monthly_spent,
                    alerts = opened.len(),
                    "spend seeded from ledger"
                );
            }
            Err(e) => warn!(error = %e, "could not seed spend from ledger"),
        }

        info!(
            provider = provider.name(),
            shards = config.queue.shards,
            max_concurrent = config.queue.max_concurrent,
            cache = %cache.stats().backend,
            "orchestrator ready"
        );

        Ok(Self {
            cache_policy: CachePolicy::from_config(&config.cache),
            handler: ErrorHandler::new(RetryPolicy::from_config(&config.retry)),
            balancer: LoadBalancer::from_config(&config.queue),
            _sweeper: sweeper,
            _session_sweeper: session_sweeper,
            monitor,
            security,
            cache,
            cost,
            provider,
            config,
        })
    }

    #[cfg(feature = "caching")]
    async fn build_cache(config: &OrchestratorConfig) -> Result<CacheLayer, OrchestratorError> {
        match &config.cache.redis_url {
            Some(url) => CacheLayer::new_redis(url)
                .await
                .map_err(|e| OrchestratorError::ConfigError(format!("redis cache: {e}"))),
            None => Ok(CacheLayer::new_memory(config.cache.max_entries)),
        }
    }

    #[cfg(not(feature = "caching"))]
    async fn build_cache(config: &OrchestratorConfig) -> Result<CacheLayer, OrchestratorError> {
        if config.cache.redis_url.is_some() {
            warn!("cache.redis_url set but the `caching` feature is disabled; using memory cache");
        }
        Ok(CacheLayer::new_memory(config.cache.max_entries))
    }

    /// Analyze `input.text` against the optional target role.
    ///
    /// # Errors
    ///
    /// Any [`OrchestratorError`]; see the module flow.
    pub async fn analyze(&self, input: &RawInput) -> Result<OperationResponse, OrchestratorError> {
        self.execute(OperationKind::Analyze, input).await
    }

    /// Generate the section named by `input.section_type` from `input.text`.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Validation`] if `section_type` is missing, plus
    /// everything [`Orchestrator::analyze`] may return.
    pub async fn generate_section(
        &self,
        input: &RawInput,
    ) -> Result<OperationResponse, OrchestratorError> {
        self.execute(OperationKind::GenerateSection, input).await
    }

    /// Rewrite `input.text` for `input.target_role`.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Validation`] if `target_role` is missing, plus
    /// everything [`Orchestrator::analyze`] may return.
    pub async fn optimize(&self, input: &RawInput) -> Result<OperationResponse, OrchestratorError> {
        self.execute(OperationKind::Optimize, input).await
    }

    async fn execute(
        &self,
        op: OperationKind,
        raw: &RawInput,
    ) -> Result<OperationResponse, OrchestratorError> {
        let started = Instant::now();

        let input = match self.validate(op, raw) {
            Ok(input) => input,
            Err(e) => {
                metrics::inc_error(op.as_str(), e.code());
                return Err(e);
            }
        };
        let session = input.session_id.clone();
        let model_hint = input
            .model
            .clone()
            .unwrap_or_else(|| self.config.cost.default_model().to_string());

        let result = self.run(op, input).await;
        let latency = started.elapsed();

        let metric = AiMetric::new(op, model_hint, session.clone()).with_latency(latency);
        match &result {
            Ok(response) => {
                let meta = &response.metadata;
                let mut metric = AiMetric {
                    model: meta.model_used.clone(),
                    ..metric.with_usage(meta.tokens_used, meta.estimated_cost)
                };
                let outcome = if meta.cached {
                    metric = metric.cached();
                    "cached"
                } else if meta.degraded {
                    metric = metric.failed("DEGRADED");
                    "degraded"
                } else {
                    "success"
                };
                self.monitor.record_metric(metric);
                metrics::record_request(op.as_str(), outcome, latency);
            }
            Err(e) => {
                warn!(
                    op = %op,
                    session = %session,
                    code = e.code(),
                    error = %e,
                    "operation failed"
                );
                self.monitor.record_metric(metric.failed(e.code()));
                metrics::inc_error(op.as_str(), e.code());
                metrics::record_request(op.as_str(), "error", latency);
            }
        }
        result
    }

    fn validate(
        &self,
        op: OperationKind,
        raw: &RawInput,
    ) -> Result<ValidatedInput, OrchestratorError> {
        let input = self.security.validate_input(raw)?;
        let mut missing = Vec::new();
        if op == OperationKind::GenerateSection && input.section_type.is_none() {
            missing.push("section_type is required for generate_section".to_string());
        }
        if op == OperationKind::Optimize && input.target_role.is_none() {
            missing.push("target_role is required for optimize".to_string());
        }
        if missing.is_empty() {
            Ok(input)
        } else {
            Err(OrchestratorError::Validation(missing))
        }
    }

    async fn run(
        &self,
        op: OperationKind,
        input: ValidatedInput,
    ) -> Result<OperationResponse, OrchestratorError> {
        let started = Instant::now();
        let text = self.security.screen(&input.text)?;
        let target_role = input
            .target_role
            .as_deref()
            .map(|role| self.security.screen(role))
            .transpose()?;

        self.security.check_request_rate(&input.session_id)?;

        let prepared = Prepared {
            op,
            session: input.session_id,
            model: input
                .model
                .unwrap_or_else(|| self.config.cost.default_model().to_string()),
            section: input.section_type,
            text,
            target_role,
        };

        let key = generate_key(
            op,
            &[
                prepared.text.as_str(),
                prepared.section.map(|s| s.as_str()).unwrap_or_default(),
                prepared.target_role.as_deref().unwrap_or_default(),
            ],
            &prepared.model,
            self.config.provider.temperature,
        );

        let outcome = with_cache(
            &self.cache,
            || key,
            |payload: &CachedPayload| {
                let storable = !payload.degraded
                    && self.cache_policy.should_cache(&prepared.text, &payload.content);
                storable.then(|| self.cache_policy.ttl_for(op, &payload.content))
            },
            || self.fill(&prepared),
        )
        .await?;
        metrics::record_cache_lookup(op.as_str(), outcome.hit);

        let payload = outcome.value;
        let fresh = payload.fresh.unwrap_or_default();
        if outcome.hit {
            debug!(op = %op, session = %prepared.session, "served from cache");
        }

        Ok(OperationResponse {
            success: true,
            metadata: ResponseMetadata {
                tokens_used: fresh.tokens,
                response_time_ms: started.elapsed().as_millis() as u64,
                model_used: payload.model,
                estimated_cost: fresh.cost_usd,
                remaining_quota: payload.fresh.map(|f| f.remaining_tokens),
                cached: outcome.hit,
                degraded: payload.degraded,
            },
            content: payload.content,
        })
    }

    /// Cache-miss path: quota, model choice, queued upstream call, billing.
    async fn fill(&self, p: &Prepared) -> Result<CachedPayload, OrchestratorError> {
        let quota = self.cost.check_usage_quota(&p.session).await?;
        if !quota.can_proceed {
            let reason = if quota.remaining_tokens == 0 {
                format!("daily token limit reached ({} used)", quota.daily_usage)
            } else {
                format!("monthly budget exhausted (${:.2} spent)", quota.monthly_spent)
            };
            return Err(OrchestratorError::QuotaExceeded(reason));
        }

        let model = self
            .cost
            .downgrade_for(&p.model, f64_to_micro(quota.monthly_spent))
            .unwrap_or_else(|| p.model.clone());

        let request = prompts::build_request(
            p.op,
            &p.text,
            p.section,
            p.target_role.as_deref(),
            &model,
            self.config.provider.max_tokens,
            self.config.provider.temperature,
        );
        let estimated = request.estimated_prompt_tokens() + u64::from(request.max_tokens);
        self.security.check_token_usage(&p.session, estimated)?;

        let fallback = self.config.cost.fallback_model();
        let fallback = (fallback != model).then(|| fallback.to_string());
        let job = self.upstream_job(request, fallback, degraded_content(p.op, p.section));

        let params = serde_json::json!({
            "session": p.session.as_str(),
            "model": model,
            "chars": p.text.chars().count(),
        });
        let options =
            EnqueueOptions::from_config(&self.config.queue).with_priority(priority_for(p.op));
        let upstream_started = Instant::now();
        let recovered = self.balancer.enqueue(p.op, params, job, options)?.wait().await?;

        if recovered.is_degraded() {
            return Ok(CachedPayload {
                content: recovered.value.content,
                model: DEGRADED_MODEL.to_string(),
                degraded: true,
                fresh: Some(FreshUsage {
                    tokens: 0,
                    cost_usd: 0.0,
                    remaining_tokens: quota.remaining_tokens,
                }),
            });
        }

        // Billed before the output screen: a rejected response still consumed tokens.
        let response = recovered.value;
        let record = self
            .cost
            .track_usage(
                &p.session,
                p.op,
                &response.model,
                response.prompt_tokens,
                response.completion_tokens,
                upstream_started.elapsed(),
            )
            .await?;
        metrics::add_tokens(&response.model, record.total_tokens());
        self.monitor
            .update_spend(quota.monthly_spent + record.cost_usd());
        let content = self.security.validate_output(&response.content)?;

        Ok(CachedPayload {
            content,
            model: response.model,
            degraded: false,
            fresh: Some(FreshUsage {
                tokens: record.total_tokens(),
                cost_usd: record.cost_usd(),
                remaining_tokens: quota.remaining_tokens.saturating_sub(record.total_tokens()),
            }),
        })
    }

    fn upstream_job(
        &self,
        request: GenerationRequest,
        fallback_model: Option<String>,
        degraded: String,
    ) -> Job<Outcome> {
        let provider = Arc::clone(&self.provider);
        let handler = self.handler.clone();
        Arc::new(move || {
            let primary = attempt(Arc::clone(&provider), request.clone());
            let fallback = fallback_model
                .as_ref()
                .map(|m| attempt(Arc::clone(&provider), request.with_model(m.as_str())));
            let content = degraded.clone();
            let degraded_fn: DegradedFn<'static, GenerationResponse> = Box::new(move || {
                Some(GenerationResponse {
                    content,
                    model: DEGRADED_MODEL.to_string(),
                    prompt_tokens: 0,
                    completion_tokens: 0,
                    estimated_usage: false,
                })
            });
            let handler = handler.clone();
            async move {
                handler
                    .execute_with_fallback(primary, fallback, Some(degraded_fn))
                    .await
                    .map_err(OrchestratorError::from)
            }
            .boxed()
        })
    }

    /// Component health, alerts and month-to-date spend.
    pub async fn health_report(&self) -> OrchestratorHealth {
        OrchestratorHealth {
            monitoring: self.monitor.generate_health_report(),
            cache: self.cache.stats(),
            queue: self.balancer.status(),
            security: self.security.security_stats(),
            budget: self.cost.generate_cost_report().await.ok(),
        }
    }

    /// Clear cache, sessions, queues, alerts and the usage ledger.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Other`] if the usage store cannot be cleared.
    pub async fn reset(&self) -> Result<(), OrchestratorError> {
        self.cache.clear().await;
        self.security.reset();
        self.balancer.reset();
        self.monitor.reset();
        self.cost.reset().await?;
        info!("orchestrator state reset");
        Ok(())
    }

    /// Active configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Security validator.
    pub fn security(&self) -> &SecurityValidator {
        &self.security
    }

    /// Response cache.
    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    /// Cost manager.
    pub fn cost(&self) -> &CostManager {
        &self.cost
    }

    /// Monitor.
    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Queue balancer.
    pub fn balancer(&self) -> &LoadBalancer<Recovered<GenerationResponse>> {
        &self.balancer
    }
}

fn attempt(
    provider: Arc<dyn GenerationProvider>,
    request: GenerationRequest,
) -> BoxedAttempt<'static, GenerationResponse, ProviderError> {
    Box::new(move || {
        let provider = Arc::clone(&provider);
        let request = request.clone();
        async move { provider.generate(&request).await }.boxed()
    })
}

/// Interactive section edits jump ahead; bulk rewrites wait.
fn priority_for(op: OperationKind) -> Priority {
    match op {
        OperationKind::GenerateSection => Priority::HIGH,
        OperationKind::Analyze => Priority::NORMAL,
        OperationKind::Optimize => Priority::LOW,
    }
}
