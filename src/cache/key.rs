//! Semantic cache keys, cacheability rules and the [`with_cache`] wrapper.

use super::CacheLayer;
use crate::config::CacheConfig;
use crate::OperationKind;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Build a cache key for `op` over every input that affects the output.
///
/// Each part is length-prefixed before hashing so that `["ab", "c"]` and
/// `["a", "bc"]` never collide. Format: `ai:<op>:<sha256 hex>`.
pub fn generate_key(op: OperationKind, fields: &[&str], model: &str, temperature: f32) -> String {
    let mut hasher = Sha256::new();
    let temperature = format!("{temperature:.3}");
    let parts = std::iter::once(op.as_str())
        .chain(fields.iter().copied())
        .chain([model, temperature.as_str()]);
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    format!("ai:{}:{}", op.as_str(), hex::encode(hasher.finalize()))
}

/// Which responses are worth caching and for how long.
#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    min_input_chars: usize,
    min_output_chars: usize,
    max_input_chars: usize,
    analysis_ttl: Duration,
    generation_ttl: Duration,
    optimization_ttl: Duration,
}

const LONG_CONTENT_CHARS: usize = 2_000;
const SHORT_CONTENT_CHARS: usize = 200;

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl CachePolicy {
    /// Build from the `[cache]` section.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            min_input_chars: config.min_input_chars,
            min_output_chars: config.min_output_chars,
            max_input_chars: config.max_input_chars,
            analysis_ttl: Duration::from_secs(config.analysis_ttl_secs),
            generation_ttl: Duration::from_secs(config.generation_ttl_secs),
            optimization_ttl: Duration::from_secs(config.optimization_ttl_secs),
        }
    }

    /// Skip trivially short inputs and outputs, and very large inputs.
    pub fn should_cache(&self, input: &str, output: &str) -> bool {
        let input_len = input.chars().count();
        input_len >= self.min_input_chars
            && input_len <= self.max_input_chars
            && output.chars().count() >= self.min_output_chars
    }

    /// Base TTL for `op`, doubled for long content and halved for short.
    pub fn ttl_for(&self, op: OperationKind, content: &str) -> Duration {
        let base = match op {
            OperationKind::Analyze => self.analysis_ttl,
            OperationKind::GenerateSection => self.generation_ttl,
            OperationKind::Optimize => self.optimization_ttl,
        };
        let len = content.chars().count();
        if len > LONG_CONTENT_CHARS {
            base * 2
        } else if len < SHORT_CONTENT_CHARS {
            base / 2
        } else {
            base
        }
    }
}

/// A value and whether it came from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheOutcome<T> {
    /// The value.
    pub value: T,
    /// `true` when served from the cache.
    pub hit: bool,
}

/// Serve `op` from `cache` when possible, otherwise run it and store the
/// result for the TTL `ttl_fn` returns. `ttl_fn` returning `None` skips the
/// store. A cached value that fails to deserialize counts as a miss.
pub async fn with_cache<T, E, K, TtlFn, Op, Fut>(
    cache: &CacheLayer,
    key_fn: K,
    ttl_fn: TtlFn,
    op: Op,
) -> Result<CacheOutcome<T>, E>
where
    T: Serialize + DeserializeOwned,
    K: FnOnce() -> String,
    TtlFn: FnOnce(&T) -> Option<Duration>,
    Op: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let key = key_fn();

    if let Some(raw) = cache.get(&key).await {
        match serde_json::from_str::<T>(&raw) {
            Ok(value) => return Ok(CacheOutcome { value, hit: true }),
            Err(e) => {
                warn!(key, error = %e, "discarding undecodable cache entry");
                cache.delete(&key).await;
            }
        }
    }

    let value = op().await?;

    if let Some(ttl) = ttl_fn(&value) {
        match serde_json::to_string(&value) {
            Ok(raw) => cache.set(key, raw, ttl).await,
            Err(e) => warn!(error = %e, "failed to serialize value for cache"),
        }
    } else {
        debug!(key, "result not cached");
    }

    Ok(CacheOutcome { value, hit: false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_key_is_pure() {
        let a = generate_key(OperationKind::Analyze, &["resume", "engineer"], "m/x", 0.7);
        let b = generate_key(OperationKind::Analyze, &["resume", "engineer"], "m/x", 0.7);
        assert_eq!(a, b);
        assert!(a.starts_with("ai:analyze:"));
        assert_eq!(a.len(), "ai:analyze:".len() + 64);
    }

    #[test]
    fn test_any_field_change_changes_key() {
        let base = generate_key(OperationKind::Optimize, &["text", "role"], "m/x", 0.7);
        assert_ne!(base, generate_key(OperationKind::Optimize, &["text!", "role"], "m/x", 0.7));
        assert_ne!(base, generate_key(OperationKind::Optimize, &["text", "role"], "m/y", 0.7));
        assert_ne!(base, generate_key(OperationKind::Optimize, &["text", "role"], "m/x", 0.2));
        assert_ne!(base, generate_key(OperationKind::Analyze, &["text", "role"], "m/x", 0.7));
    }

    #[test]
    fn test_length_prefix_prevents_boundary_collisions() {
        let a = generate_key(OperationKind::Analyze, &["ab", "c"], "m/x", 0.7);
        let b = generate_key(OperationKind::Analyze, &["a", "bc"], "m/x", 0.7);
        assert_ne!(a, b);
    }

    #[test]
    fn test_should_cache_bounds() {
        let policy = CachePolicy::default();
        let output = "x".repeat(20);
        assert!(policy.should_cache("0123456789", &output));
        assert!(!policy.should_cache("short", &output));
        assert!(!policy.should_cache("0123456789", "too short"));
        assert!(!policy.should_cache(&"x".repeat(10_001), &output));
    }

    #[test]
    fn test_ttl_tiers_and_adjustments() {
        let policy = CachePolicy::default();
        let medium = "x".repeat(500);
        let analysis = policy.ttl_for(OperationKind::Analyze, &medium);
        let generation = policy.ttl_for(OperationKind::GenerateSection, &medium);
        let optimize = policy.ttl_for(OperationKind::Optimize, &medium);
        assert!(analysis > generation && generation > optimize);
        assert_eq!(analysis, Duration::from_secs(24 * 3600));

        assert_eq!(
            policy.ttl_for(OperationKind::Analyze, &"x".repeat(2_001)),
            Duration::from_secs(48 * 3600)
        );
        assert_eq!(
            policy.ttl_for(OperationKind::Analyze, "tiny"),
            Duration::from_secs(12 * 3600)
        );
    }

    #[tokio::test]
    async fn test_with_cache_runs_op_once() {
        let cache = CacheLayer::new_memory(10);
        let calls = AtomicUsize::new(0);

        for expected_hit in [false, true] {
            let outcome = with_cache(
                &cache,
                || "ai:analyze:k".to_string(),
                |_: &String| Some(Duration::from_secs(60)),
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>("computed".to_string())
                },
            )
            .await
            .unwrap();
            assert_eq!(outcome.value, "computed");
            assert_eq!(outcome.hit, expected_hit);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_cache_skips_store_when_ttl_none() {
        let cache = CacheLayer::new_memory(10);
        let _ = with_cache(
            &cache,
            || "k".to_string(),
            |_: &u32| None,
            || async { Ok::<_, String>(7u32) },
        )
        .await;
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_with_cache_errors_are_not_stored() {
        let cache = CacheLayer::new_memory(10);
        let result = with_cache(
            &cache,
            || "k".to_string(),
            |_: &u32| Some(Duration::from_secs(60)),
            || async { Err::<u32, _>("boom") },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_a_miss() {
        let cache = CacheLayer::new_memory(10);
        cache.set("k", "not json", Duration::from_secs(60)).await;
        let outcome = with_cache(
            &cache,
            || "k".to_string(),
            |_: &u32| Some(Duration::from_secs(60)),
            || async { Ok::<_, String>(3u32) },
        )
        .await
        .unwrap();
        assert!(!outcome.hit);
        assert_eq!(outcome.value, 3);
    }
}
