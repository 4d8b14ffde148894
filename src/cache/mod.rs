//! Caching Layer
//!
//! Response cache keyed by a semantic hash of every input that affects the
//! output. In-memory by default; Redis-backed when the `caching` feature is
//! enabled and `cache.redis_url` is set.
//!
//! ## Usage
//!
//! ```no_run
//! use tokio_ai_orchestrator::cache::CacheLayer;
//! use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() {
//! let cache = CacheLayer::new_memory(1000);
//!
//! if let Some(result) = cache.get("ai:analyze:abc").await {
//!     println!("{result}");
//! }
//!
//! cache.set("ai:analyze:abc", "{\"content\":\"...\"}", Duration::from_secs(3600)).await;
//! # }
//! ```

pub mod key;

pub use key::{generate_key, with_cache, CacheOutcome, CachePolicy};

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};
#[cfg(feature = "caching")]
use tracing::warn;

/// Cache entry with creation time and TTL
#[derive(Clone)]
struct CacheEntry {
    value: String,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// Cache layer supporting memory and Redis backends
#[derive(Clone)]
pub struct CacheLayer {
    backend: CacheBackend,
    counters: Arc<CacheCounters>,
}

#[derive(Clone)]
enum CacheBackend {
    Memory(Arc<MemoryCache>),
    #[cfg(feature = "caching")]
    Redis(Arc<RedisCache>),
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

struct MemoryCache {
    store: DashMap<String, CacheEntry>,
    max_entries: usize,
}

#[cfg(feature = "caching")]
struct RedisCache {
    client: redis::Client,
}

impl MemoryCache {
    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.store.len();
        self.store.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.store.len())
    }

    /// Remove the entry with the oldest `created_at`, other than `keep`.
    ///
    /// `None` when there is no candidate; `Some(false)` when another writer
    /// removed the candidate first.
    fn evict_oldest_except(&self, keep: &str) -> Option<bool> {
        // Collect the key first so no read guard is held during remove.
        let oldest = self
            .store
            .iter()
            .filter(|e| e.key() != keep)
            .min_by_key(|e| e.value().created_at)
            .map(|e| e.key().clone())?;
        Some(self.store.remove(&oldest).is_some())
    }
}

impl CacheLayer {
    /// Create in-memory cache with max entries
    pub fn new_memory(max_entries: usize) -> Self {
        Self {
            backend: CacheBackend::Memory(Arc::new(MemoryCache {
                store: DashMap::new(),
                max_entries,
            })),
            counters: Arc::default(),
        }
    }

    /// Create Redis-backed cache
    #[cfg(feature = "caching")]
    pub async fn new_redis(redis_url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;

        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;

        Ok(Self {
            backend: CacheBackend::Redis(Arc::new(RedisCache { client })),
            counters: Arc::default(),
        })
    }

    /// Get cached value if present and not expired.
    ///
    /// An expired read is a miss and removes the entry.
    pub async fn get(&self, key: &str) -> Option<String> {
        let found = match &self.backend {
            CacheBackend::Memory(cache) => {
                let now = Instant::now();
                match cache.store.get(key) {
                    Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
                    Some(entry) => {
                        drop(entry);
                        cache.store.remove(key);
                        self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                        debug!(key, "cache expired");
                        None
                    }
                    None => None,
                }
            }
            #[cfg(feature = "caching")]
            CacheBackend::Redis(cache) => match cache.get_redis(key).await {
                Ok(value) => value,
                Err(e) => {
                    warn!(key, error = ?e, "redis get error");
                    None
                }
            },
        };

        if found.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, backend = self.backend_name(), "cache hit");
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key, backend = self.backend_name(), "cache miss");
        }
        found
    }

    /// Set cached value with TTL
    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        let key = key.into();
        let value = value.into();

        match &self.backend {
            CacheBackend::Memory(cache) => {
                cache.store.insert(
                    key.clone(),
                    CacheEntry {
                        value,
                        created_at: Instant::now(),
                        ttl,
                    },
                );
                // Bound enforced after insert; concurrent writers each trim.
                while cache.max_entries > 0 && cache.store.len() > cache.max_entries {
                    match cache.evict_oldest_except(&key) {
                        Some(true) => {
                            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                        }
                        Some(false) => {}
                        None => break,
                    }
                }
                debug!(key, ttl_secs = ttl.as_secs(), "cached (memory)");
            }
            #[cfg(feature = "caching")]
            CacheBackend::Redis(cache) => {
                let ttl_secs = ttl.as_secs().max(1);
                if let Err(e) = cache.set_redis(&key, &value, ttl_secs).await {
                    warn!(key, error = ?e, "redis set error");
                } else {
                    debug!(key, ttl_secs, "cached (redis)");
                }
            }
        }
    }

    /// Delete cached value
    pub async fn delete(&self, key: &str) {
        match &self.backend {
            CacheBackend::Memory(cache) => {
                cache.store.remove(key);
                debug!(key, "deleted from cache (memory)");
            }
            #[cfg(feature = "caching")]
            CacheBackend::Redis(cache) => {
                if let Err(e) = cache.delete_redis(key).await {
                    warn!(key, error = ?e, "redis delete error");
                }
            }
        }
    }

    /// Clear all cached values and zero the counters
    pub async fn clear(&self) {
        match &self.backend {
            CacheBackend::Memory(cache) => {
                cache.store.clear();
                debug!("cleared memory cache");
            }
            #[cfg(feature = "caching")]
            CacheBackend::Redis(cache) => {
                if let Err(e) = cache.clear_redis().await {
                    warn!(error = ?e, "redis clear error");
                }
            }
        }
        for c in [
            &self.counters.hits,
            &self.counters.misses,
            &self.counters.evictions,
            &self.counters.expirations,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }

    /// Drop every expired entry now. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        match &self.backend {
            CacheBackend::Memory(cache) => {
                let removed = cache.purge_expired();
                self.counters
                    .expirations
                    .fetch_add(removed as u64, Ordering::Relaxed);
                removed
            }
            #[cfg(feature = "caching")]
            CacheBackend::Redis(_) => 0,
        }
    }

    /// Spawn the periodic expiry sweep.
    ///
    /// The task holds only a weak reference to the store, and is aborted
    /// when the returned handle drops. Redis expires keys itself, so the
    /// Redis backend returns `None`.
    pub fn spawn_sweeper(&self, every: Duration) -> Option<SweepHandle> {
        let CacheBackend::Memory(cache) = &self.backend else {
            return None;
        };
        let store: Weak<MemoryCache> = Arc::downgrade(cache);
        let counters = Arc::downgrade(&self.counters);

        let handle = tokio::spawn(async move {
            info!(interval_secs = every.as_secs(), "starting cache sweep task");
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                ticker.tick().await;
                let Some(cache) = store.upgrade() else {
                    break;
                };
                let removed = cache.purge_expired();
                if let Some(counters) = counters.upgrade() {
                    counters
                        .expirations
                        .fetch_add(removed as u64, Ordering::Relaxed);
                }
                if removed > 0 {
                    info!(removed, "cache sweep removed expired entries");
                } else {
                    debug!("cache sweep: nothing expired");
                }
            }
        });

        Some(SweepHandle { handle })
    }

    fn backend_name(&self) -> &'static str {
        match &self.backend {
            CacheBackend::Memory(_) => "memory",
            #[cfg(feature = "caching")]
            CacheBackend::Redis(_) => "redis",
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let entries = match &self.backend {
            CacheBackend::Memory(cache) => cache.store.len(),
            #[cfg(feature = "caching")]
            CacheBackend::Redis(_) => 0,
        };
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries,
            backend: self.backend_name().to_string(),
            hits,
            misses,
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(feature = "caching")]
impl RedisCache {
    async fn get_redis(&self, key: &str) -> Result<Option<String>, redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("GET").arg(key).query_async(&mut conn).await
    }

    async fn set_redis(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(value)
            .query_async(&mut conn)
            .await
    }

    async fn delete_redis(&self, key: &str) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("DEL").arg(key).query_async(&mut conn).await
    }

    async fn clear_redis(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let keys: Vec<String> = redis::cmd("KEYS").arg("ai:*").query_async(&mut conn).await?;
        if keys.is_empty() {
            return Ok(());
        }
        redis::cmd("DEL").arg(keys).query_async(&mut conn).await
    }
}

/// Owner of the sweep task; aborts it on drop.
#[derive(Debug)]
pub struct SweepHandle {
    handle: JoinHandle<()>,
}

impl SweepHandle {
    pub(crate) fn from_task(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    /// Whether the task has stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    /// Number of entries currently held in the cache.
    pub entries: usize,
    /// Name of the storage backend in use (`"memory"` or `"redis"`).
    pub backend: String,
    /// Successful lookups.
    pub hits: u64,
    /// Failed lookups, including expired reads.
    pub misses: u64,
    /// Entries dropped to make room.
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
    /// `hits / (hits + misses)`, 0 with no lookups.
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_memory_cache() {
        let cache = CacheLayer::new_memory(10);

        cache.set("key1", "value1", HOUR).await;
        assert_eq!(cache.get("key1").await, Some("value1".to_string()));
        assert_eq!(cache.get("key2").await, None);

        cache.delete("key1").await;
        assert_eq!(cache.get("key1").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expiration() {
        let cache = CacheLayer::new_memory(10);

        cache.set("expire", "value", Duration::from_secs(1)).await;
        assert_eq!(cache.get("expire").await, Some("value".to_string()));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(cache.get("expire").await, None);
        assert_eq!(cache.stats().entries, 0, "expired read removes the entry");
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_removes_oldest() {
        let cache = CacheLayer::new_memory(3);

        for k in ["a", "b", "c"] {
            cache.set(k, k, HOUR).await;
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        cache.set("d", "d", HOUR).await;

        assert_eq!(cache.stats().entries, 3);
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get("b").await, Some("b".to_string()));
        assert_eq!(cache.get("d").await, Some("d".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_respect_bound() {
        let cache = CacheLayer::new_memory(8);
        let mut handles = Vec::new();
        for writer in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    cache.set(format!("w{writer}-{i}"), "v", HOUR).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Racing trims may each drop one entry, so the count can land below
        // the bound but never above it.
        let stats = cache.stats();
        assert!(stats.entries <= 8, "entries = {}", stats.entries);
        assert!(stats.entries > 0);
        assert_eq!(stats.evictions as usize + stats.entries, 8 * 50);
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let cache = CacheLayer::new_memory(2);
        cache.set("x", "1", HOUR).await;
        cache.set("y", "2", HOUR).await;
        cache.set("x", "3", HOUR).await;

        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get("x").await, Some("3".to_string()));
        assert_eq!(cache.get("y").await, Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_hit_rate() {
        let cache = CacheLayer::new_memory(10);
        cache.set("k", "v", HOUR).await;
        let _ = cache.get("k").await;
        let _ = cache.get("missing").await;

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_clear_removes_all_entries() {
        let cache = CacheLayer::new_memory(100);
        for i in 0..10 {
            cache.set(format!("k{i}"), format!("v{i}"), HOUR).await;
        }
        assert_eq!(cache.stats().entries, 10);
        cache.clear().await;
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().hits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_keeps_live_entries() {
        let cache = CacheLayer::new_memory(10);
        cache.set("short", "v", Duration::from_secs(1)).await;
        cache.set("long", "v", HOUR).await;

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_without_access() {
        let cache = CacheLayer::new_memory(10);
        cache.set("short", "v", Duration::from_secs(1)).await;
        let _sweeper = cache.spawn_sweeper(Duration::from_secs(2)).unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_aborts_on_drop() {
        let cache = CacheLayer::new_memory(10);
        let sweeper = cache.spawn_sweeper(Duration::from_secs(1)).unwrap();
        let task = sweeper.handle.abort_handle();
        drop(sweeper);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(task.is_finished());
    }

    #[tokio::test]
    async fn test_concurrent_access_no_corruption() {
        let cache = CacheLayer::new_memory(100);
        let mut handles = Vec::new();

        for i in 0..10 {
            let c = cache.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..50 {
                    c.set(format!("task-{i}-key-{j}"), format!("val-{i}-{j}"), HOUR)
                        .await;
                    let _ = c.get(&format!("task-{i}-key-{j}")).await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap_or(());
        }

        let stats = cache.stats();
        assert!(stats.entries <= 100, "got {}", stats.entries);
    }
}
