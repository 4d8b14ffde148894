//! Least-loaded routing across independent queue shards.

use super::{EnqueueOptions, Job, QueueStatus, RequestQueue, Ticket};
use crate::config::QueueConfig;
use crate::{OperationKind, OrchestratorError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Last reported queued count of every shard of one balancer.
#[derive(Debug)]
struct DepthBoard {
    shards: Vec<AtomicUsize>,
}

impl DepthBoard {
    fn total(&self) -> usize {
        self.shards.iter().map(|d| d.load(Ordering::Relaxed)).sum()
    }
}

/// One shard's slot on its balancer's depth board.
#[derive(Debug, Clone)]
pub(crate) struct ShardDepth {
    board: Arc<DepthBoard>,
    index: usize,
}

impl ShardDepth {
    /// Store this shard's depth and return the total across shards.
    pub(crate) fn store(&self, depth: usize) -> usize {
        self.board.shards[self.index].store(depth, Ordering::Relaxed);
        self.board.total()
    }
}

/// Aggregate status across shards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalancerStatus {
    /// Per-shard status, by index.
    pub shards: Vec<QueueStatus>,
    /// Sum of queued items.
    pub total_queued: usize,
    /// Sum of running items.
    pub total_in_flight: usize,
    /// Requests refused because every shard was full.
    pub saturated: u64,
}

/// Routes each request to the shard with the smallest `queued + in_flight`.
pub struct LoadBalancer<T> {
    shards: Vec<RequestQueue<T>>,
    depth: Arc<DepthBoard>,
    saturated: AtomicU64,
}

impl<T: Send + 'static> LoadBalancer<T> {
    /// `shard_count` queues, each sized by `config` (at least one shard).
    pub fn new(shard_count: usize, config: &QueueConfig) -> Self {
        let count = shard_count.max(1);
        let depth = Arc::new(DepthBoard {
            shards: (0..count).map(|_| AtomicUsize::new(0)).collect(),
        });
        let shards = (0..count)
            .map(|index| {
                let slot = ShardDepth {
                    board: Arc::clone(&depth),
                    index,
                };
                RequestQueue::with_depth(config, slot)
            })
            .collect();
        Self {
            shards,
            depth,
            saturated: AtomicU64::new(0),
        }
    }

    /// Build from the `[queue]` section.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.shards, config)
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Index of the least-loaded shard; ties go to the lowest index.
    pub fn select_shard(&self) -> usize {
        self.shards
            .iter()
            .enumerate()
            .min_by_key(|(idx, shard)| (shard.status().load(), *idx))
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }

    /// Enqueue on the least-loaded shard that still has room.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::QueueSaturated`] when every shard is full.
    pub fn enqueue(
        &self,
        op_kind: OperationKind,
        params: serde_json::Value,
        job: Job<T>,
        options: EnqueueOptions,
    ) -> Result<Ticket<T>, OrchestratorError> {
        let mut order: Vec<(usize, usize)> = self
            .shards
            .iter()
            .enumerate()
            .map(|(idx, shard)| (shard.status().load(), idx))
            .collect();
        order.sort_unstable();

        let Some(idx) = order
            .into_iter()
            .map(|(_, idx)| idx)
            .find(|idx| self.shards[*idx].has_capacity())
        else {
            self.saturated.fetch_add(1, Ordering::Relaxed);
            warn!(op = %op_kind, shards = self.shards.len(), "all queue shards saturated");
            return Err(OrchestratorError::QueueSaturated);
        };

        debug!(op = %op_kind, shard = idx, "routing request");
        self.shards[idx].enqueue(op_kind, params, job, options)
    }

    /// Queued items across shards as last published to the depth gauge.
    pub fn reported_depth(&self) -> usize {
        self.depth.total()
    }

    /// Snapshot of every shard.
    pub fn status(&self) -> BalancerStatus {
        let shards: Vec<QueueStatus> = self.shards.iter().map(RequestQueue::status).collect();
        BalancerStatus {
            total_queued: shards.iter().map(|s| s.queued).sum(),
            total_in_flight: shards.iter().map(|s| s.in_flight).sum(),
            saturated: self.saturated.load(Ordering::Relaxed),
            shards,
        }
    }

    /// Reset every shard.
    pub fn reset(&self) {
        for shard in &self.shards {
            shard.reset();
        }
        self.saturated.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(max_concurrent: usize, max_queue_size: usize) -> QueueConfig {
        QueueConfig {
            max_concurrent,
            max_queue_size,
            ..QueueConfig::default()
        }
    }

    fn slow_job() -> Job<u8> {
        Arc::new(|| {
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(1)
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_ties_go_to_lowest_index() {
        let lb: LoadBalancer<u8> = LoadBalancer::new(3, &config(1, 10));
        assert_eq!(lb.select_shard(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_routes_to_least_loaded() {
        let lb: LoadBalancer<u8> = LoadBalancer::new(2, &config(1, 10));
        let mut tickets = Vec::new();
        for _ in 0..4 {
            tickets.push(
                lb.enqueue(
                    OperationKind::Analyze,
                    serde_json::Value::Null,
                    slow_job(),
                    EnqueueOptions::default(),
                )
                .unwrap(),
            );
        }
        let status = lb.status();
        assert_eq!(status.shards[0].load(), 2);
        assert_eq!(status.shards[1].load(), 2);
        assert_eq!(status.total_in_flight, 2);
        assert_eq!(status.total_queued, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturation_when_every_shard_full() {
        let lb: LoadBalancer<u8> = LoadBalancer::new(2, &config(1, 1));
        // Each shard: one running, one queued.
        for _ in 0..4 {
            lb.enqueue(
                OperationKind::Analyze,
                serde_json::Value::Null,
                slow_job(),
                EnqueueOptions::default(),
            )
            .unwrap();
        }
        let err = lb
            .enqueue(
                OperationKind::Analyze,
                serde_json::Value::Null,
                slow_job(),
                EnqueueOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::QueueSaturated));
        assert_eq!(lb.status().saturated, 1);
    }

    fn enqueue(lb: &LoadBalancer<u8>, job: Job<u8>) -> Ticket<u8> {
        lb.enqueue(
            OperationKind::Analyze,
            serde_json::Value::Null,
            job,
            EnqueueOptions::default(),
        )
        .unwrap()
    }

    fn quick_job() -> Job<u8> {
        Arc::new(|| {
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(2)
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_shard_is_avoided_while_others_drain() {
        let lb: LoadBalancer<u8> = LoadBalancer::new(3, &config(1, 10));
        let _pinned = enqueue(&lb, slow_job());
        assert_eq!(lb.status().shards[0].in_flight, 1);

        for _ in 0..6 {
            let ticket = enqueue(&lb, quick_job());
            assert_eq!(lb.status().shards[0].load(), 1);
            assert_eq!(ticket.wait().await.unwrap(), 2);
        }

        let status = lb.status();
        assert_eq!(status.shards[0].processed, 0);
        assert_eq!(status.shards[1].processed + status.shards[2].processed, 6);
        assert_eq!(status.shards[1].processed, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reported_depth_follows_dispatch_and_reset() {
        let lb: LoadBalancer<u8> = LoadBalancer::new(2, &config(1, 10));
        let first = enqueue(&lb, quick_job());
        let second = enqueue(&lb, quick_job());
        let _third = enqueue(&lb, slow_job());
        let _fourth = enqueue(&lb, slow_job());
        // Two running, two waiting.
        assert_eq!(lb.reported_depth(), 2);

        first.wait().await.unwrap();
        second.wait().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(lb.status().total_queued, 0);
        assert_eq!(lb.reported_depth(), 0);

        let _fifth = enqueue(&lb, slow_job());
        let _sixth = enqueue(&lb, slow_job());
        assert_eq!(lb.reported_depth(), 2);
        lb.reset();
        assert_eq!(lb.reported_depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_shards_clamped_to_one() {
        let lb: LoadBalancer<u8> = LoadBalancer::new(0, &config(1, 1));
        assert_eq!(lb.shard_count(), 1);
    }
}
