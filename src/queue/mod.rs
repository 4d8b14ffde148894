//! # Stage: Request Queue
//!
//! ## Responsibility
//! Bounded priority queue that runs jobs with capped concurrency. Each item
//! races its own timeout against completion, and transient failures are
//! re-enqueued at a lower priority.
//!
//! ## Guarantees
//! - Dequeue order: higher [`Priority`] first, then arrival order
//! - Arrival order survives retries (the sequence number is kept)
//! - Bounded: enqueue beyond `max_queue_size` fails immediately with
//!   [`OrchestratorError::QueueSaturated`]
//! - Exactly-once settlement: a [`Ticket`] resolves once, by completion or
//!   by timeout, never both. A timeout also cancels the running attempt
//! - Shards built by the balancer publish their depth after every change
//!
//! ## NOT Responsible For
//! - Choosing a shard (see [`balancer`])
//! - Backoff between attempts of a single job (see `resilience`)

pub mod balancer;

pub use balancer::{BalancerStatus, LoadBalancer};

use balancer::ShardDepth;

use crate::config::QueueConfig;
use crate::{OperationKind, OrchestratorError};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Request priority; higher values are dequeued first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Priority(pub u8);

impl Priority {
    /// Background work.
    pub const LOW: Priority = Priority(1);
    /// Standard priority for most requests.
    pub const NORMAL: Priority = Priority(5);
    /// Interactive requests.
    pub const HIGH: Priority = Priority(8);

    /// One step lower, floored at 0.
    pub fn decremented(self) -> Self {
        Priority(self.0.saturating_sub(1))
    }
}

/// A unit of work. Called once per attempt.
pub type Job<T> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<T, OrchestratorError>> + Send + Sync>;

/// Per-item enqueue options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnqueueOptions {
    /// Dequeue priority.
    pub priority: Priority,
    /// Re-enqueues allowed after a retryable failure.
    pub max_retries: u32,
    /// Deadline from enqueue to settlement.
    pub timeout: Duration,
}

impl EnqueueOptions {
    /// Options from the `[queue]` section.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            priority: Priority(config.default_priority),
            max_retries: config.max_retries,
            timeout: config.timeout(),
        }
    }

    /// Override the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

type SettleResult<T> = Result<T, OrchestratorError>;

/// Single-use settlement slot shared by the item, its running job and its
/// timeout task.
struct Settle<T> {
    tx: Mutex<Option<oneshot::Sender<SettleResult<T>>>>,
    timer: Mutex<Option<AbortHandle>>,
    job: Mutex<Option<AbortHandle>>,
}

impl<T> Settle<T> {
    fn new(tx: oneshot::Sender<SettleResult<T>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            timer: Mutex::new(None),
            job: Mutex::new(None),
        }
    }

    /// Deliver `result` if nobody has yet. Returns whether this call won.
    ///
    /// The winner cancels the timer and any attempt still running.
    fn settle(&self, result: SettleResult<T>) -> bool {
        let tx = self.tx.lock().take();
        match tx {
            Some(tx) => {
                if let Some(timer) = self.timer.lock().take() {
                    timer.abort();
                }
                if let Some(job) = self.job.lock().take() {
                    job.abort();
                }
                // The caller may have dropped its ticket; the item still counts as settled.
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    fn is_settled(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Track the running attempt so a timeout can cancel it.
    fn attach_job(&self, job: AbortHandle) {
        *self.job.lock() = Some(job);
        // Settled between spawn and registration.
        if self.is_settled() {
            if let Some(job) = self.job.lock().take() {
                job.abort();
            }
        }
    }
}

struct QueueItem<T> {
    id: Uuid,
    op_kind: OperationKind,
    params: serde_json::Value,
    priority: Priority,
    sequence: u64,
    enqueued_at: Instant,
    retries: u32,
    max_retries: u32,
    job: Job<T>,
    settle: Arc<Settle<T>>,
}

impl<T> PartialEq for QueueItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<T> Eq for QueueItem<T> {}

impl<T> PartialOrd for QueueItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueueItem<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then lower sequence (FIFO)
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other => other,
        }
    }
}

/// Handle returned by [`RequestQueue::enqueue`].
#[derive(Debug)]
pub struct Ticket<T> {
    id: Uuid,
    rx: oneshot::Receiver<SettleResult<T>>,
}

impl<T> Ticket<T> {
    /// Item id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the item to settle.
    ///
    /// # Errors
    ///
    /// The job's error, [`OrchestratorError::Timeout`], or
    /// [`OrchestratorError::ChannelClosed`] if the queue was dropped.
    pub async fn wait(self) -> Result<T, OrchestratorError> {
        self.rx.await.map_err(|_| OrchestratorError::ChannelClosed)?
    }
}

/// Queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct QueueStatus {
    /// Items waiting.
    pub queued: usize,
    /// Items running.
    pub in_flight: usize,
    /// Mean time from enqueue to first dispatch.
    pub avg_wait_ms: f64,
    /// Items settled successfully.
    pub processed: u64,
    /// Items settled with an error.
    pub failed: u64,
    /// Items settled by their timeout.
    pub timed_out: u64,
    /// Enqueues refused because the queue was full.
    pub rejected: u64,
    /// Re-enqueues after retryable failures.
    pub retried: u64,
}

impl QueueStatus {
    /// `queued + in_flight`.
    pub fn load(&self) -> usize {
        self.queued + self.in_flight
    }
}

struct State<T> {
    heap: BinaryHeap<QueueItem<T>>,
    in_flight: usize,
    next_sequence: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    rejected: AtomicU64,
    retried: AtomicU64,
    dispatched: AtomicU64,
    wait_micros: AtomicU64,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    counters: Counters,
    max_concurrent: usize,
    max_queue_size: usize,
    depth: Option<ShardDepth>,
}

/// Bounded priority queue with capped concurrency.
pub struct RequestQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RequestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> RequestQueue<T> {
    /// Create a queue.
    pub fn new(max_concurrent: usize, max_queue_size: usize) -> Self {
        Self::build(max_concurrent, max_queue_size, None)
    }

    fn build(max_concurrent: usize, max_queue_size: usize, depth: Option<ShardDepth>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    heap: BinaryHeap::new(),
                    in_flight: 0,
                    next_sequence: 0,
                }),
                counters: Counters::default(),
                max_concurrent: max_concurrent.max(1),
                max_queue_size,
                depth,
            }),
        }
    }

    /// Create a queue sized by the `[queue]` section.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.max_concurrent, config.max_queue_size)
    }

    /// Queue that reports its depth into a balancer's gauge.
    pub(crate) fn with_depth(config: &QueueConfig, depth: ShardDepth) -> Self {
        Self::build(config.max_concurrent, config.max_queue_size, Some(depth))
    }

    /// Enqueue a job. Never blocks.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::QueueSaturated`] when the queue is full.
    pub fn enqueue(
        &self,
        op_kind: OperationKind,
        params: serde_json::Value,
        job: Job<T>,
        options: EnqueueOptions,
    ) -> Result<Ticket<T>, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        let settle = Arc::new(Settle::new(tx));
        let id = Uuid::new_v4();

        {
            let mut state = self.inner.state.lock();
            if state.heap.len() >= self.inner.max_queue_size {
                self.inner
                    .counters
                    .rejected
                    .fetch_add(1, AtomicOrdering::Relaxed);
                warn!(op = %op_kind, queued = state.heap.len(), "queue full, rejecting");
                return Err(OrchestratorError::QueueSaturated);
            }
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.heap.push(QueueItem {
                id,
                op_kind,
                params,
                priority: options.priority,
                sequence,
                enqueued_at: Instant::now(),
                retries: 0,
                max_retries: options.max_retries,
                job,
                settle: Arc::clone(&settle),
            });
            debug!(
                %id,
                op = %op_kind,
                priority = options.priority.0,
                sequence,
                queued = state.heap.len(),
                "request enqueued"
            );
        }

        let timer = Self::spawn_timeout(Arc::downgrade(&self.inner), id, &settle, options.timeout);
        *settle.timer.lock() = Some(timer);
        // Completion may have raced ahead of timer registration.
        if settle.is_settled() {
            if let Some(timer) = settle.timer.lock().take() {
                timer.abort();
            }
        }

        Inner::dispatch(&self.inner);
        Ok(Ticket { id, rx })
    }

    fn spawn_timeout(
        inner: Weak<Inner<T>>,
        id: Uuid,
        settle: &Arc<Settle<T>>,
        timeout: Duration,
    ) -> AbortHandle {
        let settle = Arc::clone(settle);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if settle.settle(Err(OrchestratorError::Timeout(timeout))) {
                warn!(%id, timeout_ms = timeout.as_millis() as u64, "request timed out");
                if let Some(inner) = inner.upgrade() {
                    inner
                        .counters
                        .timed_out
                        .fetch_add(1, AtomicOrdering::Relaxed);
                    inner.state.lock().heap.retain(|item| item.id != id);
                    inner.publish_depth();
                }
            }
        })
        .abort_handle()
    }

    /// Whether another item can be accepted right now.
    pub fn has_capacity(&self) -> bool {
        self.inner.state.lock().heap.len() < self.inner.max_queue_size
    }

    /// Snapshot of depth and counters.
    pub fn status(&self) -> QueueStatus {
        let (queued, in_flight) = {
            let state = self.inner.state.lock();
            (state.heap.len(), state.in_flight)
        };
        let c = &self.inner.counters;
        let dispatched = c.dispatched.load(AtomicOrdering::Relaxed);
        QueueStatus {
            queued,
            in_flight,
            avg_wait_ms: if dispatched == 0 {
                0.0
            } else {
                c.wait_micros.load(AtomicOrdering::Relaxed) as f64 / dispatched as f64 / 1000.0
            },
            processed: c.processed.load(AtomicOrdering::Relaxed),
            failed: c.failed.load(AtomicOrdering::Relaxed),
            timed_out: c.timed_out.load(AtomicOrdering::Relaxed),
            rejected: c.rejected.load(AtomicOrdering::Relaxed),
            retried: c.retried.load(AtomicOrdering::Relaxed),
        }
    }

    /// Fail every queued item with [`OrchestratorError::ChannelClosed`] and
    /// zero the counters. Running items finish normally.
    pub fn reset(&self) {
        let drained: Vec<QueueItem<T>> = self.inner.state.lock().heap.drain().collect();
        self.inner.publish_depth();
        for item in drained {
            item.settle.settle(Err(OrchestratorError::ChannelClosed));
        }
        let c = &self.inner.counters;
        for counter in [
            &c.processed,
            &c.failed,
            &c.timed_out,
            &c.rejected,
            &c.retried,
            &c.dispatched,
            &c.wait_micros,
        ] {
            counter.store(0, AtomicOrdering::Relaxed);
        }
    }
}

impl<T: Send + 'static> Inner<T> {
    /// Record the current heap length in the shared gauge, if any.
    fn publish_depth(&self) {
        let Some(depth) = &self.depth else {
            return;
        };
        let total = {
            let state = self.state.lock();
            depth.store(state.heap.len())
        };
        crate::metrics::set_queue_depth(total);
    }

    /// Start as many queued items as the concurrency cap allows.
    fn dispatch(this: &Arc<Self>) {
        Self::start_ready(this);
        this.publish_depth();
    }

    fn start_ready(this: &Arc<Self>) {
        loop {
            let item = {
                let mut state = this.state.lock();
                if state.in_flight >= this.max_concurrent {
                    return;
                }
                let Some(item) = state.heap.pop() else {
                    return;
                };
                if item.settle.is_settled() {
                    continue;
                }
                state.in_flight += 1;
                item
            };

            if item.retries == 0 {
                let waited = item.enqueued_at.elapsed();
                this.counters
                    .wait_micros
                    .fetch_add(waited.as_micros() as u64, AtomicOrdering::Relaxed);
                this.counters
                    .dispatched
                    .fetch_add(1, AtomicOrdering::Relaxed);
            }

            let inner = Arc::clone(this);
            tokio::spawn(async move { Inner::run(inner, item).await });
        }
    }

    async fn run(this: Arc<Self>, item: QueueItem<T>) {
        debug!(id = %item.id, op = %item.op_kind, attempt = item.retries + 1, "request started");

        let handle = tokio::spawn((item.job)());
        item.settle.attach_job(handle.abort_handle());
        let result = match handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => {
                debug!(id = %item.id, "attempt cancelled after settlement");
                Err(OrchestratorError::Other("job cancelled".to_string()))
            }
            Err(e) => Err(OrchestratorError::Other(format!("job aborted: {e}"))),
        };

        match result {
            Ok(value) => {
                if item.settle.settle(Ok(value)) {
                    this.counters
                        .processed
                        .fetch_add(1, AtomicOrdering::Relaxed);
                }
                this.state.lock().in_flight -= 1;
            }
            Err(e)
                if e.is_retryable()
                    && item.retries < item.max_retries
                    && !item.settle.is_settled() =>
            {
                let priority = item.priority.decremented();
                warn!(
                    id = %item.id,
                    op = %item.op_kind,
                    code = e.code(),
                    retries = item.retries + 1,
                    priority = priority.0,
                    params = %item.params,
                    "request failed, re-enqueueing"
                );
                this.counters.retried.fetch_add(1, AtomicOrdering::Relaxed);
                let mut state = this.state.lock();
                state.in_flight -= 1;
                state.heap.push(QueueItem {
                    priority,
                    retries: item.retries + 1,
                    ..item
                });
            }
            Err(e) => {
                if item.settle.settle(Err(e)) {
                    this.counters.failed.fetch_add(1, AtomicOrdering::Relaxed);
                }
                this.state.lock().in_flight -= 1;
            }
        }

        Inner::dispatch(&this);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn job<T: Clone + Send + Sync + 'static>(value: T, delay: Duration) -> Job<T> {
        Arc::new(move || {
            let v = value.clone();
            async move {
                tokio::time::sleep(delay).await;
                Ok(v)
            }
            .boxed()
        })
    }

    fn push<T: Send + 'static>(queue: &RequestQueue<T>, j: Job<T>, o: EnqueueOptions) -> Ticket<T> {
        queue
            .enqueue(OperationKind::Analyze, serde_json::Value::Null, j, o)
            .unwrap()
    }

    fn opts(priority: u8) -> EnqueueOptions {
        EnqueueOptions {
            priority: Priority(priority),
            max_retries: 0,
            timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order_with_single_worker() {
        let queue = RequestQueue::new(1, 10);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the only slot so the rest queue up.
        let blocker = push(&queue, job(0u8, Duration::from_millis(50)), opts(9));

        let mut tickets = Vec::new();
        for p in [1u8, 5, 3] {
            let order = Arc::clone(&order);
            let j: Job<u8> = Arc::new(move || {
                let order = Arc::clone(&order);
                async move {
                    order.lock().push(p);
                    Ok(p)
                }
                .boxed()
            });
            tickets.push(push(&queue, j, opts(p)));
        }

        blocker.wait().await.unwrap();
        for t in tickets {
            t.wait().await.unwrap();
        }
        assert_eq!(*order.lock(), vec![5, 3, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_priority_is_fifo() {
        let queue = RequestQueue::new(1, 10);
        let order = Arc::new(Mutex::new(Vec::new()));
        let blocker = push(&queue, job(0u8, Duration::from_millis(10)), opts(5));

        let mut tickets = Vec::new();
        for n in 1u8..=4 {
            let order = Arc::clone(&order);
            let j: Job<u8> = Arc::new(move || {
                let order = Arc::clone(&order);
                async move {
                    order.lock().push(n);
                    Ok(n)
                }
                .boxed()
            });
            tickets.push(push(&queue, j, opts(5)));
        }
        blocker.wait().await.unwrap();
        for t in tickets {
            t.wait().await.unwrap();
        }
        assert_eq!(*order.lock(), vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bound_plus_one_is_rejected() {
        let queue = RequestQueue::new(1, 2);
        // First item is dispatched immediately, freeing its queue slot.
        let _running = push(&queue, job(1u8, Duration::from_secs(5)), opts(5));
        let _a = push(&queue, job(1u8, Duration::from_secs(5)), opts(5));
        let _b = push(&queue, job(1u8, Duration::from_secs(5)), opts(5));

        let err = queue
            .enqueue(
                OperationKind::Analyze,
                serde_json::Value::Null,
                job(1u8, Duration::from_secs(5)),
                opts(5),
            )
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::QueueSaturated));

        let status = queue.status();
        assert_eq!(status.queued, 2);
        assert_eq!(status.in_flight, 1);
        assert_eq!(status.rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_settles_once_and_cancels_running_job() {
        let queue = RequestQueue::new(1, 10);
        let finished = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&finished);
        let slow: Job<u8> = Arc::new(move || {
            let f = Arc::clone(&f);
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                f.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(1)
            }
            .boxed()
        });
        let options = EnqueueOptions {
            timeout: Duration::from_secs(1),
            ..opts(5)
        };
        let ticket = push(&queue, slow, options);

        let err = ticket.wait().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout(_)));

        // The slot is released without waiting for the job's own deadline.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(queue.status().in_flight, 0);

        tokio::time::sleep(Duration::from_secs(15)).await;
        let status = queue.status();
        assert_eq!(finished.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(status.timed_out, 1);
        assert_eq!(status.processed, 0);
        assert_eq!(status.failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_frees_slot_for_next_item() {
        let queue = RequestQueue::new(1, 10);
        let stuck = push(
            &queue,
            job(1u8, Duration::from_secs(600)),
            EnqueueOptions {
                timeout: Duration::from_secs(1),
                ..opts(5)
            },
        );
        let next = push(&queue, job(2u8, Duration::from_millis(10)), opts(5));

        assert!(matches!(stuck.wait().await, Err(OrchestratorError::Timeout(_))));
        assert_eq!(next.wait().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_queued_item_leaves_queue() {
        let queue = RequestQueue::new(1, 10);
        let _blocker = push(&queue, job(1u8, Duration::from_secs(30)), opts(5));
        let waiting = queue
            .enqueue(
                OperationKind::Analyze,
                serde_json::Value::Null,
                job(2u8, Duration::ZERO),
                EnqueueOptions {
                    timeout: Duration::from_secs(1),
                    ..opts(5)
                },
            )
            .unwrap();

        assert!(matches!(waiting.wait().await, Err(OrchestratorError::Timeout(_))));
        assert_eq!(queue.status().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_before_timeout_wins() {
        let queue = RequestQueue::new(2, 10);
        let ticket = push(&queue, job(7u8, Duration::from_millis(10)), opts(5));
        assert_eq!(ticket.wait().await.unwrap(), 7);

        tokio::time::sleep(Duration::from_secs(120)).await;
        let status = queue.status();
        assert_eq!(status.processed, 1);
        assert_eq!(status.timed_out, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_respected() {
        let queue = RequestQueue::new(2, 20);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tickets = Vec::new();
        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let j: Job<()> = Arc::new(move || {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    peak.fetch_max(now, AtomicOrdering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, AtomicOrdering::SeqCst);
                    Ok(())
                }
                .boxed()
            });
            tickets.push(push(&queue, j, opts(5)));
        }
        for t in tickets {
            t.wait().await.unwrap();
        }
        assert_eq!(peak.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(queue.status().processed, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_is_re_enqueued() {
        let queue = RequestQueue::new(1, 10);
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&attempts);
        let j: Job<u8> = Arc::new(move || {
            let n = a.fetch_add(1, AtomicOrdering::SeqCst);
            async move {
                if n == 0 {
                    Err(OrchestratorError::Timeout(Duration::from_secs(1)))
                } else {
                    Ok(9)
                }
            }
            .boxed()
        });

        let ticket = queue
            .enqueue(
                OperationKind::Analyze,
                serde_json::json!({"k": "v"}),
                j,
                EnqueueOptions {
                    max_retries: 1,
                    ..opts(5)
                },
            )
            .unwrap();
        assert_eq!(ticket.wait().await.unwrap(), 9);
        assert_eq!(attempts.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(queue.status().retried, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_rejects_immediately() {
        let queue = RequestQueue::new(1, 10);
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&attempts);
        let j: Job<u8> = Arc::new(move || {
            a.fetch_add(1, AtomicOrdering::SeqCst);
            async { Err(OrchestratorError::Validation(vec!["bad".into()])) }.boxed()
        });
        let ticket = queue
            .enqueue(
                OperationKind::Analyze,
                serde_json::Value::Null,
                j,
                EnqueueOptions {
                    max_retries: 3,
                    ..opts(5)
                },
            )
            .unwrap();
        assert!(matches!(ticket.wait().await, Err(OrchestratorError::Validation(_))));
        assert_eq!(attempts.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(queue.status().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_returns_last_error() {
        let queue = RequestQueue::new(1, 10);
        let j: Job<u8> = Arc::new(|| async { Err(OrchestratorError::QueueSaturated) }.boxed());
        let ticket = queue
            .enqueue(
                OperationKind::Analyze,
                serde_json::Value::Null,
                j,
                EnqueueOptions {
                    max_retries: 2,
                    ..opts(5)
                },
            )
            .unwrap();
        assert!(matches!(ticket.wait().await, Err(OrchestratorError::QueueSaturated)));
        let status = queue.status();
        assert_eq!(status.retried, 2);
        assert_eq!(status.failed, 1);
    }

    #[test]
    fn test_priority_decrement_floors_at_zero() {
        assert_eq!(Priority(5).decremented(), Priority(4));
        assert_eq!(Priority(0).decremented(), Priority(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_fails_queued_items() {
        let queue = RequestQueue::new(1, 10);
        let _blocker = push(&queue, job(1u8, Duration::from_secs(5)), opts(5));
        let queued = push(&queue, job(2u8, Duration::ZERO), opts(5));
        queue.reset();
        assert!(matches!(queued.wait().await, Err(OrchestratorError::ChannelClosed)));
        assert_eq!(queue.status().queued, 0);
    }
}
