//! Write-behind queue
//!
//! Operations are executed by a fixed pool of worker threads. A transient
//! provider failure puts the same operation back on the queue after a backoff
//! delay, until the retry policy is exhausted. Each enqueue returns a
//! [`WriteBehindTicket`] that resolves once the operation reaches a final result.
//!
//! Ordering: earliest-ready first, FIFO among operations ready at the same time.

use parking_lot::{Condvar, Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tessera_core::{CacheError, Result};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::operation::{DataSourceOperationResult, WriteOperation};
use crate::provider::{ProviderError, ProviderRegistry};
use crate::retry::RetryPolicy;

/// Called once per operation with its final result
pub type CompletionHook = Arc<dyn Fn(&DataSourceOperationResult) + Send + Sync>;

/// Handle to the eventual result of a queued operation
///
/// The result is delivered once: after `wait` or `try_result` returns it,
/// later calls return `None`.
#[derive(Debug)]
pub struct WriteBehindTicket {
    id: Uuid,
    key: String,
    rx: Receiver<DataSourceOperationResult>,
}

impl WriteBehindTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Block up to `timeout` for the final result.
    pub fn wait(&self, timeout: Duration) -> Option<DataSourceOperationResult> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_result(&self) -> Option<DataSourceOperationResult> {
        self.rx.try_recv().ok()
    }
}

/// Queue metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Operations waiting, including ones delayed for retry
    pub queue_depth: usize,
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    /// Requeues after a transient failure
    pub retried: u64,
    pub worker_count: usize,
}

struct Pending {
    ready_at: Instant,
    sequence: u64,
    /// Operations from before the last discard are never requeued
    generation: u64,
    operation: WriteOperation,
    reply: SyncSender<DataSourceOperationResult>,
}

impl Eq for Pending {}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.sequence == other.sequence
    }
}

// BinaryHeap is a max-heap: earliest ready_at, then lowest sequence, ranks highest
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    queue: Mutex<BinaryHeap<Pending>>,
    work_ready: Condvar,
    drain_cond: Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
    generation: AtomicU64,
    active: AtomicUsize,
    capacity: usize,
    retry: RetryPolicy,
    providers: Arc<ProviderRegistry>,
    hook: RwLock<Option<CompletionHook>>,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

/// Asynchronous, retrying write-behind executor
pub struct WriteBehindQueue {
    inner: Arc<QueueInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl WriteBehindQueue {
    /// Start `workers` threads named `tessera-wb-0`, `tessera-wb-1`, ...
    pub fn start(
        workers: usize,
        capacity: usize,
        retry: RetryPolicy,
        providers: Arc<ProviderRegistry>,
    ) -> Result<Self> {
        let inner = Arc::new(QueueInner {
            queue: Mutex::new(BinaryHeap::new()),
            work_ready: Condvar::new(),
            drain_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            capacity,
            retry,
            providers,
            hook: RwLock::new(None),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
        });

        let worker_count = workers.max(1);
        let mut handles = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let inner = Arc::clone(&inner);
            let handle = std::thread::Builder::new()
                .name(format!("tessera-wb-{}", i))
                .spawn(move || worker_loop(&inner))
                .map_err(|e| CacheError::wrap("failed to spawn write-behind worker", e))?;
            handles.push(handle);
        }

        Ok(Self {
            inner,
            workers: Mutex::new(handles),
            worker_count,
        })
    }

    pub fn set_completion_hook(&self, hook: CompletionHook) {
        *self.inner.hook.write() = Some(hook);
    }

    pub fn clear_completion_hook(&self) {
        *self.inner.hook.write() = None;
    }

    /// Queue `operation` without blocking.
    ///
    /// Fails when the queue is stopped or at capacity.
    pub fn enqueue(&self, operation: WriteOperation) -> Result<WriteBehindTicket> {
        if self.inner.shutdown.load(AtomicOrdering::Acquire) {
            return Err(CacheError::operation_failed("write-behind queue is stopped"));
        }

        let (tx, rx) = mpsc::sync_channel(1);
        let ticket = WriteBehindTicket {
            id: operation.id,
            key: operation.key.clone(),
            rx,
        };

        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.capacity {
                return Err(CacheError::operation_failed("write-behind queue is full"));
            }
            debug!(
                target: "tessera::ds",
                key = %operation.key,
                op = ?operation.kind,
                attempts = operation.attempts,
                "Write-behind enqueued"
            );
            queue.push(Pending {
                ready_at: Instant::now(),
                sequence: self.inner.sequence.fetch_add(1, AtomicOrdering::Relaxed),
                generation: self.inner.generation.load(AtomicOrdering::Acquire),
                operation,
                reply: tx,
            });
        }

        self.inner.work_ready.notify_one();
        Ok(ticket)
    }

    /// Wait until nothing is queued or running, bounded by `timeout`.
    ///
    /// Returns whether the queue actually drained.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.queue.lock();
        while !queue.is_empty() || self.inner.active.load(AtomicOrdering::Acquire) > 0 {
            if self
                .inner
                .drain_cond
                .wait_until(&mut queue, deadline)
                .timed_out()
            {
                return queue.is_empty() && self.inner.active.load(AtomicOrdering::Acquire) == 0;
            }
        }
        true
    }

    /// Drop everything queued without running it. Workers stay up.
    ///
    /// Each dropped operation resolves as `FailureRetry`, so its ticket and the
    /// completion hook still hear about it. An operation running right now
    /// finishes, but is not requeued if it fails transiently.
    pub fn discard_pending(&self) -> usize {
        let dropped: Vec<Pending> = {
            let mut queue = self.inner.queue.lock();
            self.inner.generation.fetch_add(1, AtomicOrdering::AcqRel);
            let dropped = std::mem::take(&mut *queue).into_vec();
            if self.inner.active.load(AtomicOrdering::Acquire) == 0 {
                self.inner.drain_cond.notify_all();
            }
            dropped
        };
        let count = dropped.len();
        for pending in dropped {
            let result = DataSourceOperationResult::retry(pending.operation, "discarded on stop");
            self.inner.finish(result, pending.reply);
        }
        if count > 0 {
            warn!(target: "tessera::ds", count, "Discarded queued write-behind operations");
        }
        count
    }

    /// Stop accepting work, run what is left (delays are skipped) and join the
    /// workers.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);
        {
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }
        let current = std::thread::current().id();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.load(AtomicOrdering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queue_depth: self.inner.queue.lock().len(),
            active: self.inner.active.load(AtomicOrdering::Relaxed),
            completed: self.inner.completed.load(AtomicOrdering::Relaxed),
            failed: self.inner.failed.load(AtomicOrdering::Relaxed),
            retried: self.inner.retried.load(AtomicOrdering::Relaxed),
            worker_count: self.worker_count,
        }
    }
}

impl Drop for WriteBehindQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decrements `active` and wakes drain waiters, even if execution panics.
struct ActiveGuard<'a> {
    inner: &'a QueueInner,
}

impl<'a> Drop for ActiveGuard<'a> {
    fn drop(&mut self) {
        let queue = self.inner.queue.lock();
        let prev = self.inner.active.fetch_sub(1, AtomicOrdering::AcqRel);
        if prev == 1 && queue.is_empty() {
            self.inner.drain_cond.notify_all();
        }
    }
}

fn worker_loop(inner: &QueueInner) {
    loop {
        let pending = {
            let mut queue = inner.queue.lock();
            loop {
                let stopping = inner.shutdown.load(AtomicOrdering::Acquire);
                match queue.peek().map(|p| p.ready_at) {
                    Some(ready_at) if stopping || ready_at <= Instant::now() => {
                        if let Some(pending) = queue.pop() {
                            inner.active.fetch_add(1, AtomicOrdering::AcqRel);
                            break pending;
                        }
                    }
                    Some(ready_at) => {
                        inner.work_ready.wait_until(&mut queue, ready_at);
                    }
                    None if stopping => return,
                    None => inner.work_ready.wait(&mut queue),
                }
            }
        };

        let _guard = ActiveGuard { inner };
        inner.execute(pending);
    }
}

impl QueueInner {
    fn execute(&self, pending: Pending) {
        let Pending {
            mut operation,
            reply,
            generation,
            ..
        } = pending;
        let current = generation == self.generation.load(AtomicOrdering::Acquire);
        operation.attempts += 1;

        let outcome = match self.providers.resolve(operation.provider.as_deref()) {
            Ok(provider) => {
                match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    provider.write(&operation)
                })) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        let msg = e
                            .downcast_ref::<&str>()
                            .copied()
                            .unwrap_or("(non-string panic)");
                        error!(target: "tessera::ds", key = %operation.key, "Provider panicked: {}", msg);
                        Err(ProviderError::Permanent(format!("provider panicked: {}", msg)))
                    }
                }
            }
            Err(e) => Err(ProviderError::Permanent(e.to_string())),
        };

        let result = match outcome {
            Ok(()) => DataSourceOperationResult::success(operation),
            Err(ProviderError::Transient(msg))
                if current && self.retry.allows_retry(operation.attempts) =>
            {
                let delay = self.retry.delay_for(operation.attempts - 1);
                warn!(
                    target: "tessera::ds",
                    key = %operation.key,
                    attempt = operation.attempts,
                    ?delay,
                    error = %msg,
                    "Write-behind failed, requeueing"
                );
                self.retried.fetch_add(1, AtomicOrdering::Relaxed);
                self.requeue(operation, reply, delay, generation);
                return;
            }
            Err(ProviderError::Transient(msg)) => DataSourceOperationResult::retry(operation, msg),
            Err(ProviderError::Permanent(msg)) => DataSourceOperationResult::permanent(operation, msg),
        };
        self.finish(result, reply);
    }

    fn finish(&self, result: DataSourceOperationResult, reply: SyncSender<DataSourceOperationResult>) {
        if result.is_success() {
            self.completed.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.failed.fetch_add(1, AtomicOrdering::Relaxed);
            warn!(
                target: "tessera::ds",
                key = %result.operation.key,
                status = ?result.status,
                attempts = result.operation.attempts,
                "Write-behind gave up"
            );
        }

        // Receiver may be gone; the hook still hears about it
        let _ = reply.try_send(result.clone());
        let hook = self.hook.read().clone();
        if let Some(hook) = hook {
            hook(&result);
        }
    }

    fn requeue(
        &self,
        operation: WriteOperation,
        reply: SyncSender<DataSourceOperationResult>,
        delay: Duration,
        generation: u64,
    ) {
        // Checked under the queue lock, which discard_pending also holds
        let stale = {
            let mut queue = self.queue.lock();
            if generation != self.generation.load(AtomicOrdering::Acquire) {
                Some(operation)
            } else {
                queue.push(Pending {
                    ready_at: Instant::now() + delay,
                    sequence: self.sequence.fetch_add(1, AtomicOrdering::Relaxed),
                    generation,
                    operation,
                    reply: reply.clone(),
                });
                None
            }
        };
        match stale {
            Some(operation) => {
                self.finish(DataSourceOperationResult::retry(operation, "discarded on stop"), reply)
            }
            None => {
                self.work_ready.notify_one();
            }
        }
    }
}
