//! Graceful shutdown latch
//!
//! While a shutdown is in progress, writers that are not explicitly allowed
//! wait on the latch until it resolves or their block interval runs out. The
//! interval is what is left of the shutdown timeout.
//!
//! The graceful stop itself runs on a background thread:
//! block activity, settle, drain, unblock, finish. A drain that overruns the
//! timeout does not stop the sequence; the latch always resolves.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tessera_core::{CacheError, OperationContext, Result};
use tracing::{debug, info, warn};

/// Latch state bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShutdownStatus(u8);

impl ShutdownStatus {
    pub const NONE: ShutdownStatus = ShutdownStatus(0);
    pub const IN_PROGRESS: ShutdownStatus = ShutdownStatus(1 << 0);
    pub const COMPLETED: ShutdownStatus = ShutdownStatus(1 << 1);

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn contains(&self, other: ShutdownStatus) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn is_in_progress(&self) -> bool {
        self.contains(Self::IN_PROGRESS)
    }

    pub fn is_completed(&self) -> bool {
        self.contains(Self::COMPLETED)
    }
}

/// Steps of a graceful stop, supplied by the owner of the latch
pub trait ShutdownHooks: Send + Sync {
    /// Tell the cluster and clients to hold new activity for up to `interval`
    fn block_activity(&self, _interval: Duration) {}

    /// Flush pending background work within `budget`; false if it ran out
    fn drain(&self, budget: Duration) -> bool;

    fn unblock_activity(&self) {}

    /// Release resources once the drain is over
    fn finish(&self);
}

#[derive(Debug)]
struct Latch {
    status: ShutdownStatus,
    started: Option<Instant>,
    timeout: Duration,
}

struct Shared {
    latch: Mutex<Latch>,
    changed: Condvar,
    in_flight: AtomicUsize,
    cancelled: AtomicBool,
}

impl Shared {
    fn set(&self, status: ShutdownStatus) {
        let mut latch = self.latch.lock();
        latch.status = status;
        if status.is_none() {
            latch.started = None;
        }
        self.changed.notify_all();
    }

    fn wait_for_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if start.elapsed() > timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Sleep for `d` in short slices; false if cancelled meanwhile
    fn settle(&self, d: Duration) -> bool {
        let deadline = Instant::now() + d;
        while Instant::now() < deadline {
            if self.cancelled.load(Ordering::Acquire) {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5).min(deadline.saturating_duration_since(Instant::now())));
        }
        !self.cancelled.load(Ordering::Acquire)
    }
}

/// Held by an admitted writer until its mutation has committed
#[must_use]
pub struct InFlightGuard<'a> {
    shared: &'a Shared,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ShutdownCoordinator {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                latch: Mutex::new(Latch {
                    status: ShutdownStatus::NONE,
                    started: None,
                    timeout: Duration::ZERO,
                }),
                changed: Condvar::new(),
                in_flight: AtomicUsize::new(0),
                cancelled: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ShutdownStatus {
        self.shared.latch.lock().status
    }

    /// Writers currently between admission and commit
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Move `None -> InProgress`. False if the latch was not idle.
    pub fn block(&self, timeout: Duration) -> bool {
        let mut latch = self.shared.latch.lock();
        if !latch.status.is_none() {
            return false;
        }
        latch.status = ShutdownStatus::IN_PROGRESS;
        latch.started = Some(Instant::now());
        latch.timeout = timeout;
        info!(target: "tessera::shutdown", ?timeout, "Blocking activity");
        true
    }

    /// Move `InProgress -> None`, releasing waiting writers. False if nothing
    /// was blocked.
    pub fn unblock(&self) -> bool {
        let mut latch = self.shared.latch.lock();
        if !latch.status.is_in_progress() {
            return false;
        }
        latch.status = ShutdownStatus::NONE;
        latch.started = None;
        self.shared.changed.notify_all();
        info!(target: "tessera::shutdown", "Activity unblocked");
        true
    }

    /// Resolve the latch as `Completed` without a graceful drain.
    pub fn complete(&self) {
        self.shared.set(ShutdownStatus::COMPLETED);
    }

    /// Back to `None` for the next start.
    pub fn reset(&self) {
        self.join_worker();
        self.shared.cancelled.store(false, Ordering::Release);
        self.shared.set(ShutdownStatus::NONE);
    }

    /// What is left of the shutdown timeout
    pub fn block_interval(&self) -> Duration {
        let latch = self.shared.latch.lock();
        match latch.started {
            Some(started) => latch.timeout.saturating_sub(started.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Wait up to `timeout` for the latch to leave `InProgress`.
    pub fn wait_while_in_progress(&self, timeout: Duration) -> ShutdownStatus {
        let deadline = Instant::now() + timeout;
        let mut latch = self.shared.latch.lock();
        while latch.status.is_in_progress() {
            if self.shared.changed.wait_until(&mut latch, deadline).timed_out() {
                break;
            }
        }
        latch.status
    }

    /// Wait up to `timeout` for `Completed`.
    pub fn wait_for_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut latch = self.shared.latch.lock();
        while !latch.status.is_completed() {
            if self.shared.changed.wait_until(&mut latch, deadline).timed_out() {
                return latch.status.is_completed();
            }
        }
        true
    }

    /// Admit a writer.
    ///
    /// Outside a shutdown this only registers the writer as in flight. During
    /// one, writers that are neither internal nor `allowed` wait for the latch
    /// and fail if it is still in progress when their interval runs out.
    pub fn admit(
        &self,
        ctx: &OperationContext,
        allowed: impl Fn() -> bool,
    ) -> Result<InFlightGuard<'_>> {
        loop {
            self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
            let guard = InFlightGuard {
                shared: &self.shared,
            };
            if !self.status().is_in_progress() || ctx.no_graceful_block || allowed() {
                return Ok(guard);
            }
            drop(guard);

            let interval = self.block_interval();
            debug!(target: "tessera::shutdown", ?interval, "Writer waiting on shutdown latch");
            if self.wait_while_in_progress(interval).is_in_progress() {
                return Err(CacheError::operation_failed("graceful shutdown in progress"));
            }
        }
    }

    /// Start a graceful stop on a background thread.
    ///
    /// Returns false when a shutdown is already running or done.
    pub fn begin_graceful(
        &self,
        timeout: Duration,
        settle: Duration,
        hooks: Arc<dyn ShutdownHooks>,
    ) -> Result<bool> {
        if !self.block(timeout) {
            return Ok(false);
        }
        self.shared.cancelled.store(false, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("tessera-shutdown".to_string())
            .spawn(move || run_graceful(&shared, timeout, settle, hooks.as_ref()))
            .map_err(|e| {
                self.unblock();
                CacheError::wrap("failed to spawn shutdown thread", e)
            })?;
        *self.worker.lock() = Some(handle);
        Ok(true)
    }

    /// Abort a graceful stop that has not finished yet. Idempotent.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    /// Wait for the background stop thread, if any.
    pub fn join_worker(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("status", &self.status())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

fn run_graceful(shared: &Shared, timeout: Duration, settle: Duration, hooks: &dyn ShutdownHooks) {
    let started = Instant::now();
    info!(target: "tessera::shutdown", ?timeout, "Graceful shutdown started");
    hooks.block_activity(timeout);

    if !shared.settle(settle) {
        abort(shared, hooks);
        return;
    }

    let remaining = timeout.saturating_sub(started.elapsed());
    let idle = shared.wait_for_idle(remaining);
    let drained = hooks.drain(timeout.saturating_sub(started.elapsed()));
    if !(idle && drained) {
        warn!(
            target: "tessera::shutdown",
            in_flight = shared.in_flight.load(Ordering::SeqCst),
            "Drain did not finish within the shutdown timeout, proceeding"
        );
    }

    if shared.cancelled.load(Ordering::Acquire) {
        abort(shared, hooks);
        return;
    }

    hooks.unblock_activity();
    hooks.finish();
    shared.set(ShutdownStatus::COMPLETED);
    info!(target: "tessera::shutdown", elapsed = ?started.elapsed(), "Graceful shutdown completed");
}

/// Back to `None`, unless a forced stop already resolved the latch.
fn abort(shared: &Shared, hooks: &dyn ShutdownHooks) {
    hooks.unblock_activity();
    let mut latch = shared.latch.lock();
    if latch.status.is_in_progress() {
        latch.status = ShutdownStatus::NONE;
        latch.started = None;
        shared.changed.notify_all();
    }
    info!(target: "tessera::shutdown", "Graceful shutdown cancelled");
}
