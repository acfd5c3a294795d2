//! Expiration background task
//!
//! Periodically asks its target to remove everything whose expiration has
//! elapsed. The target does the removal through the normal path, so cascades
//! and events happen the same way they do for explicit removes.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tessera_core::{CacheError, Result, Timestamp};
use tracing::{debug, error};

/// Something the cleaner can sweep
pub trait ExpirySweep: Send + Sync {
    /// Remove entries expired at `now`; returns how many were removed.
    fn sweep(&self, now: Timestamp) -> usize;
}

/// Background expiration sweeper
///
/// Holds only a weak reference to its target; the thread exits on its own
/// once the target is dropped.
pub struct ExpirationCleaner {
    check_interval: Duration,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExpirationCleaner {
    pub fn start(target: Weak<dyn ExpirySweep>, check_interval: Duration) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("tessera-expiry".to_string())
            .spawn(move || sweep_loop(target, check_interval, &flag))
            .map_err(|e| CacheError::wrap("failed to spawn expiration thread", e))?;

        Ok(Self {
            check_interval,
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Signal the thread and wait for it to exit.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ExpirationCleaner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sweep_loop(target: Weak<dyn ExpirySweep>, check_interval: Duration, shutdown: &AtomicBool) {
    let slice = Duration::from_millis(50).min(check_interval);
    while !shutdown.load(Ordering::Relaxed) {
        let mut elapsed = Duration::ZERO;
        while elapsed < check_interval {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(slice);
            elapsed += slice;
        }

        let Some(target) = target.upgrade() else {
            return;
        };
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| target.sweep(Timestamp::now()))) {
            Ok(0) => {}
            Ok(removed) => debug!(target: "tessera::expiry", removed, "Expired entries removed"),
            Err(_) => error!(target: "tessera::expiry", "Expiration sweep panicked"),
        }
    }
}
