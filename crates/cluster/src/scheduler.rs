//! Delayed and periodic task execution
//!
//! A task reports how long to wait before its next run through
//! [`ScheduledTask::next_interval`]. The scheduler asks again after every run;
//! `None` retires the task. Cancelled tasks are dropped without running.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tessera_core::{CacheError, Result};
use tracing::{debug, error};

/// Work the scheduler runs after a delay
pub trait ScheduledTask: Send + Sync {
    /// Delay before the next run; `None` once the task is finished
    fn next_interval(&self) -> Option<Duration>;

    fn run(&self);

    fn is_cancelled(&self) -> bool;
}

/// Where tasks get scheduled
pub trait TaskScheduler: Send + Sync {
    fn add_task(&self, task: Arc<dyn ScheduledTask>) -> Result<()>;
}

struct Timed {
    due: Instant,
    sequence: u64,
    task: Arc<dyn ScheduledTask>,
}

impl Eq for Timed {}

impl PartialEq for Timed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

// Earliest due first, then oldest
impl Ord for Timed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then(other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Timed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct SchedulerInner {
    tasks: Mutex<BinaryHeap<Timed>>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
    runs: AtomicU64,
}

impl SchedulerInner {
    fn push(&self, task: Arc<dyn ScheduledTask>, delay: Duration) {
        let mut tasks = self.tasks.lock();
        tasks.push(Timed {
            due: Instant::now() + delay,
            sequence: self.sequence.fetch_add(1, AtomicOrdering::Relaxed),
            task,
        });
        self.wakeup.notify_one();
    }
}

/// Single-threaded timer wheel for ledger tasks
///
/// Tasks run one at a time on the `tessera-scheduler` thread, so a task never
/// overlaps with itself.
pub struct TimeScheduler {
    inner: Arc<SchedulerInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TimeScheduler {
    pub fn start() -> Result<Self> {
        let inner = Arc::new(SchedulerInner {
            tasks: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
            runs: AtomicU64::new(0),
        });

        let worker_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("tessera-scheduler".to_string())
            .spawn(move || timer_loop(&worker_inner))
            .map_err(|e| CacheError::wrap("failed to spawn scheduler thread", e))?;

        Ok(Self {
            inner,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Tasks waiting for their next run
    pub fn pending(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Total task runs since start
    pub fn runs(&self) -> u64 {
        self.inner.runs.load(AtomicOrdering::Relaxed)
    }

    /// Stop the timer thread. Tasks that have not come due are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);
        {
            let _tasks = self.inner.tasks.lock();
            self.inner.wakeup.notify_all();
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl TaskScheduler for TimeScheduler {
    fn add_task(&self, task: Arc<dyn ScheduledTask>) -> Result<()> {
        if self.inner.shutdown.load(AtomicOrdering::Acquire) {
            return Err(CacheError::NotRunning);
        }
        match task.next_interval() {
            Some(delay) => {
                self.inner.push(task, delay);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for TimeScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TimeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeScheduler")
            .field("pending", &self.pending())
            .field("runs", &self.runs())
            .finish()
    }
}

fn timer_loop(inner: &SchedulerInner) {
    loop {
        let task = {
            let mut tasks = inner.tasks.lock();
            loop {
                if inner.shutdown.load(AtomicOrdering::Acquire) {
                    return;
                }
                match tasks.peek().map(|t| t.due) {
                    Some(due) if due <= Instant::now() => {
                        if let Some(timed) = tasks.pop() {
                            break timed.task;
                        }
                    }
                    Some(due) => {
                        inner.wakeup.wait_until(&mut tasks, due);
                    }
                    None => inner.wakeup.wait(&mut tasks),
                }
            }
        };

        if task.is_cancelled() {
            debug!(target: "tessera::scheduler", "Dropping cancelled task");
            continue;
        }

        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.run())) {
            error!(
                target: "tessera::scheduler",
                "Scheduled task panicked: {:?}",
                e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
        }
        inner.runs.fetch_add(1, AtomicOrdering::Relaxed);

        if !task.is_cancelled() {
            if let Some(delay) = task.next_interval() {
                inner.push(task, delay);
            }
        }
    }
}

/// Scheduler driven by an explicit clock, for tests
///
/// Nothing runs until [`ManualScheduler::advance`] moves time past a task's
/// due point.
#[derive(Default)]
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    sequence: u64,
    tasks: Vec<(Duration, u64, Arc<dyn ScheduledTask>)>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time elapsed since creation
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Tasks not yet run to completion, cancelled ones included
    pub fn pending(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// Move the clock forward by `by`, running every task that comes due on
    /// the way in due order. Returns the number of runs.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().now + by;
        let mut runs = 0;
        loop {
            let next = {
                let mut state = self.state.lock();
                let due_index = state
                    .tasks
                    .iter()
                    .enumerate()
                    .filter(|(_, (due, _, _))| *due <= target)
                    .min_by_key(|(_, (due, seq, _))| (*due, *seq))
                    .map(|(i, _)| i);
                match due_index {
                    Some(i) => {
                        let (due, _, task) = state.tasks.remove(i);
                        state.now = state.now.max(due);
                        Some(task)
                    }
                    None => {
                        state.now = target;
                        None
                    }
                }
            };

            // Run without holding the lock; tasks may schedule more tasks
            let Some(task) = next else { break };
            if task.is_cancelled() {
                continue;
            }
            task.run();
            runs += 1;
            if !task.is_cancelled() {
                if let Some(delay) = task.next_interval() {
                    self.schedule(task, delay);
                }
            }
        }
        runs
    }

    fn schedule(&self, task: Arc<dyn ScheduledTask>, delay: Duration) {
        let mut state = self.state.lock();
        let due = state.now + delay;
        let sequence = state.sequence;
        state.sequence += 1;
        state.tasks.push((due, sequence, task));
    }
}

impl TaskScheduler for ManualScheduler {
    fn add_task(&self, task: Arc<dyn ScheduledTask>) -> Result<()> {
        if let Some(delay) = task.next_interval() {
            self.schedule(task, delay);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Runs `limit` times, `every` apart
    struct Repeating {
        every: Duration,
        limit: usize,
        count: AtomicUsize,
        cancelled: AtomicBool,
    }

    impl Repeating {
        fn new(every: Duration, limit: usize) -> Arc<Self> {
            Arc::new(Self {
                every,
                limit,
                count: AtomicUsize::new(0),
                cancelled: AtomicBool::new(false),
            })
        }

        fn count(&self) -> usize {
            self.count.load(AtomicOrdering::SeqCst)
        }
    }

    impl ScheduledTask for Repeating {
        fn next_interval(&self) -> Option<Duration> {
            (self.count() < self.limit).then_some(self.every)
        }
        fn run(&self) {
            self.count.fetch_add(1, AtomicOrdering::SeqCst);
        }
        fn is_cancelled(&self) -> bool {
            self.cancelled.load(AtomicOrdering::SeqCst)
        }
    }

    #[test]
    fn test_time_scheduler_runs_after_delay() {
        let scheduler = TimeScheduler::start().unwrap();
        let task = Repeating::new(Duration::from_millis(20), 1);
        let started = Instant::now();
        scheduler.add_task(task.clone()).unwrap();

        while task.count() == 0 && started.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(task.count(), 1);
        assert!(started.elapsed() >= Duration::from_millis(20));
        scheduler.shutdown();
    }

    #[test]
    fn test_time_scheduler_repeats_until_done() {
        let scheduler = TimeScheduler::start().unwrap();
        let task = Repeating::new(Duration::from_millis(1), 3);
        scheduler.add_task(task.clone()).unwrap();

        let started = Instant::now();
        while task.count() < 3 && started.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(2));
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(task.count(), 3);
        assert_eq!(scheduler.pending(), 0);
        scheduler.shutdown();
    }

    #[test]
    fn test_time_scheduler_skips_cancelled() {
        let scheduler = TimeScheduler::start().unwrap();
        let task = Repeating::new(Duration::from_millis(10), 1);
        scheduler.add_task(task.clone()).unwrap();
        task.cancelled.store(true, AtomicOrdering::SeqCst);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(task.count(), 0);
        assert_eq!(scheduler.pending(), 0);
        scheduler.shutdown();
    }

    #[test]
    fn test_add_after_shutdown_fails() {
        let scheduler = TimeScheduler::start().unwrap();
        scheduler.shutdown();
        let task = Repeating::new(Duration::from_millis(1), 1);
        assert!(matches!(scheduler.add_task(task), Err(CacheError::NotRunning)));
    }

    #[test]
    fn test_manual_scheduler_runs_in_due_order() {
        let scheduler = ManualScheduler::new();
        let slow = Repeating::new(Duration::from_secs(5), 1);
        let fast = Repeating::new(Duration::from_secs(1), 2);
        scheduler.add_task(slow.clone()).unwrap();
        scheduler.add_task(fast.clone()).unwrap();

        assert_eq!(scheduler.advance(Duration::from_millis(999)), 0);
        assert_eq!(scheduler.advance(Duration::from_millis(1)), 1);
        assert_eq!(fast.count(), 1);

        assert_eq!(scheduler.advance(Duration::from_secs(4)), 2);
        assert_eq!((fast.count(), slow.count()), (2, 1));
        assert_eq!(scheduler.pending(), 0);
        assert_eq!(scheduler.now(), Duration::from_secs(5));
    }
}
