//! Shared deadline scheduler for per-task timeouts.
//!
//! One timer thread serves every worker. Each scheduled deadline targets a
//! specific worker's [`InterruptFlag`]; firing is a single atomic store, so
//! dispatch never blocks on task execution. A deadline cancelled before it
//! fires never raises the flag.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::trace;

/// Cooperative interruption signal for one worker.
///
/// The timeout scheduler raises the flag when a deadline fires; the worker
/// observes it between (or, for cooperative transforms, during) attempts.
/// Workers are reused across items, so the flag must be cleared after every
/// attempt to keep a residual signal from leaking into the next task.
#[derive(Debug, Default)]
pub struct InterruptFlag {
    raised: AtomicBool,
}

impl InterruptFlag {
    /// Creates a lowered flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the flag.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    /// Returns whether the flag is currently raised.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Lowers the flag, returning whether it had been raised.
    pub fn clear(&self) -> bool {
        self.raised.swap(false, Ordering::SeqCst)
    }
}

/// Handle to one scheduled deadline.
///
/// Dropping the handle does not cancel the deadline; call
/// [`cancel`](Self::cancel) when the guarded task completes first.
#[derive(Debug, Clone)]
pub struct DeadlineHandle {
    cancelled: Arc<AtomicBool>,
}

impl DeadlineHandle {
    /// Cancels the deadline. A cancelled deadline never fires.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns whether the deadline has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct DeadlineEntry {
    deadline: Instant,
    seq: u64,
    flag: Arc<InterruptFlag>,
    cancelled: Arc<AtomicBool>,
}

// BinaryHeap is a max-heap; order entries soonest-first.
impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DeadlineEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for DeadlineEntry {}

struct SchedulerState {
    heap: BinaryHeap<DeadlineEntry>,
    shutdown: bool,
}

/// A single-threaded timer shared by all workers of a pipeline.
pub struct TimeoutScheduler {
    state: Arc<Mutex<SchedulerState>>,
    wakeup: Arc<Condvar>,
    seq: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutScheduler {
    /// Creates the scheduler and starts its timer thread.
    #[must_use]
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(SchedulerState {
            heap: BinaryHeap::new(),
            shutdown: false,
        }));
        let wakeup = Arc::new(Condvar::new());

        let timer_state = Arc::clone(&state);
        let timer_wakeup = Arc::clone(&wakeup);
        let timer = match std::thread::Builder::new()
            .name("batchflow-deadline".to_string())
            .spawn(move || Self::timer_loop(&timer_state, &timer_wakeup))
        {
            Ok(handle) => Some(handle),
            Err(error) => {
                tracing::error!(%error, "failed to spawn deadline timer thread; timeouts disabled");
                None
            }
        };

        Self {
            state,
            wakeup,
            seq: AtomicU64::new(0),
            timer: Mutex::new(timer),
        }
    }

    /// Schedules a deadline that raises `flag` after `delay` unless the
    /// returned handle is cancelled first.
    pub fn schedule(&self, delay: Duration, flag: Arc<InterruptFlag>) -> DeadlineHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let entry = DeadlineEntry {
            deadline: Instant::now() + delay,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            flag,
            cancelled: Arc::clone(&cancelled),
        };

        self.state.lock().heap.push(entry);
        self.wakeup.notify_one();

        DeadlineHandle { cancelled }
    }

    /// Stops the timer thread. Pending deadlines are discarded without
    /// firing.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.wakeup.notify_all();

        if let Some(timer) = self.timer.lock().take() {
            let _ = timer.join();
        }
    }

    fn timer_loop(state: &Mutex<SchedulerState>, wakeup: &Condvar) {
        let mut guard = state.lock();
        loop {
            if guard.shutdown {
                break;
            }

            match guard.heap.peek().map(|entry| entry.deadline) {
                None => {
                    wakeup.wait(&mut guard);
                }
                Some(deadline) if deadline <= Instant::now() => {
                    if let Some(entry) = guard.heap.pop() {
                        if !entry.cancelled.load(Ordering::SeqCst) {
                            trace!("deadline fired, raising interrupt flag");
                            entry.flag.raise();
                        }
                    }
                }
                Some(deadline) => {
                    wakeup.wait_until(&mut guard, deadline);
                }
            }
        }
    }
}

impl Default for TimeoutScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TimeoutScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutScheduler")
            .field("pending", &self.state.lock().heap.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_flag_clear_reports_raise() {
        let flag = InterruptFlag::new();
        assert!(!flag.clear());

        flag.raise();
        assert!(flag.is_raised());
        assert!(flag.clear());
        assert!(!flag.is_raised());
    }

    #[test]
    fn test_deadline_fires() {
        let scheduler = TimeoutScheduler::new();
        let flag = Arc::new(InterruptFlag::new());

        scheduler.schedule(Duration::from_millis(20), Arc::clone(&flag));
        std::thread::sleep(Duration::from_millis(150));

        assert!(flag.is_raised());
    }

    #[test]
    fn test_cancelled_deadline_never_fires() {
        let scheduler = TimeoutScheduler::new();
        let flag = Arc::new(InterruptFlag::new());

        let handle = scheduler.schedule(Duration::from_millis(30), Arc::clone(&flag));
        handle.cancel();
        assert!(handle.is_cancelled());

        std::thread::sleep(Duration::from_millis(150));
        assert!(!flag.is_raised());
    }

    #[test]
    fn test_deadlines_fire_in_order_without_blocking_each_other() {
        let scheduler = TimeoutScheduler::new();
        let first = Arc::new(InterruptFlag::new());
        let second = Arc::new(InterruptFlag::new());

        scheduler.schedule(Duration::from_millis(20), Arc::clone(&first));
        scheduler.schedule(Duration::from_millis(40), Arc::clone(&second));

        std::thread::sleep(Duration::from_millis(200));
        assert!(first.is_raised());
        assert!(second.is_raised());
    }

    #[test]
    fn test_shutdown_discards_pending_deadlines() {
        let scheduler = TimeoutScheduler::new();
        let flag = Arc::new(InterruptFlag::new());

        scheduler.schedule(Duration::from_secs(5), Arc::clone(&flag));
        scheduler.shutdown();

        assert!(!flag.is_raised());
    }
}
