use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::time::LogicalTime;

/// New-data signal shared by the writers and waiters of a cluster.
///
/// Writers bump an epoch and wake everyone; a waiter remembers the epoch it
/// last observed before reading, so a write that lands between the read and
/// the wait is never missed.
#[derive(Debug, Default)]
pub struct Notifier {
    epoch: Mutex<u64>,
    cond: Condvar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Notified,
    TimedOut,
    Cancelled(CancelReason),
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        *self.epoch.lock().unwrap()
    }

    pub fn notify_all(&self) {
        let mut epoch = self.epoch.lock().unwrap();
        *epoch = epoch.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Block until the epoch moves past `seen`, `deadline` passes, or
    /// `cancel` fires.
    pub fn wait_past(self: &Arc<Self>, seen: u64, deadline: Instant, cancel: &CancelToken) -> WaitOutcome {
        cancel.attach(Arc::clone(self));
        let mut epoch = self.epoch.lock().unwrap();
        let outcome = loop {
            if let Some(reason) = cancel.reason() {
                break WaitOutcome::Cancelled(reason);
            }
            if *epoch != seen {
                break WaitOutcome::Notified;
            }
            let now = Instant::now();
            if now >= deadline {
                break WaitOutcome::TimedOut;
            }
            let (guard, _) = self.cond.wait_timeout(epoch, deadline - now).unwrap();
            epoch = guard;
        };
        drop(epoch);
        cancel.detach();
        outcome
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller went away; the cursor survives.
    Interrupted,
    /// The cursor itself is being destroyed.
    Killed,
}

const NOT_CANCELLED: u8 = 0;
const INTERRUPTED: u8 = 1;
const KILLED: u8 = 2;

#[derive(Debug, Default)]
struct CancelState {
    flag: AtomicU8,
    waiting_on: Mutex<Option<Arc<Notifier>>>,
}

/// Cancellation signal for blocking waits. Cloning shares the signal.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        match self.state.flag.load(Ordering::Acquire) {
            INTERRUPTED => Some(CancelReason::Interrupted),
            KILLED => Some(CancelReason::Killed),
            _ => None,
        }
    }

    pub fn interrupt(&self) {
        let _ = self.state.flag.compare_exchange(
            NOT_CANCELLED,
            INTERRUPTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.wake();
    }

    pub fn kill(&self) {
        self.state.flag.store(KILLED, Ordering::Release);
        self.wake();
    }

    /// Clear an interrupt so the next call can proceed. A kill is permanent.
    pub fn reset(&self) {
        let _ = self.state.flag.compare_exchange(
            INTERRUPTED,
            NOT_CANCELLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn attach(&self, notifier: Arc<Notifier>) {
        *self.state.waiting_on.lock().unwrap() = Some(notifier);
    }

    fn detach(&self) {
        *self.state.waiting_on.lock().unwrap() = None;
    }

    fn wake(&self) {
        let notifier = self.state.waiting_on.lock().unwrap().clone();
        if let Some(notifier) = notifier {
            // Taking the epoch lock orders this wake after the waiter's flag check.
            let _guard = notifier.epoch.lock().unwrap();
            notifier.cond.notify_all();
        }
    }
}

/// Hands out strictly increasing cluster times.
///
/// Writes run inside [`ClusterClock::advance`] while the clock is locked, so
/// once [`ClusterClock::now`] returns `t`, every write stamped `<= t` is
/// already visible.
#[derive(Debug, Default)]
pub struct ClusterClock {
    last: Mutex<LogicalTime>,
}

impl ClusterClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> LogicalTime {
        *self.last.lock().unwrap()
    }

    /// Tick the clock and run `write` with the new time while holding the lock.
    pub fn advance<R>(&self, write: impl FnOnce(LogicalTime) -> R) -> R {
        let mut last = self.last.lock().unwrap();
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let next = if wall > last.secs {
            LogicalTime::new(wall, 1)
        } else {
            last.next()
        };
        *last = next;
        write(next)
    }
}
