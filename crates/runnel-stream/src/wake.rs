use std::sync::Arc;
use std::time::Instant;

use runnel_oplog::{CancelReason, CancelToken, Notifier, WaitOutcome};
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{Disposition, StreamError, classify};

#[derive(Debug, Clone, PartialEq)]
pub enum Wake<T> {
    Ready(T),
    TimedOut,
}

/// Blocks a caller until a poll produces something, the deadline passes or
/// the wait is cancelled.
///
/// Between polls it sleeps on the cluster's new-data signal, so a write only
/// causes a re-poll, never an early return. Retryable poll failures are
/// retried here with backoff.
#[derive(Clone)]
pub struct WakeScheduler {
    notifier: Arc<Notifier>,
    retry: RetryConfig,
}

impl WakeScheduler {
    pub fn new(notifier: Arc<Notifier>, retry: RetryConfig) -> Self {
        Self { notifier, retry }
    }

    pub fn wait<T>(
        &self,
        deadline: Instant,
        cancel: &CancelToken,
        mut poll: impl FnMut() -> Result<Option<T>, StreamError>,
    ) -> Result<Wake<T>, StreamError> {
        let mut attempt = 0u32;
        loop {
            if let Some(reason) = cancel.reason() {
                return Err(interrupted(reason));
            }
            // Taken before polling so a write during the poll is not missed.
            let seen = self.notifier.epoch();
            match poll() {
                Ok(Some(value)) => return Ok(Wake::Ready(value)),
                Ok(None) => {
                    attempt = 0;
                    match self.notifier.wait_past(seen, deadline, cancel) {
                        WaitOutcome::Notified => continue,
                        WaitOutcome::TimedOut => return Ok(Wake::TimedOut),
                        WaitOutcome::Cancelled(reason) => return Err(interrupted(reason)),
                    }
                }
                Err(err) if classify(&err) == Disposition::Retry => {
                    attempt += 1;
                    let delay = self.retry.backoff(attempt);
                    warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "retrying shard read");
                    let until = deadline.min(Instant::now() + delay);
                    self.sleep_until(until, cancel)?;
                    if Instant::now() >= deadline {
                        return Ok(Wake::TimedOut);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Sleep that ignores new-data signals but not cancellation.
    fn sleep_until(&self, until: Instant, cancel: &CancelToken) -> Result<(), StreamError> {
        loop {
            match self.notifier.wait_past(self.notifier.epoch(), until, cancel) {
                WaitOutcome::TimedOut => return Ok(()),
                WaitOutcome::Notified => {}
                WaitOutcome::Cancelled(reason) => return Err(interrupted(reason)),
            }
        }
    }
}

pub(crate) fn interrupted(reason: CancelReason) -> StreamError {
    match reason {
        CancelReason::Interrupted => StreamError::Interrupted("operation was interrupted".into()),
        CancelReason::Killed => StreamError::Interrupted("cursor was killed".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runnel_oplog::OplogError;
    use std::thread;
    use std::time::Duration;

    fn scheduler() -> (Arc<Notifier>, WakeScheduler) {
        let notifier = Arc::new(Notifier::new());
        let retry = RetryConfig {
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
            backoff_jitter: 0.0,
        };
        (Arc::clone(&notifier), WakeScheduler::new(notifier, retry))
    }

    #[test]
    fn unrelated_writes_do_not_end_the_wait() {
        let (notifier, scheduler) = scheduler();
        let writer = {
            let notifier = Arc::clone(&notifier);
            thread::spawn(move || {
                for _ in 0..5 {
                    thread::sleep(Duration::from_millis(10));
                    notifier.notify_all();
                }
            })
        };
        let mut polls = 0;
        let start = Instant::now();
        let result = scheduler
            .wait::<()>(start + Duration::from_millis(100), &CancelToken::new(), || {
                polls += 1;
                Ok(None)
            })
            .unwrap();
        writer.join().unwrap();
        assert_eq!(result, Wake::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(polls > 1);
    }

    #[test]
    fn ready_value_returns_immediately() {
        let (_, scheduler) = scheduler();
        let result = scheduler
            .wait(Instant::now() + Duration::from_secs(10), &CancelToken::new(), || Ok(Some(7)))
            .unwrap();
        assert_eq!(result, Wake::Ready(7));
    }

    #[test]
    fn retryable_errors_are_retried() {
        let (_, scheduler) = scheduler();
        let mut failures = 3;
        let result = scheduler
            .wait(Instant::now() + Duration::from_secs(5), &CancelToken::new(), || {
                if failures > 0 {
                    failures -= 1;
                    Err(StreamError::Oplog(OplogError::Unavailable("shard0".into())))
                } else {
                    Ok(Some("ok"))
                }
            })
            .unwrap();
        assert_eq!(result, Wake::Ready("ok"));
    }

    #[test]
    fn fatal_errors_surface() {
        let (_, scheduler) = scheduler();
        let err = scheduler
            .wait::<()>(Instant::now() + Duration::from_secs(5), &CancelToken::new(), || {
                Err(StreamError::InvalidResumeToken("gone".into()))
            })
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidResumeToken(_)));
    }

    #[test]
    fn kill_interrupts_a_long_wait() {
        let (_, scheduler) = scheduler();
        let cancel = CancelToken::new();
        let killer = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                cancel.kill();
            })
        };
        let start = Instant::now();
        let err = scheduler
            .wait::<()>(start + Duration::from_secs(30), &cancel, || Ok(None))
            .unwrap_err();
        killer.join().unwrap();
        assert!(matches!(err, StreamError::Interrupted(_)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
