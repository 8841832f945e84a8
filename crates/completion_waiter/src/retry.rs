use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

pub trait Clock: Send + Sync {
    /// Monotonic time since the clock was created.
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Clock that only moves when told to. `sleep` advances it instantly.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        let mut now = self
            .now
            .lock()
            .unwrap_or_else(|_| panic!("manual clock mutex poisoned"));
        *now += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self
            .now
            .lock()
            .unwrap_or_else(|_| panic!("manual clock mutex poisoned"))
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventWaitStatus {
    Signalled,
    TimedOut,
    Disconnected,
}

/// Native wait primitive: block until signalled or `timeout` elapses.
pub trait EventWait: Send + Sync {
    fn wait_timeout(&self, timeout: Duration) -> EventWaitStatus;
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub per_retry_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RetryConfigError {
    #[error("retry budget must allow at least one retry")]
    ZeroRetries,
    #[error("per-retry timeout must be non-zero")]
    ZeroTimeout,
}

impl RetryConfig {
    pub const fn new(max_retries: u32, per_retry_timeout_ms: u64) -> Self {
        Self {
            max_retries,
            per_retry_timeout_ms,
        }
    }

    pub fn per_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.per_retry_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), RetryConfigError> {
        if self.max_retries == 0 {
            return Err(RetryConfigError::ZeroRetries);
        }
        if self.per_retry_timeout_ms == 0 {
            return Err(RetryConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

/// How a retry waits between checks.
#[derive(Clone, Copy)]
pub enum RetryPause<'a> {
    Event(&'a dyn EventWait),
    Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryReport {
    pub attempts: u32,
    pub waited: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryError {
    Exhausted { attempts: u32, waited: Duration },
    Cancelled { attempts: u32 },
    EventDisconnected { attempts: u32 },
}

/// Check, pause, check again; at most `max_retries` pauses.
#[derive(Debug, Clone, Copy)]
pub struct BoundedRetry {
    config: RetryConfig,
}

impl BoundedRetry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> RetryConfig {
        self.config
    }

    pub fn run(
        &self,
        clock: &dyn Clock,
        pause: RetryPause<'_>,
        cancel: Option<&CancelToken>,
        mut ready: impl FnMut() -> bool,
    ) -> Result<RetryReport, RetryError> {
        let started = clock.now();
        if ready() {
            return Ok(RetryReport {
                attempts: 0,
                waited: Duration::ZERO,
            });
        }

        let timeout = self.config.per_retry_timeout();
        for attempt in 1..=self.config.max_retries {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(RetryError::Cancelled {
                    attempts: attempt - 1,
                });
            }
            match pause {
                RetryPause::Event(event) => {
                    if event.wait_timeout(timeout) == EventWaitStatus::Disconnected {
                        return Err(RetryError::EventDisconnected { attempts: attempt });
                    }
                }
                RetryPause::Backoff => clock.sleep(timeout),
            }
            if ready() {
                return Ok(RetryReport {
                    attempts: attempt,
                    waited: clock.now().saturating_sub(started),
                });
            }
        }

        Err(RetryError::Exhausted {
            attempts: self.config.max_retries,
            waited: clock.now().saturating_sub(started),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct ClockedTimeoutEvent<'a> {
        clock: &'a ManualClock,
    }

    impl EventWait for ClockedTimeoutEvent<'_> {
        fn wait_timeout(&self, timeout: Duration) -> EventWaitStatus {
            self.clock.advance(timeout);
            EventWaitStatus::TimedOut
        }
    }

    struct DisconnectedEvent;

    impl EventWait for DisconnectedEvent {
        fn wait_timeout(&self, _timeout: Duration) -> EventWaitStatus {
            EventWaitStatus::Disconnected
        }
    }

    #[test]
    fn succeeds_without_pausing_when_already_ready() {
        let clock = ManualClock::new();
        let retry = BoundedRetry::new(RetryConfig::new(3, 10));

        let report = retry
            .run(&clock, RetryPause::Backoff, None, || true)
            .expect("already satisfied");

        assert_eq!(report.attempts, 0);
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn backoff_exhausts_budget_on_manual_clock() {
        let clock = ManualClock::new();
        let retry = BoundedRetry::new(RetryConfig::new(4, 25));
        let checks = Cell::new(0);

        let error = retry
            .run(&clock, RetryPause::Backoff, None, || {
                checks.set(checks.get() + 1);
                false
            })
            .expect_err("never satisfied");

        assert_eq!(
            error,
            RetryError::Exhausted {
                attempts: 4,
                waited: Duration::from_millis(100)
            }
        );
        assert_eq!(checks.get(), 5);
    }

    #[test]
    fn event_pause_reports_attempts_until_check_passes() {
        let clock = ManualClock::new();
        let event = ClockedTimeoutEvent { clock: &clock };
        let retry = BoundedRetry::new(RetryConfig::new(10, 5));
        let checks = Cell::new(0);

        let report = retry
            .run(&clock, RetryPause::Event(&event), None, || {
                checks.set(checks.get() + 1);
                checks.get() == 3
            })
            .expect("third check passes");

        assert_eq!(report.attempts, 2);
        assert_eq!(report.waited, Duration::from_millis(10));
    }

    #[test]
    fn cancellation_stops_before_next_pause() {
        let clock = ManualClock::new();
        let cancel = CancelToken::new();
        let retry = BoundedRetry::new(RetryConfig::new(10, 5));

        let error = retry
            .run(&clock, RetryPause::Backoff, Some(&cancel), || {
                cancel.cancel();
                false
            })
            .expect_err("cancelled");

        assert_eq!(error, RetryError::Cancelled { attempts: 0 });
        assert_eq!(clock.now(), Duration::ZERO);
    }

    #[test]
    fn disconnected_event_is_reported() {
        let clock = ManualClock::new();
        let retry = BoundedRetry::new(RetryConfig::new(3, 5));

        let error = retry
            .run(&clock, RetryPause::Event(&DisconnectedEvent), None, || false)
            .expect_err("event gone");

        assert_eq!(error, RetryError::EventDisconnected { attempts: 1 });
    }

    #[test]
    fn validate_rejects_empty_budgets() {
        assert_eq!(
            RetryConfig::new(0, 5).validate(),
            Err(RetryConfigError::ZeroRetries)
        );
        assert_eq!(
            RetryConfig::new(2, 0).validate(),
            Err(RetryConfigError::ZeroTimeout)
        );
        assert!(RetryConfig::new(2, 5).validate().is_ok());
    }
}
