//! Time-bounded exponential backoff for remote operations.
//!
//! One [`RetryPolicy`] is shared by the whole mount; each logical operation
//! calls [`RetryPolicy::start_operation`] and then asks the returned
//! [`Operation`] whether another attempt is warranted after each failure. The
//! first retry fires immediately; subsequent delays double from `min_delay`
//! up to `max_delay`, and the whole operation is bounded by `time_limit`.
//!
//! `max_attempts` and `max_delay` live in atomics so the signal handler can
//! zero them and promptly drain in-flight retries during shutdown.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::warn;

use crate::fs::clock::Clock;
use crate::fs::error::FsError;

pub struct RetryPolicy {
    max_attempts: AtomicU32,
    min_delay: Duration,
    max_delay_ms: AtomicU64,
    time_limit: Duration,
    clock: Arc<dyn Clock>,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        min_delay: Duration,
        max_delay: Duration,
        time_limit: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            max_attempts: AtomicU32::new(max_attempts),
            min_delay,
            max_delay_ms: AtomicU64::new(max_delay.as_millis() as u64),
            time_limit,
            clock,
        }
    }

    /// Capture the start of one logical operation.
    pub fn start_operation(&self) -> Operation<'_> {
        Operation {
            policy: self,
            started: self.clock.now(),
            attempts: 0,
        }
    }

    /// Stop granting retries and cap delays at zero. Called on
    /// SIGINT/SIGTERM so the unmount is not held hostage by backoff sleeps.
    pub fn shut_down(&self) {
        self.max_attempts.store(0, Ordering::SeqCst);
        self.max_delay_ms.store(0, Ordering::SeqCst);
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts.load(Ordering::SeqCst)
    }

    fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.load(Ordering::SeqCst))
    }
}

/// Backoff state carried through one logical operation.
pub struct Operation<'p> {
    policy: &'p RetryPolicy,
    started: SystemTime,
    attempts: u32,
}

impl Operation<'_> {
    /// Decide whether to retry after `err` occurred in `context`.
    ///
    /// Sleeps the next backoff delay before answering `true`. The very first
    /// retry is immediate.
    pub async fn should_retry(&mut self, context: &str, err: &FsError) -> bool {
        let policy = self.policy;
        if self.attempts >= policy.max_attempts() {
            return false;
        }

        let delay = self.next_delay();
        let elapsed = policy
            .clock
            .now()
            .duration_since(self.started)
            .unwrap_or_default();
        if elapsed + delay > policy.time_limit {
            return false;
        }

        self.attempts += 1;
        warn!(
            operation = context,
            error = %err,
            attempts = self.attempts,
            delay_ms = delay.as_millis() as u64,
            "retrying failed operation"
        );
        if !delay.is_zero() {
            policy.clock.sleep(delay).await;
        }
        true
    }

    /// `min(max_delay, min_delay * 2^(attempts-1))`, zero for the first retry.
    fn next_delay(&self) -> Duration {
        if self.attempts == 0 {
            return Duration::ZERO;
        }
        let exp = self.attempts.saturating_sub(1).min(32);
        let delay = self
            .policy
            .min_delay
            .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
        delay.min(self.policy.max_delay())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::clock::MockClock;

    fn policy(clock: Arc<MockClock>) -> RetryPolicy {
        RetryPolicy::new(
            5,
            Duration::from_secs(1),
            Duration::from_secs(8),
            Duration::from_secs(60),
            clock,
        )
    }

    #[tokio::test]
    async fn first_retry_is_immediate() {
        let clock = Arc::new(MockClock::new());
        let policy = policy(clock.clone());
        let mut op = policy.start_operation();

        assert!(op.should_retry("test", &FsError::Io("x".into())).await);
        assert!(clock.sleeps().is_empty(), "first retry must not sleep");
    }

    #[tokio::test]
    async fn delays_double_up_to_max() {
        let clock = Arc::new(MockClock::new());
        let policy = policy(clock.clone());
        let mut op = policy.start_operation();
        let err = FsError::Io("x".into());

        for _ in 0..5 {
            assert!(op.should_retry("test", &err).await);
        }
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8), // capped at max_delay
            ]
        );
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let clock = Arc::new(MockClock::new());
        let policy = policy(clock.clone());
        let mut op = policy.start_operation();
        let err = FsError::Io("x".into());

        let mut granted = 0;
        while op.should_retry("test", &err).await {
            granted += 1;
            assert!(granted <= 5, "must never exceed max_attempts");
        }
        assert_eq!(granted, 5);
    }

    #[tokio::test]
    async fn time_limit_is_honoured() {
        let clock = Arc::new(MockClock::new());
        let policy = RetryPolicy::new(
            100,
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_secs(10),
            clock.clone(),
        );
        let mut op = policy.start_operation();
        let err = FsError::Io("x".into());

        while op.should_retry("test", &err).await {}

        // elapsed never exceeds time_limit + max_delay
        let total: Duration = clock.sleeps().iter().sum();
        assert!(total <= Duration::from_secs(10 + 60));
    }

    #[tokio::test]
    async fn shutdown_stops_retries() {
        let clock = Arc::new(MockClock::new());
        let policy = policy(clock.clone());
        let mut op = policy.start_operation();
        let err = FsError::Io("x".into());

        assert!(op.should_retry("test", &err).await);
        policy.shut_down();
        assert!(!op.should_retry("test", &err).await);
    }
}
