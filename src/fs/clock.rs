//! Wall-clock abstraction.
//!
//! The retry policy and the attribute cache both reason about elapsed time;
//! routing every time query and sleep through this trait lets tests drive
//! virtual time instead of waiting.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;

    async fn sleep(&self, duration: Duration);
}

/// The real clock.
pub struct WallClock;

#[async_trait]
impl Clock for WallClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Deterministic clock for tests. `sleep` elapses instantly and advances the
/// reported time by the requested duration.
pub struct MockClock {
    now: parking_lot::Mutex<SystemTime>,
    slept: parking_lot::Mutex<Vec<Duration>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            now: parking_lot::Mutex::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)),
            slept: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Advance virtual time.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock();
        *now += duration;
    }

    /// All durations passed to `sleep`, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().clone()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.slept.lock().push(duration);
        self.advance(duration);
    }
}
