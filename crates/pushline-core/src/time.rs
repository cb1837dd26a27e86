//! Time abstractions for testable and configurable timing operations.
//!
//! Provides a clock abstraction so poll intervals and staleness checks can be
//! driven deterministically in tests while production code uses real time.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};

/// Clock abstraction for time operations.
///
/// Enables dependency injection of time sources for testing. Production code
/// uses `RealClock`; tests inject `TestClock` and advance it explicitly.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    ///
    /// In production this maps to tokio::time::sleep; in tests it advances
    /// virtual time immediately.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Real clock implementation using system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test clock for deterministic time control.
///
/// Holds virtual time as milliseconds since the UNIX epoch. Cloning shares
/// the underlying counter, so a test can hold one handle while the component
/// under test holds another.
#[derive(Debug, Clone)]
pub struct TestClock {
    epoch_millis: Arc<AtomicI64>,
}

impl TestClock {
    /// Creates a new test clock starting at the current system time.
    pub fn new() -> Self {
        Self {
            epoch_millis: Arc::new(AtomicI64::new(Utc::now().timestamp_millis())),
        }
    }

    /// Creates a test clock starting at a specific timestamp.
    pub fn with_start_time(start: DateTime<Utc>) -> Self {
        Self {
            epoch_millis: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    /// Advances the clock by the specified duration.
    pub fn advance(&self, duration: Duration) {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.epoch_millis.fetch_add(millis, Ordering::AcqRel);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now_utc(&self) -> DateTime<Utc> {
        let millis = self.epoch_millis.load(Ordering::Acquire);
        Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        // In tests, sleep just advances the clock
        self.advance(duration);
        // Yield to allow other tasks to run
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = TestClock::with_start_time(start);

        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now_utc(), start + chrono::Duration::seconds(10));
    }

    #[test]
    fn cloned_clock_shares_time() {
        let clock = TestClock::new();
        let handle = clock.clone();

        let before = clock.now_utc();
        handle.advance(Duration::from_secs(60));

        assert_eq!(clock.now_utc(), before + chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn test_clock_sleep_advances_time() {
        let clock = TestClock::new();
        let before = clock.now_utc();

        clock.sleep(Duration::from_secs(5)).await;

        assert_eq!(clock.now_utc(), before + chrono::Duration::seconds(5));
    }
}
