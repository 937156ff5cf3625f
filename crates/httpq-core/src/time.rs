//! Clock abstraction for the polling loops and the partition window.
//!
//! Every "now" and "today" in the delivery path is read through a `Clock`
//! at the scheduling boundary and then passed down explicitly, so the event
//! store and the partition reconciler never consult system time themselves.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant, SystemTime},
};

use chrono::{DateTime, NaiveDate, Utc};

/// Source of monotonic and wall-clock time.
///
/// Production code uses `RealClock`; tests inject a `TestClock` to control
/// the cadence of dequeue cycles and the as-of date of partition runs.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant, used to measure cycle durations.
    fn now(&self) -> Instant;

    /// Wall-clock time.
    fn now_system(&self) -> SystemTime;

    /// Waits for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Current wall-clock time in UTC.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }

    /// Current UTC calendar date, used as the as-of date for partitions.
    fn today(&self) -> NaiveDate {
        self.now_utc().date_naive()
    }
}

/// Clock backed by the operating system and tokio's timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[derive(Debug)]
struct VirtualTime {
    elapsed: Duration,
    wall: DateTime<Utc>,
}

/// Virtual clock that only moves when told to.
///
/// `sleep` returns immediately after moving the clock forward, so a loop
/// driven by a `TestClock` runs as fast as the scheduler allows while its
/// observed timings stay exact. Clones share the same time.
#[derive(Debug, Clone)]
pub struct TestClock {
    origin: Instant,
    time: Arc<Mutex<VirtualTime>>,
}

impl TestClock {
    /// Starts at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Starts at `wall`.
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            origin: Instant::now(),
            time: Arc::new(Mutex::new(VirtualTime { elapsed: Duration::ZERO, wall })),
        }
    }

    /// Starts at midnight UTC of `date`.
    pub fn at_date(date: NaiveDate) -> Self {
        Self::starting_at(date.and_time(chrono::NaiveTime::MIN).and_utc())
    }

    /// Moves monotonic and wall-clock time forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
        time.elapsed += duration;
        time.wall = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|delta| time.wall.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    /// Total time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        self.time.lock().unwrap_or_else(PoisonError::into_inner).elapsed
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::from(self.time.lock().unwrap_or_else(PoisonError::into_inner).wall)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn advance_moves_instant_and_elapsed() {
        let clock = TestClock::new();
        let start = clock.now();

        clock.advance(Duration::from_millis(2_500));

        assert_eq!(clock.now() - start, Duration::from_millis(2_500));
        assert_eq!(clock.elapsed(), Duration::from_millis(2_500));
    }

    #[test]
    fn today_rolls_over_at_midnight() {
        let clock = TestClock::at_date(date(2020, 1, 1));
        assert_eq!(clock.today(), date(2020, 1, 1));

        clock.advance(Duration::from_secs(86_399));
        assert_eq!(clock.today(), date(2020, 1, 1));

        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.today(), date(2020, 1, 2));
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::at_date(date(2021, 6, 1));
        let other = clock.clone();

        other.advance(Duration::from_secs(3));

        assert_eq!(clock.elapsed(), Duration::from_secs(3));
        assert_eq!(clock.now_utc(), date(2021, 6, 1).and_hms_opt(0, 0, 3).unwrap().and_utc());
    }

    #[tokio::test]
    async fn sleep_returns_after_advancing() {
        let clock = TestClock::new();

        clock.sleep(Duration::from_secs(5)).await;

        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }
}
