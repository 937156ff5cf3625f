//! Self-pacing loop that drives a [`Poller`].
//!
//! Cycles start roughly once per execution window: after a cycle the loop
//! sleeps for whatever is left of the window, at least one millisecond, so
//! slow cycles never overlap and fast ones do not spin.

use std::{sync::Arc, time::Duration};

use httpq_core::Clock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{poller::Poller, DEFAULT_EXECUTION_WINDOW_MS};

/// Shortest pause between two cycles.
pub const MIN_CYCLE_DELAY: Duration = Duration::from_millis(1);

/// Pause before the next cycle given how long the last one took.
pub fn next_delay(window: Duration, elapsed: Duration) -> Duration {
    window.saturating_sub(elapsed).max(MIN_CYCLE_DELAY)
}

/// Scheduler for one queue.
pub struct DequeueLoop {
    poller: Arc<dyn Poller>,
    clock: Arc<dyn Clock>,
    window: Duration,
    cancellation: CancellationToken,
}

impl DequeueLoop {
    /// Creates a loop with the default three second window.
    pub fn new(
        poller: Arc<dyn Poller>,
        clock: Arc<dyn Clock>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            poller,
            clock,
            window: Duration::from_millis(DEFAULT_EXECUTION_WINDOW_MS),
            cancellation,
        }
    }

    /// Overrides the execution window.
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Runs cycles until cancelled. A cycle in progress always completes.
    pub async fn run(self) {
        let queue = self.poller.name();
        info!(queue, window_ms = self.window.as_millis(), "dequeue loop starting");

        while !self.cancellation.is_cancelled() {
            let started = self.clock.now();

            match self.poller.poll(self.clock.now_utc()).await {
                Ok(dequeued) => {
                    let elapsed = self.clock.now().saturating_duration_since(started);
                    debug!(queue, dequeued, elapsed_ms = elapsed.as_millis(), "dequeue cycle finished");
                },
                Err(error) => error!(queue, error = %error, "dequeue cycle failed"),
            }

            if self.cancellation.is_cancelled() {
                break;
            }

            let elapsed = self.clock.now().saturating_duration_since(started);
            let remainder = next_delay(self.window, elapsed);
            debug!(queue, remainder_ms = remainder.as_millis(), "next dequeue cycle scheduled");

            tokio::select! {
                biased;
                () = self.cancellation.cancelled() => break,
                () = self.clock.sleep(remainder) => {},
            }
        }

        info!(queue, "dequeue loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use httpq_core::{CoreError, TestClock};

    use super::*;
    use crate::error::{DeliveryError, Result};

    struct ScriptedPoller {
        clock: TestClock,
        cost: Duration,
        stop_after: usize,
        fail: bool,
        polls: AtomicUsize,
        seen: Mutex<Vec<DateTime<Utc>>>,
        cancellation: CancellationToken,
    }

    impl ScriptedPoller {
        fn new(clock: &TestClock, cost: Duration, stop_after: usize, cancellation: &CancellationToken) -> Self {
            Self {
                clock: clock.clone(),
                cost,
                stop_after,
                fail: false,
                polls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                cancellation: cancellation.clone(),
            }
        }
    }

    #[async_trait]
    impl Poller for ScriptedPoller {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn poll(&self, now: DateTime<Utc>) -> Result<usize> {
            self.seen.lock().unwrap().push(now);
            self.clock.advance(self.cost);
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if polls >= self.stop_after {
                self.cancellation.cancel();
            }
            if self.fail {
                return Err(DeliveryError::Storage(CoreError::Database("unreachable".into())));
            }
            Ok(polls)
        }
    }

    async fn run_loop(poller: Arc<ScriptedPoller>, clock: &TestClock, cancellation: CancellationToken) {
        DequeueLoop::new(poller, Arc::new(clock.clone()), cancellation).run().await;
    }

    #[test]
    fn delay_is_remainder_of_window() {
        let window = Duration::from_secs(3);
        assert_eq!(next_delay(window, Duration::ZERO), Duration::from_secs(3));
        assert_eq!(next_delay(window, Duration::from_millis(1200)), Duration::from_millis(1800));
        assert_eq!(next_delay(window, Duration::from_secs(3)), MIN_CYCLE_DELAY);
        assert_eq!(next_delay(window, Duration::from_secs(10)), MIN_CYCLE_DELAY);
    }

    #[tokio::test]
    async fn fast_cycles_start_once_per_window() {
        let clock = TestClock::new();
        let cancellation = CancellationToken::new();
        let poller = Arc::new(ScriptedPoller::new(&clock, Duration::ZERO, 3, &cancellation));

        run_loop(poller.clone(), &clock, cancellation).await;

        assert_eq!(poller.polls.load(Ordering::SeqCst), 3);
        assert_eq!(clock.elapsed(), Duration::from_secs(6));
        let seen = poller.seen.lock().unwrap();
        assert_eq!((seen[1] - seen[0]).num_seconds(), 3);
        assert_eq!((seen[2] - seen[1]).num_seconds(), 3);
    }

    #[tokio::test]
    async fn cycle_duration_is_subtracted_from_the_window() {
        let clock = TestClock::new();
        let cancellation = CancellationToken::new();
        let poller = Arc::new(ScriptedPoller::new(&clock, Duration::from_secs(1), 3, &cancellation));

        run_loop(poller.clone(), &clock, cancellation).await;

        assert_eq!(clock.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test]
    async fn slow_cycles_follow_each_other_after_a_millisecond() {
        let clock = TestClock::new();
        let cancellation = CancellationToken::new();
        let poller = Arc::new(ScriptedPoller::new(&clock, Duration::from_secs(5), 2, &cancellation));

        run_loop(poller.clone(), &clock, cancellation).await;

        assert_eq!(clock.elapsed(), Duration::from_secs(10) + MIN_CYCLE_DELAY);
    }

    #[tokio::test]
    async fn failed_cycles_do_not_stop_the_loop() {
        let clock = TestClock::new();
        let cancellation = CancellationToken::new();
        let mut poller = ScriptedPoller::new(&clock, Duration::ZERO, 4, &cancellation);
        poller.fail = true;
        let poller = Arc::new(poller);

        run_loop(poller.clone(), &clock, cancellation).await;

        assert_eq!(poller.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancelled_loop_does_not_poll() {
        let clock = TestClock::new();
        let cancellation = CancellationToken::new();
        let poller = Arc::new(ScriptedPoller::new(&clock, Duration::ZERO, 1, &cancellation));
        cancellation.cancel();

        run_loop(poller.clone(), &clock, cancellation).await;

        assert_eq!(poller.polls.load(Ordering::SeqCst), 0);
    }
}
