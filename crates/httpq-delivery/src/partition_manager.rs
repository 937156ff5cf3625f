//! Scheduler that keeps the rolling window of event partitions.
//!
//! Runs once after a short random jitter, then again after randomized
//! intervals so several instances do not reconcile in lockstep. The as-of
//! date of every run is read from the clock when the run starts.

use std::{sync::Arc, time::Duration};

use httpq_core::{
    partition::desired_partitions,
    storage::{partitions, webhook_events::TABLE_NAME},
    Clock, DailyPartitionTable, StateReconciliationSet,
};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::Result;

/// Bounds of the delay before the first run.
pub const STARTUP_JITTER_MS: (u64, u64) = (1, 1_000);

/// Bounds of the delay between later runs, in minutes.
pub const RUN_INTERVAL_MINUTES: (u64, u64) = (1, 4_320);

/// Random delay before the first run.
pub fn startup_jitter() -> Duration {
    let (low, high) = STARTUP_JITTER_MS;
    Duration::from_millis(rand::rng().random_range(low..=high))
}

/// Random delay until the next run.
pub fn next_interval() -> Duration {
    let (low, high) = RUN_INTERVAL_MINUTES;
    Duration::from_secs(rand::rng().random_range(low..=high) * 60)
}

/// Periodic partition reconciler for the event log.
pub struct PartitionManager {
    partitions: Arc<partitions::Repository>,
    clock: Arc<dyn Clock>,
    past_days: u32,
    future_days: u32,
    cancellation: CancellationToken,
}

impl PartitionManager {
    /// Creates a manager keeping `past_days` and `future_days` partitions
    /// around today. Both counts are raised to the minimum window.
    pub fn new(
        partitions: Arc<partitions::Repository>,
        clock: Arc<dyn Clock>,
        past_days: u32,
        future_days: u32,
        cancellation: CancellationToken,
    ) -> Self {
        Self { partitions, clock, past_days, future_days, cancellation }
    }

    /// Reconciles once against the window around the clock's today.
    ///
    /// # Errors
    ///
    /// Returns error if listing or any DDL fails; nothing is changed then.
    pub async fn run_once(&self) -> Result<StateReconciliationSet<DailyPartitionTable>> {
        let today = self.clock.today();
        let desired = desired_partitions(TABLE_NAME, today, self.past_days, self.future_days);
        let diff = self.partitions.reconcile(TABLE_NAME, &desired).await?;

        info!(
            %today,
            added = ?diff.to_add.iter().map(DailyPartitionTable::partition_name).collect::<Vec<_>>(),
            removed = ?diff.to_remove.iter().map(DailyPartitionTable::partition_name).collect::<Vec<_>>(),
            "partition reconciliation finished"
        );

        Ok(diff)
    }

    /// Runs until cancelled.
    pub async fn run(self) {
        let mut delay = startup_jitter();
        info!(first_run_ms = delay.as_millis(), "partition manager starting");

        loop {
            tokio::select! {
                biased;
                () = self.cancellation.cancelled() => break,
                () = self.clock.sleep(delay) => {},
            }

            if let Err(error) = self.run_once().await {
                error!(error = %error, "partition reconciliation failed");
            }

            delay = next_interval();
            info!(next_run_minutes = delay.as_secs() / 60, "next partition reconciliation scheduled");
        }

        info!("partition manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_jitter_stays_in_bounds() {
        for _ in 0..200 {
            let jitter = startup_jitter();
            assert!(jitter >= Duration::from_millis(1));
            assert!(jitter <= Duration::from_secs(1));
        }
    }

    #[test]
    fn interval_stays_in_bounds() {
        for _ in 0..200 {
            let interval = next_interval();
            assert!(interval >= Duration::from_secs(60));
            assert!(interval <= Duration::from_secs(4_320 * 60));
            assert_eq!(interval.as_secs() % 60, 0);
        }
    }
}
