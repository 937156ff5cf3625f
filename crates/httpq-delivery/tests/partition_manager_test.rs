//! Partition manager runs against Postgres.
//!
//! Require `DATABASE_URL` to name a reachable Postgres server.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use chrono::NaiveDate;
use httpq_core::{storage::webhook_events::TABLE_NAME, TestClock};
use httpq_delivery::partition_manager::PartitionManager;
use httpq_testing::TestDatabase;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn run_once_follows_the_clock() -> Result<()> {
    let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or_default();
    let db = TestDatabase::with_as_of(start).await?;
    let clock = TestClock::at_date(start);
    let manager = PartitionManager::new(
        db.storage().partitions.clone(),
        Arc::new(clock.clone()),
        7,
        7,
        CancellationToken::new(),
    );

    assert!(manager.run_once().await?.is_empty());

    clock.advance(Duration::from_secs(2 * 86_400));
    let diff = manager.run_once().await?;

    let added: Vec<_> = diff.to_add.iter().map(|p| p.partition_name()).collect();
    let removed: Vec<_> = diff.to_remove.iter().map(|p| p.partition_name()).collect();
    assert_eq!(added, vec!["webhook_events__2020_01_08", "webhook_events__2020_01_09"]);
    assert_eq!(removed, vec!["webhook_events__2019_12_25", "webhook_events__2019_12_26"]);
    assert_eq!(db.storage().partitions.list(TABLE_NAME).await?.len(), 14);

    db.cleanup().await
}

#[tokio::test]
async fn small_windows_are_clamped() -> Result<()> {
    let start = NaiveDate::from_ymd_opt(2021, 6, 15).unwrap_or_default();
    let db = TestDatabase::with_as_of(start).await?;
    let manager = PartitionManager::new(
        db.storage().partitions.clone(),
        Arc::new(TestClock::at_date(start)),
        0,
        1,
        CancellationToken::new(),
    );

    manager.run_once().await?;

    assert_eq!(db.storage().partitions.list(TABLE_NAME).await?.len(), 4);
    db.cleanup().await
}
