//! One claim-and-send cycle per queue.
//!
//! A cycle opens a transaction, claims a batch, runs the send pipeline
//! against the same transaction and commits. Dropping the transaction on
//! any error rolls the claim back, so the ids become claimable again.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use httpq_core::{storage::Storage, CoreError, EventId};
use sqlx::{Postgres, Transaction};

use crate::{
    error::Result,
    pipeline::{SendPipeline, SendReport},
    storage::PgSendStore,
};

/// A queue that can be polled by a [`crate::dequeue::DequeueLoop`].
#[async_trait]
pub trait Poller: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Runs one cycle as of `now` and returns the number of claimed events.
    async fn poll(&self, now: DateTime<Utc>) -> Result<usize>;
}

async fn begin(storage: &Storage) -> Result<Transaction<'static, Postgres>> {
    Ok(storage.pool().begin().await.map_err(CoreError::from)?)
}

async fn send_claimed(
    storage: &Storage,
    pipeline: &SendPipeline,
    mut tx: Transaction<'static, Postgres>,
    ids: Vec<EventId>,
    now: DateTime<Utc>,
) -> Result<SendReport> {
    let report = {
        let mut store = PgSendStore::new(storage, &mut tx);
        pipeline.send(&mut store, &ids, now.date_naive()).await?
    };
    tx.commit().await.map_err(CoreError::from)?;
    Ok(report)
}

/// Polls the main queue of first attempts.
pub struct MainQueuePoller {
    storage: Storage,
    pipeline: Arc<SendPipeline>,
    batch_size: i64,
}

impl MainQueuePoller {
    /// Creates a poller claiming up to `batch_size` events per cycle.
    pub fn new(storage: Storage, pipeline: Arc<SendPipeline>, batch_size: i64) -> Self {
        Self { storage, pipeline, batch_size }
    }
}

#[async_trait]
impl Poller for MainQueuePoller {
    fn name(&self) -> &'static str {
        "main"
    }

    async fn poll(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut tx = begin(&self.storage).await?;
        let ids = self.storage.main_queue.dequeue_in_tx(&mut tx, self.batch_size).await?;
        if ids.is_empty() {
            tx.commit().await.map_err(CoreError::from)?;
            return Ok(0);
        }

        let report = send_claimed(&self.storage, &self.pipeline, tx, ids, now).await?;
        Ok(report.claimed)
    }
}

/// Polls the retry queue for entries due at the cycle start.
pub struct RetryQueuePoller {
    storage: Storage,
    pipeline: Arc<SendPipeline>,
    batch_size: i64,
}

impl RetryQueuePoller {
    /// Creates a poller claiming up to `batch_size` due entries per cycle.
    pub fn new(storage: Storage, pipeline: Arc<SendPipeline>, batch_size: i64) -> Self {
        Self { storage, pipeline, batch_size }
    }
}

#[async_trait]
impl Poller for RetryQueuePoller {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn poll(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut tx = begin(&self.storage).await?;
        let ids =
            self.storage.retry_queue.dequeue_older_than_in_tx(&mut tx, now, self.batch_size).await?;
        if ids.is_empty() {
            tx.commit().await.map_err(CoreError::from)?;
            return Ok(0);
        }

        let report = send_claimed(&self.storage, &self.pipeline, tx, ids, now).await?;
        Ok(report.claimed)
    }
}
