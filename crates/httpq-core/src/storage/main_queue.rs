//! Queue of events awaiting their first delivery attempt.
//!
//! A claim deletes the rows it returns. Rows held by a concurrent claim are
//! skipped instead of waited on, so pollers in several processes never
//! block each other and never receive the same event.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{error::Result, models::EventId};

/// Default number of entries claimed per main queue cycle.
pub const DEFAULT_BATCH_SIZE: i64 = 200;

/// Repository for the `main_queue` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends an event to the queue.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue(&self, event_id: EventId) -> Result<EventId> {
        self.enqueue_impl(&*self.pool, event_id).await
    }

    /// Appends an event within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: EventId,
    ) -> Result<EventId> {
        self.enqueue_impl(&mut **tx, event_id).await
    }

    async fn enqueue_impl<'e, E>(&self, executor: E, event_id: EventId) -> Result<EventId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO main_queue (event_id)
            VALUES ($1)
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .fetch_one(executor)
        .await?;

        Ok(EventId(id))
    }

    /// Claims up to `limit` entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the claim statement fails. An empty queue yields an
    /// empty vector.
    pub async fn dequeue(&self, limit: i64) -> Result<Vec<EventId>> {
        self.dequeue_impl(&*self.pool, limit).await
    }

    /// Claims entries within a transaction.
    ///
    /// The rows stay locked until the transaction ends; a rollback puts them
    /// back on the queue.
    ///
    /// # Errors
    ///
    /// Returns error if the claim statement fails.
    pub async fn dequeue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        limit: i64,
    ) -> Result<Vec<EventId>> {
        self.dequeue_impl(&mut **tx, limit).await
    }

    async fn dequeue_impl<'e, E>(&self, executor: E, limit: i64) -> Result<Vec<EventId>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            WITH claimed AS (
                DELETE FROM main_queue mq
                USING (
                    SELECT id FROM main_queue
                    ORDER BY id
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                ) q
                WHERE q.id = mq.id
                RETURNING mq.id, mq.event_id
            )
            SELECT event_id FROM claimed ORDER BY id
            "#,
        )
        .bind(limit)
        .fetch_all(executor)
        .await?;

        Ok(ids.into_iter().map(EventId).collect())
    }

    /// Number of entries currently queued.
    ///
    /// # Errors
    ///
    /// Returns error if the count query fails.
    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM main_queue")
            .fetch_one(&*self.pool)
            .await?;

        Ok(count)
    }
}
