//! Delayed queue of events awaiting a scheduled re-attempt.
//!
//! Entries become claimable once `execute_at` has passed. An event may be
//! queued again after each failed attempt; entries are never deduplicated.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    models::{EventId, RetryEntry},
};

/// Number of entries claimed per retry queue cycle.
pub const DEFAULT_BATCH_SIZE: i64 = 100;

/// Repository for the `retry_queue` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts retry entries. Does nothing for an empty slice.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue(&self, entries: &[RetryEntry]) -> Result<()> {
        self.enqueue_impl(&*self.pool, entries).await
    }

    /// Inserts retry entries within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entries: &[RetryEntry],
    ) -> Result<()> {
        self.enqueue_impl(&mut **tx, entries).await
    }

    async fn enqueue_impl<'e, E>(&self, executor: E, entries: &[RetryEntry]) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        if entries.is_empty() {
            return Ok(());
        }

        let event_ids: Vec<Uuid> = entries.iter().map(|e| e.event_id.0).collect();
        let execute_at: Vec<DateTime<Utc>> = entries.iter().map(|e| e.execute_at).collect();

        sqlx::query(
            r#"
            INSERT INTO retry_queue (event_id, execute_at)
            SELECT * FROM UNNEST($1::uuid[], $2::timestamptz[])
            "#,
        )
        .bind(&event_ids)
        .bind(&execute_at)
        .execute(executor)
        .await?;

        Ok(())
    }

    /// Claims up to `limit` entries due at or before `older_than`.
    ///
    /// # Errors
    ///
    /// Returns error if the claim statement fails. Nothing due yields an
    /// empty vector.
    pub async fn dequeue_older_than(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventId>> {
        self.dequeue_impl(&*self.pool, older_than, limit).await
    }

    /// Claims due entries within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the claim statement fails.
    pub async fn dequeue_older_than_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventId>> {
        self.dequeue_impl(&mut **tx, older_than, limit).await
    }

    async fn dequeue_impl<'e, E>(
        &self,
        executor: E,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<EventId>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            WITH claimed AS (
                DELETE FROM retry_queue rq
                USING (
                    SELECT id FROM retry_queue
                    WHERE execute_at <= $1
                    ORDER BY id
                    LIMIT $2
                    FOR UPDATE SKIP LOCKED
                ) q
                WHERE q.id = rq.id
                RETURNING rq.id, rq.event_id
            )
            SELECT event_id FROM claimed ORDER BY id
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(executor)
        .await?;

        Ok(ids.into_iter().map(EventId).collect())
    }

    /// Number of entries currently queued, due or not.
    ///
    /// # Errors
    ///
    /// Returns error if the count query fails.
    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM retry_queue")
            .fetch_one(&*self.pool)
            .await?;

        Ok(count)
    }
}
