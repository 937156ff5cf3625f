//! Repository for subscriptions: resolution at admission and suspension
//! after exhausted retries.

use std::sync::Arc;

use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    models::{ConsumerId, Subscription, SubscriptionId, TenantId, TopicId},
};

/// Repository for the `subscriptions` table.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Fetches a subscription by id.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no such subscription exists.
    pub async fn get(&self, id: SubscriptionId) -> Result<Subscription> {
        sqlx::query_as::<_, Subscription>(
            r#"
            SELECT id, tenant_id, consumer_id, topic_id, url,
                   created_at, updated_at, is_active, is_failing
            FROM subscriptions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("subscription {id}")))
    }

    /// Finds the subscription binding a consumer to a topic.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the consumer is not subscribed.
    pub async fn resolve(
        &self,
        tenant_id: TenantId,
        consumer_id: ConsumerId,
        topic_id: TopicId,
    ) -> Result<Subscription> {
        self.resolve_impl(&*self.pool, tenant_id, consumer_id, topic_id).await
    }

    /// Resolves a subscription within a transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the consumer is not subscribed.
    pub async fn resolve_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: TenantId,
        consumer_id: ConsumerId,
        topic_id: TopicId,
    ) -> Result<Subscription> {
        self.resolve_impl(&mut **tx, tenant_id, consumer_id, topic_id).await
    }

    async fn resolve_impl<'e, E>(
        &self,
        executor: E,
        tenant_id: TenantId,
        consumer_id: ConsumerId,
        topic_id: TopicId,
    ) -> Result<Subscription>
    where
        E: Executor<'e, Database = Postgres>,
    {
        sqlx::query_as::<_, Subscription>(
            r#"
            SELECT id, tenant_id, consumer_id, topic_id, url,
                   created_at, updated_at, is_active, is_failing
            FROM subscriptions
            WHERE tenant_id = $1 AND consumer_id = $2 AND topic_id = $3
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(consumer_id)
        .bind(topic_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| {
            CoreError::NotFound(format!("subscription for consumer {consumer_id} on topic {topic_id}"))
        })
    }

    /// Marks subscriptions inactive and failing. Does nothing for an empty
    /// slice.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` if the update fails.
    pub async fn disable_and_fail(&self, ids: &[SubscriptionId]) -> Result<u64> {
        self.disable_and_fail_impl(&*self.pool, ids).await
    }

    /// Suspends subscriptions within a transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` if the update fails.
    pub async fn disable_and_fail_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ids: &[SubscriptionId],
    ) -> Result<u64> {
        self.disable_and_fail_impl(&mut **tx, ids).await
    }

    async fn disable_and_fail_impl<'e, E>(&self, executor: E, ids: &[SubscriptionId]) -> Result<u64>
    where
        E: Executor<'e, Database = Postgres>,
    {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET is_active = FALSE,
                is_failing = TRUE,
                updated_at = NOW()
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .execute(executor)
        .await
        .map_err(|e| CoreError::from(e).into_write_error())?;

        Ok(result.rows_affected())
    }
}
