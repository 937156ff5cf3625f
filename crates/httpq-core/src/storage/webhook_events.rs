//! Repository for the partitioned webhook event log.
//!
//! Every statement carries `partition_date >= cutoff` so Postgres prunes to
//! the partitions inside the retention window. The cutoff is derived from an
//! explicit as-of date passed by the caller.

use std::{collections::HashMap, sync::Arc};

use chrono::{Days, NaiveDate};
use sqlx::{types::Json, Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::{
        AttemptedWebhook, ConsumerId, DeliveryResponse, EventId, PendingDelivery, SubscriptionId,
        TenantId, TopicId, VersionId, WebhookEvent, WebhookState,
    },
};

/// Name of the partitioned parent table.
pub const TABLE_NAME: &str = "webhook_events";

/// Days before the as-of date that reads and writes still reach.
pub const RETENTION_WINDOW_DAYS: u64 = 2;

/// Oldest partition date visible on `as_of`.
pub fn retention_cutoff(as_of: NaiveDate) -> NaiveDate {
    as_of.checked_sub_days(Days::new(RETENTION_WINDOW_DAYS)).unwrap_or(NaiveDate::MIN)
}

/// Resolved references and payload of an event about to be created.
#[derive(Debug, Clone)]
pub struct NewEventRecord {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Addressed consumer.
    pub consumer_id: ConsumerId,
    /// Topic the event was published on.
    pub topic_id: TopicId,
    /// Version the payload was rendered for.
    pub version_id: VersionId,
    /// Subscription the event will be delivered through.
    pub subscription_id: SubscriptionId,
    /// Headers forwarded on each attempt.
    pub headers: HashMap<String, String>,
    /// Payload sent on each attempt.
    pub payload: serde_json::Value,
}

/// Repository for webhook event database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Creates a pending event in the partition of `as_of`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` if the insert fails, including when no
    /// partition exists for `as_of`.
    pub async fn create(&self, record: &NewEventRecord, as_of: NaiveDate) -> Result<EventId> {
        self.create_impl(&*self.pool, record, as_of).await
    }

    /// Creates a pending event within a transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` if the insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &NewEventRecord,
        as_of: NaiveDate,
    ) -> Result<EventId> {
        self.create_impl(&mut **tx, record, as_of).await
    }

    async fn create_impl<'e, E>(
        &self,
        executor: E,
        record: &NewEventRecord,
        as_of: NaiveDate,
    ) -> Result<EventId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO webhook_events (
                id, state, tenant_id, consumer_id, topic_id, version_id,
                subscription_id, try_count, request_headers, request_body, partition_date
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, 0, $8, $9, $10
            )
            RETURNING id
            "#,
        )
        .bind(EventId::new())
        .bind(WebhookState::Pending)
        .bind(record.tenant_id)
        .bind(record.consumer_id)
        .bind(record.topic_id)
        .bind(record.version_id)
        .bind(record.subscription_id)
        .bind(Json(&record.headers))
        .bind(Json(&record.payload))
        .bind(as_of)
        .fetch_one(executor)
        .await
        .map_err(|e| CoreError::from(e).into_write_error())?;

        Ok(EventId(id))
    }

    /// Fetches one event of a tenant.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the event does not exist, belongs to
    /// another tenant, or lies before the retention cutoff.
    pub async fn get(
        &self,
        tenant_id: TenantId,
        id: EventId,
        as_of: NaiveDate,
    ) -> Result<WebhookEvent> {
        sqlx::query_as::<_, WebhookEvent>(
            r#"
            SELECT id, state, tenant_id, consumer_id, topic_id, version_id,
                   subscription_id, try_count, request_headers, request_body,
                   url, response_headers, response_body, response_code, duration_ms,
                   created_at, updated_at, delivered_at, partition_date
            FROM webhook_events
            WHERE id = $1
              AND tenant_id = $2
              AND partition_date >= $3
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(retention_cutoff(as_of))
        .fetch_optional(&*self.pool)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("webhook event {id}")))
    }

    /// Fetches the given events that are inside the retention window.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list(&self, ids: &[EventId], as_of: NaiveDate) -> Result<Vec<WebhookEvent>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let events = sqlx::query_as::<_, WebhookEvent>(
            r#"
            SELECT id, state, tenant_id, consumer_id, topic_id, version_id,
                   subscription_id, try_count, request_headers, request_body,
                   url, response_headers, response_body, response_code, duration_ms,
                   created_at, updated_at, delivered_at, partition_date
            FROM webhook_events
            WHERE id = ANY($1)
              AND partition_date >= $2
            ORDER BY created_at
            "#,
        )
        .bind(ids)
        .bind(retention_cutoff(as_of))
        .fetch_all(&*self.pool)
        .await?;

        Ok(events)
    }

    /// Loads what is needed to deliver the given events.
    ///
    /// Only events whose subscription is active and not failing are
    /// returned. The others are left untouched and produce no delivery.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_for_sending(
        &self,
        ids: &[EventId],
        as_of: NaiveDate,
    ) -> Result<Vec<PendingDelivery>> {
        self.list_for_sending_impl(&*self.pool, ids, as_of).await
    }

    /// Loads deliveries within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list_for_sending_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ids: &[EventId],
        as_of: NaiveDate,
    ) -> Result<Vec<PendingDelivery>> {
        self.list_for_sending_impl(&mut **tx, ids, as_of).await
    }

    async fn list_for_sending_impl<'e, E>(
        &self,
        executor: E,
        ids: &[EventId],
        as_of: NaiveDate,
    ) -> Result<Vec<PendingDelivery>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let deliveries = sqlx::query_as::<_, PendingDelivery>(
            r#"
            SELECT we.id AS event_id,
                   s.url,
                   we.request_headers,
                   we.request_body::text AS request_body
            FROM webhook_events we
            INNER JOIN subscriptions s
                ON s.id = we.subscription_id
               AND s.is_active
               AND NOT s.is_failing
            WHERE we.id = ANY($1)
              AND we.partition_date >= $2
            "#,
        )
        .bind(ids)
        .bind(retention_cutoff(as_of))
        .fetch_all(executor)
        .await?;

        Ok(deliveries)
    }

    /// Records one attempt per response and returns the updated events.
    ///
    /// Each matched event gets the response state and metadata, its
    /// `try_count` incremented by one, and `delivered_at` set when the state
    /// is `Delivered`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` if the update fails.
    pub async fn record_attempts(
        &self,
        responses: &[DeliveryResponse],
        as_of: NaiveDate,
    ) -> Result<Vec<AttemptedWebhook>> {
        self.record_attempts_impl(&*self.pool, responses, as_of).await
    }

    /// Records attempts within a transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` if the update fails.
    pub async fn record_attempts_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        responses: &[DeliveryResponse],
        as_of: NaiveDate,
    ) -> Result<Vec<AttemptedWebhook>> {
        self.record_attempts_impl(&mut **tx, responses, as_of).await
    }

    async fn record_attempts_impl<'e, E>(
        &self,
        executor: E,
        responses: &[DeliveryResponse],
        as_of: NaiveDate,
    ) -> Result<Vec<AttemptedWebhook>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        if responses.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(responses.len());
        let mut states = Vec::with_capacity(responses.len());
        let mut codes = Vec::with_capacity(responses.len());
        let mut headers = Vec::with_capacity(responses.len());
        let mut bodies = Vec::with_capacity(responses.len());
        let mut durations = Vec::with_capacity(responses.len());
        let mut urls = Vec::with_capacity(responses.len());

        for response in responses {
            ids.push(response.event_id.0);
            states.push(response.state.as_str().to_string());
            codes.push(response.status_code.map(i32::from));
            headers.push(Json(response.headers.clone()));
            bodies.push(response.body.clone());
            durations.push(i64::try_from(response.duration.as_millis()).unwrap_or(i64::MAX));
            urls.push(response.url.clone());
        }

        let attempted = sqlx::query_as::<_, AttemptedWebhook>(
            r#"
            UPDATE webhook_events AS we
            SET state = r.state,
                try_count = we.try_count + 1,
                response_code = r.response_code,
                response_headers = r.response_headers,
                response_body = r.response_body,
                duration_ms = r.duration_ms,
                url = r.url,
                updated_at = NOW(),
                delivered_at = CASE WHEN r.state = 'DELIVERED' THEN NOW() ELSE we.delivered_at END
            FROM UNNEST(
                $1::uuid[], $2::text[], $3::int4[], $4::jsonb[], $5::text[], $6::int8[], $7::text[]
            ) AS r(id, state, response_code, response_headers, response_body, duration_ms, url)
            WHERE we.id = r.id
              AND we.partition_date >= $8
            RETURNING we.id AS event_id, we.state, we.subscription_id, we.try_count, we.created_at
            "#,
        )
        .bind(&ids)
        .bind(&states)
        .bind(&codes)
        .bind(&headers)
        .bind(&bodies)
        .bind(&durations)
        .bind(&urls)
        .bind(retention_cutoff(as_of))
        .fetch_all(executor)
        .await
        .map_err(|e| CoreError::from(e).into_write_error())?;

        Ok(attempted)
    }
}
