//! Fixture builders for tenants and their collaborator entities.
//!
//! Tenant, version, topic, consumer and subscription management lives
//! outside the delivery engine, so tests insert those rows directly.

use std::collections::HashMap;

use anyhow::Result;
use chrono::NaiveDate;
use httpq_core::{
    storage::{webhook_events::NewEventRecord, Storage},
    ConsumerId, EventId, NewWebhookEvent, SubscriptionId, TenantId, TopicId, VersionId,
};
use sqlx::PgPool;
use uuid::Uuid;

/// Topic created by [`TenantFixture::create`].
pub const DEFAULT_TOPIC: &str = "invoice.paid";

/// A tenant with versions, one topic, one consumer and one subscription.
#[derive(Debug, Clone)]
pub struct TenantFixture {
    /// Tenant id.
    pub tenant_id: TenantId,
    /// Version ids with their names, in creation order.
    pub versions: Vec<(VersionId, String)>,
    /// Topic named [`DEFAULT_TOPIC`].
    pub topic_id: TopicId,
    /// Consumer bound to the first version.
    pub consumer_id: ConsumerId,
    /// Subscription of the consumer to the topic.
    pub subscription_id: SubscriptionId,
}

impl TenantFixture {
    /// Creates a tenant whose consumer is subscribed at `url`.
    ///
    /// The consumer receives the first entry of `versions`, which must not
    /// be empty.
    pub async fn create(pool: &PgPool, url: &str, versions: &[&str]) -> Result<Self> {
        let tenant_id = TenantId::new();
        sqlx::query("INSERT INTO tenants (id, name) VALUES ($1, $2)")
            .bind(tenant_id)
            .bind(format!("tenant-{}", Uuid::new_v4().simple()))
            .execute(pool)
            .await?;

        let mut created = Vec::with_capacity(versions.len());
        for version in versions {
            let id = VersionId::new();
            sqlx::query("INSERT INTO versions (id, tenant_id, version) VALUES ($1, $2, $3)")
                .bind(id)
                .bind(tenant_id)
                .bind(*version)
                .execute(pool)
                .await?;
            created.push((id, (*version).to_string()));
        }
        let (consumer_version, _) =
            created.first().cloned().ok_or_else(|| anyhow::anyhow!("at least one version"))?;

        let topic_id = TopicId::new();
        sqlx::query("INSERT INTO topics (id, tenant_id, name) VALUES ($1, $2, $3)")
            .bind(topic_id)
            .bind(tenant_id)
            .bind(DEFAULT_TOPIC)
            .execute(pool)
            .await?;

        let consumer_id = ConsumerId::new();
        sqlx::query(
            "INSERT INTO consumers (id, tenant_id, external_id, version_id) VALUES ($1, $2, $3, $4)",
        )
        .bind(consumer_id)
        .bind(tenant_id)
        .bind("customer-42")
        .bind(consumer_version)
        .execute(pool)
        .await?;

        let subscription_id = SubscriptionId::new();
        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, tenant_id, consumer_id, topic_id, url, is_active)
            VALUES ($1, $2, $3, $4, $5, TRUE)
            "#,
        )
        .bind(subscription_id)
        .bind(tenant_id)
        .bind(consumer_id)
        .bind(topic_id)
        .bind(url)
        .execute(pool)
        .await?;

        Ok(Self { tenant_id, versions: created, topic_id, consumer_id, subscription_id })
    }

    /// Admission request carrying one payload per tenant version.
    pub fn new_event(&self) -> NewWebhookEvent {
        let versioned_payload = self
            .versions
            .iter()
            .map(|(_, name)| (name.clone(), serde_json::json!({ "version": name, "amount": 42 })))
            .collect();

        NewWebhookEvent {
            tenant_id: self.tenant_id,
            consumer_id: self.consumer_id,
            topic_name: DEFAULT_TOPIC.to_string(),
            versioned_payload,
            headers: HashMap::new(),
        }
    }

    /// Inserts a pending event directly, bypassing admission checks.
    pub async fn insert_event(&self, storage: &Storage, as_of: NaiveDate) -> Result<EventId> {
        let record = NewEventRecord {
            tenant_id: self.tenant_id,
            consumer_id: self.consumer_id,
            topic_id: self.topic_id,
            version_id: self.versions[0].0,
            subscription_id: self.subscription_id,
            headers: HashMap::from([("x-request-id".to_string(), "fixture".to_string())]),
            payload: serde_json::json!({ "amount": 42 }),
        };

        Ok(storage.webhook_events.create(&record, as_of).await?)
    }

    /// Overwrites the subscription's active and failing flags.
    pub async fn set_subscription_state(
        &self,
        pool: &PgPool,
        is_active: bool,
        is_failing: bool,
    ) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET is_active = $2, is_failing = $3 WHERE id = $1")
            .bind(self.subscription_id)
            .bind(is_active)
            .bind(is_failing)
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Sets the try count of an event, simulating earlier attempts.
    pub async fn set_try_count(&self, pool: &PgPool, event_id: EventId, try_count: i32) -> Result<()> {
        sqlx::query("UPDATE webhook_events SET try_count = $2 WHERE id = $1")
            .bind(event_id)
            .bind(try_count)
            .execute(pool)
            .await?;

        Ok(())
    }
}
