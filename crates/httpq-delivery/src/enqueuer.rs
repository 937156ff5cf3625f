//! Admission of new events onto the main queue.
//!
//! An event names a topic and a consumer and carries one payload per
//! version the tenant declares. Admission resolves the subscription,
//! selects the payload matching the consumer's version, stores the event in
//! today's partition and enqueues it, all in one transaction. Delivery then
//! happens asynchronously; the caller only learns whether the event was
//! accepted.

use std::{collections::HashSet, sync::Arc};

use httpq_core::{
    storage::{webhook_events::NewEventRecord, Storage},
    Clock, CoreError, EventId, NewWebhookEvent, Result,
};
use tracing::{debug, info, instrument};

/// Validates and admits new webhook events.
pub struct Enqueuer {
    storage: Storage,
    clock: Arc<dyn Clock>,
}

impl Enqueuer {
    /// Creates an enqueuer writing through `storage`.
    pub fn new(storage: Storage, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Stores a pending event and appends it to the main queue.
    ///
    /// # Errors
    ///
    /// - `CoreError::Validation` if the payload versions differ from the
    ///   tenant's versions, or if a write fails
    /// - `CoreError::NotFound` if the topic, the consumer or the
    ///   subscription does not exist for the tenant
    #[instrument(skip(self, event), fields(tenant_id = %event.tenant_id, topic = %event.topic_name))]
    pub async fn enqueue(&self, event: &NewWebhookEvent) -> Result<EventId> {
        let as_of = self.clock.today();
        let mut tx = self.storage.pool().begin().await.map_err(write_error)?;

        let versions = self.storage.versions.as_map_in_tx(&mut tx, event.tenant_id).await?;
        let declared: HashSet<&str> = versions.values().map(String::as_str).collect();
        let provided: HashSet<&str> = event.versioned_payload.keys().map(String::as_str).collect();
        if declared != provided {
            let mut missing: Vec<&str> = declared.difference(&provided).copied().collect();
            let mut unknown: Vec<&str> = provided.difference(&declared).copied().collect();
            missing.sort_unstable();
            unknown.sort_unstable();
            return Err(CoreError::Validation(format!(
                "payload versions do not match tenant versions (missing: {missing:?}, unknown: {unknown:?})"
            )));
        }

        let topic =
            self.storage.topics.find_by_name_in_tx(&mut tx, event.tenant_id, &event.topic_name).await?;
        let consumer = self.storage.consumers.get_in_tx(&mut tx, event.consumer_id).await?;
        if consumer.tenant_id != event.tenant_id {
            return Err(CoreError::NotFound(format!("consumer {}", event.consumer_id)));
        }
        let subscription = self
            .storage
            .subscriptions
            .resolve_in_tx(&mut tx, event.tenant_id, consumer.id, topic.id)
            .await?;

        let payload = versions
            .get(&consumer.version_id)
            .and_then(|name| event.versioned_payload.get(name))
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "no payload for version {} of consumer {}",
                    consumer.version_id, consumer.id
                ))
            })?;

        let record = NewEventRecord {
            tenant_id: event.tenant_id,
            consumer_id: consumer.id,
            topic_id: topic.id,
            version_id: consumer.version_id,
            subscription_id: subscription.id,
            headers: event.headers.clone(),
            payload: payload.clone(),
        };
        let event_id = self.storage.webhook_events.create_in_tx(&mut tx, &record, as_of).await?;
        self.storage.main_queue.enqueue_in_tx(&mut tx, event_id).await.map_err(CoreError::into_write_error)?;

        tx.commit().await.map_err(write_error)?;

        debug!(%event_id, subscription_id = %subscription.id, "event stored");
        info!(%event_id, "event enqueued");
        Ok(event_id)
    }
}

fn write_error(error: sqlx::Error) -> CoreError {
    CoreError::from(error).into_write_error()
}
