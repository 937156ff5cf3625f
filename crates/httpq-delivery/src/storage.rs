//! Storage seam for the send pipeline.
//!
//! The pipeline only needs four operations, all bound to the transaction of
//! the cycle that claimed the batch. `PgSendStore` composes the core
//! repositories over that transaction; `mock::MemoryStore` lets pipeline
//! behavior be tested without a database.

use async_trait::async_trait;
use chrono::NaiveDate;
use httpq_core::{
    error::Result, storage::Storage, AttemptedWebhook, DeliveryResponse, EventId, PendingDelivery,
    RetryEntry, SubscriptionId,
};
use sqlx::{Postgres, Transaction};

/// Storage operations performed by one send pipeline run.
#[async_trait]
pub trait SendStore: Send {
    /// Loads deliverable requests for the claimed ids.
    ///
    /// Ids whose subscription is inactive or failing, or whose event lies
    /// outside the retention window, are omitted.
    async fn list_for_sending(
        &mut self,
        ids: &[EventId],
        as_of: NaiveDate,
    ) -> Result<Vec<PendingDelivery>>;

    /// Records one attempt per response and returns the updated events.
    async fn record_attempts(
        &mut self,
        responses: &[DeliveryResponse],
        as_of: NaiveDate,
    ) -> Result<Vec<AttemptedWebhook>>;

    /// Schedules retries. Does nothing for an empty slice.
    async fn enqueue_retries(&mut self, entries: &[RetryEntry]) -> Result<()>;

    /// Marks subscriptions inactive and failing.
    async fn disable_subscriptions(&mut self, ids: &[SubscriptionId]) -> Result<u64>;
}

/// Postgres-backed store bound to the transaction of a claim.
pub struct PgSendStore<'a> {
    storage: &'a Storage,
    tx: &'a mut Transaction<'static, Postgres>,
}

impl<'a> PgSendStore<'a> {
    /// Binds the repositories of `storage` to `tx`.
    pub fn new(storage: &'a Storage, tx: &'a mut Transaction<'static, Postgres>) -> Self {
        Self { storage, tx }
    }
}

#[async_trait]
impl SendStore for PgSendStore<'_> {
    async fn list_for_sending(
        &mut self,
        ids: &[EventId],
        as_of: NaiveDate,
    ) -> Result<Vec<PendingDelivery>> {
        self.storage.webhook_events.list_for_sending_in_tx(&mut *self.tx, ids, as_of).await
    }

    async fn record_attempts(
        &mut self,
        responses: &[DeliveryResponse],
        as_of: NaiveDate,
    ) -> Result<Vec<AttemptedWebhook>> {
        self.storage.webhook_events.record_attempts_in_tx(&mut *self.tx, responses, as_of).await
    }

    async fn enqueue_retries(&mut self, entries: &[RetryEntry]) -> Result<()> {
        self.storage.retry_queue.enqueue_in_tx(&mut *self.tx, entries).await
    }

    async fn disable_subscriptions(&mut self, ids: &[SubscriptionId]) -> Result<u64> {
        self.storage.subscriptions.disable_and_fail_in_tx(&mut *self.tx, ids).await
    }
}

/// In-memory store for pipeline tests.
pub mod mock {
    use std::{
        collections::{HashMap, HashSet},
        sync::{Arc, Mutex, MutexGuard},
    };

    use chrono::{DateTime, Utc};
    use httpq_core::{CoreError, WebhookState};
    use sqlx::types::Json;

    use super::*;

    /// Event as tracked by the in-memory store.
    #[derive(Debug, Clone)]
    pub struct StoredEvent {
        /// Event id.
        pub event_id: EventId,
        /// Subscription the event is delivered through.
        pub subscription_id: SubscriptionId,
        /// Latest recorded state.
        pub state: WebhookState,
        /// Tries made so far.
        pub try_count: i32,
        /// Creation time, the anchor of the retry schedule.
        pub created_at: DateTime<Utc>,
        /// Captured request headers.
        pub headers: HashMap<String, String>,
        /// Captured request body.
        pub body: String,
        /// Latest recorded response status.
        pub response_code: Option<u16>,
    }

    #[derive(Debug, Default)]
    struct State {
        events: HashMap<EventId, StoredEvent>,
        urls: HashMap<SubscriptionId, String>,
        disabled: HashSet<SubscriptionId>,
        retries: Vec<RetryEntry>,
        fail_retry_enqueue: bool,
        fail_record: bool,
    }

    /// Cloneable in-memory [`SendStore`] with failure injection.
    #[derive(Debug, Clone, Default)]
    pub struct MemoryStore {
        state: Arc<Mutex<State>>,
    }

    impl MemoryStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        }

        /// Adds an active subscription delivering to `url`.
        pub fn add_subscription(&self, url: impl Into<String>) -> SubscriptionId {
            let id = SubscriptionId::new();
            self.state().urls.insert(id, url.into());
            id
        }

        /// Adds a pending event with `try_count` earlier tries.
        pub fn add_event(
            &self,
            subscription_id: SubscriptionId,
            try_count: i32,
            created_at: DateTime<Utc>,
        ) -> EventId {
            let event_id = EventId::new();
            self.state().events.insert(
                event_id,
                StoredEvent {
                    event_id,
                    subscription_id,
                    state: WebhookState::Pending,
                    try_count,
                    created_at,
                    headers: HashMap::from([("x-request-id".to_string(), event_id.to_string())]),
                    body: r#"{"amount":42}"#.to_string(),
                    response_code: None,
                },
            );
            event_id
        }

        /// Marks a subscription inactive and failing.
        pub fn disable(&self, subscription_id: SubscriptionId) {
            self.state().disabled.insert(subscription_id);
        }

        /// Makes every later retry enqueue fail.
        pub fn fail_retry_enqueue(&self) {
            self.state().fail_retry_enqueue = true;
        }

        /// Makes every later attempt recording fail.
        pub fn fail_record(&self) {
            self.state().fail_record = true;
        }

        /// Current view of an event.
        pub fn event(&self, event_id: EventId) -> Option<StoredEvent> {
            self.state().events.get(&event_id).cloned()
        }

        /// Retries scheduled so far.
        pub fn retries(&self) -> Vec<RetryEntry> {
            self.state().retries.clone()
        }

        /// Whether the subscription has been disabled.
        pub fn is_disabled(&self, subscription_id: SubscriptionId) -> bool {
            self.state().disabled.contains(&subscription_id)
        }
    }

    #[async_trait]
    impl SendStore for MemoryStore {
        async fn list_for_sending(
            &mut self,
            ids: &[EventId],
            _as_of: NaiveDate,
        ) -> Result<Vec<PendingDelivery>> {
            let state = self.state();
            let deliveries = ids
                .iter()
                .filter_map(|id| state.events.get(id))
                .filter(|event| !state.disabled.contains(&event.subscription_id))
                .filter_map(|event| {
                    let url = state.urls.get(&event.subscription_id)?;
                    Some(PendingDelivery {
                        event_id: event.event_id,
                        url: url.clone(),
                        request_headers: Some(Json(event.headers.clone())),
                        request_body: Some(event.body.clone()),
                    })
                })
                .collect();
            Ok(deliveries)
        }

        async fn record_attempts(
            &mut self,
            responses: &[DeliveryResponse],
            _as_of: NaiveDate,
        ) -> Result<Vec<AttemptedWebhook>> {
            let mut state = self.state();
            if state.fail_record {
                return Err(CoreError::Validation("injected record failure".to_string()));
            }

            let mut attempted = Vec::with_capacity(responses.len());
            for response in responses {
                let Some(event) = state.events.get_mut(&response.event_id) else {
                    continue;
                };
                event.state = response.state;
                event.try_count += 1;
                event.response_code = response.status_code;
                attempted.push(AttemptedWebhook {
                    event_id: event.event_id,
                    state: event.state,
                    subscription_id: event.subscription_id,
                    try_count: event.try_count,
                    created_at: event.created_at,
                });
            }
            Ok(attempted)
        }

        async fn enqueue_retries(&mut self, entries: &[RetryEntry]) -> Result<()> {
            let mut state = self.state();
            if state.fail_retry_enqueue {
                return Err(CoreError::Validation("injected retry enqueue failure".to_string()));
            }
            state.retries.extend_from_slice(entries);
            Ok(())
        }

        async fn disable_subscriptions(&mut self, ids: &[SubscriptionId]) -> Result<u64> {
            let mut state = self.state();
            let mut changed = 0;
            for id in ids {
                if state.disabled.insert(*id) {
                    changed += 1;
                }
            }
            Ok(changed)
        }
    }
}
