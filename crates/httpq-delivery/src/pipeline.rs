//! Prepare, deliver and respond over one claimed batch.
//!
//! Every stage works against the same [`SendStore`], which in production
//! is bound to the transaction that claimed the batch. A failing stage
//! aborts the run and the caller rolls the whole cycle back.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use httpq_core::{DeliveryResponse, EventId, RetryEntry, SubscriptionId};
use tracing::{debug, info, warn};

use crate::{
    backoff::{self, RetryDecision},
    client::DeliveryRequest,
    error::Result,
    storage::SendStore,
    worker_pool::WorkerHandle,
};

/// Loads the delivery requests for a claimed batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct Preparer;

impl Preparer {
    /// Builds one request per claimed event whose subscription accepts
    /// deliveries.
    ///
    /// Other ids produce no request and keep their current state.
    ///
    /// # Errors
    ///
    /// Returns error if loading fails.
    pub async fn prepare<S: SendStore + ?Sized>(
        &self,
        store: &mut S,
        ids: &[EventId],
        as_of: NaiveDate,
    ) -> Result<Vec<DeliveryRequest>> {
        let pending = store.list_for_sending(ids, as_of).await?;

        let skipped = ids.len().saturating_sub(pending.len());
        if skipped > 0 {
            warn!(skipped, "claimed events without an active subscription left pending");
        }

        Ok(pending.into_iter().map(DeliveryRequest::from).collect())
    }
}

/// Counts of what the responder did with a batch of responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponderOutcome {
    /// Attempts recorded.
    pub recorded: usize,
    /// Events that reached `DELIVERED`.
    pub delivered: usize,
    /// Events scheduled on the retry queue.
    pub retried: usize,
    /// Distinct subscriptions disabled because an event ran out of tries.
    pub disabled_subscriptions: usize,
}

/// Records attempts and schedules their follow-ups.
#[derive(Debug, Clone, Copy, Default)]
pub struct Responder;

impl Responder {
    /// Records every response, then enqueues retries for retriable failures
    /// and disables the subscriptions of exhausted ones.
    ///
    /// # Errors
    ///
    /// Returns error if recording, the retry enqueue or the disable fails.
    pub async fn apply<S: SendStore + ?Sized>(
        &self,
        store: &mut S,
        responses: &[DeliveryResponse],
        as_of: NaiveDate,
    ) -> Result<ResponderOutcome> {
        let attempted = store.record_attempts(responses, as_of).await?;

        let mut delivered = 0;
        let mut retries = Vec::new();
        let mut exhausted = BTreeSet::<SubscriptionId>::new();
        for attempt in &attempted {
            match backoff::decide(attempt)? {
                RetryDecision::Delivered => delivered += 1,
                RetryDecision::Retry { next_attempt_at } => {
                    retries.push(RetryEntry { event_id: attempt.event_id, execute_at: next_attempt_at });
                },
                RetryDecision::Exhausted => {
                    debug!(event_id = %attempt.event_id, subscription_id = %attempt.subscription_id, "event out of tries");
                    exhausted.insert(attempt.subscription_id);
                },
            }
        }

        let exhausted: Vec<SubscriptionId> = exhausted.into_iter().collect();
        store.enqueue_retries(&retries).await?;
        store.disable_subscriptions(&exhausted).await?;

        if !exhausted.is_empty() {
            warn!(subscriptions = exhausted.len(), "disabled subscriptions after exhausting retries");
        }

        Ok(ResponderOutcome {
            recorded: attempted.len(),
            delivered,
            retried: retries.len(),
            disabled_subscriptions: exhausted.len(),
        })
    }
}

/// Summary of one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Ids handed to the pipeline.
    pub claimed: usize,
    /// Requests sent to the workers.
    pub sent: usize,
    /// What the responder did.
    pub outcome: ResponderOutcome,
}

/// The three-stage send pipeline.
#[derive(Clone)]
pub struct SendPipeline {
    preparer: Preparer,
    workers: WorkerHandle,
    responder: Responder,
}

impl SendPipeline {
    /// Creates a pipeline delivering through `workers`.
    pub fn new(workers: WorkerHandle) -> Self {
        Self { preparer: Preparer, workers, responder: Responder }
    }

    /// Runs the claimed `ids` through prepare, deliver and respond.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure; nothing after it runs.
    pub async fn send<S: SendStore + ?Sized>(
        &self,
        store: &mut S,
        ids: &[EventId],
        as_of: NaiveDate,
    ) -> Result<SendReport> {
        if ids.is_empty() {
            return Ok(SendReport::default());
        }

        let requests = self.preparer.prepare(store, ids, as_of).await?;
        let sent = requests.len();
        let responses = self.workers.dispatch_all(requests).await?;
        let outcome = self.responder.apply(store, &responses, as_of).await?;

        info!(
            claimed = ids.len(),
            sent,
            delivered = outcome.delivered,
            retried = outcome.retried,
            disabled_subscriptions = outcome.disabled_subscriptions,
            "send pipeline finished"
        );

        Ok(SendReport { claimed: ids.len(), sent, outcome })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use httpq_core::WebhookState;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::{
        client::{ClientConfig, DeliveryClient},
        storage::mock::MemoryStore,
        worker_pool::WorkerPool,
    };

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    fn created_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z").unwrap().to_utc()
    }

    async fn receiver(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        server
    }

    fn start_pool() -> WorkerPool {
        WorkerPool::start(4, DeliveryClient::new(ClientConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn delivered_event_is_not_rescheduled() {
        let server = receiver(200).await;
        let mut store = MemoryStore::new();
        let subscription = store.add_subscription(server.uri());
        let event = store.add_event(subscription, 0, created_at());
        let pool = start_pool();

        let report =
            SendPipeline::new(pool.handle()).send(&mut store, &[event], today()).await.unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(report.outcome.delivered, 1);
        let stored = store.event(event).unwrap();
        assert_eq!(stored.state, WebhookState::Delivered);
        assert_eq!(stored.try_count, 1);
        assert!(store.retries().is_empty());
        assert!(!store.is_disabled(subscription));

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn first_failure_is_retried_three_seconds_after_creation() {
        let server = receiver(500).await;
        let mut store = MemoryStore::new();
        let subscription = store.add_subscription(server.uri());
        let event = store.add_event(subscription, 0, created_at());
        let pool = start_pool();

        let report =
            SendPipeline::new(pool.handle()).send(&mut store, &[event], today()).await.unwrap();

        assert_eq!(report.outcome.retried, 1);
        let stored = store.event(event).unwrap();
        assert_eq!(stored.state, WebhookState::HttpError);
        assert_eq!(stored.response_code, Some(500));
        assert_eq!(stored.try_count, 1);
        assert_eq!(
            store.retries(),
            vec![RetryEntry { event_id: event, execute_at: created_at() + chrono::Duration::seconds(3) }]
        );
        assert!(!store.is_disabled(subscription));

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn tenth_failure_disables_the_subscription() {
        let server = receiver(429).await;
        let mut store = MemoryStore::new();
        let subscription = store.add_subscription(server.uri());
        let event = store.add_event(subscription, 9, created_at());
        let pool = start_pool();

        let report =
            SendPipeline::new(pool.handle()).send(&mut store, &[event], today()).await.unwrap();

        assert_eq!(report.outcome.disabled_subscriptions, 1);
        let stored = store.event(event).unwrap();
        assert_eq!(stored.state, WebhookState::Backoff);
        assert_eq!(stored.try_count, 10);
        assert!(store.retries().is_empty());
        assert!(store.is_disabled(subscription));

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn events_of_disabled_subscriptions_are_skipped() {
        let server = receiver(200).await;
        let mut store = MemoryStore::new();
        let active = store.add_subscription(server.uri());
        let disabled = store.add_subscription(server.uri());
        store.disable(disabled);
        let sent = store.add_event(active, 0, created_at());
        let skipped = store.add_event(disabled, 0, created_at());
        let pool = start_pool();

        let report = SendPipeline::new(pool.handle())
            .send(&mut store, &[sent, skipped], today())
            .await
            .unwrap();

        assert_eq!(report.claimed, 2);
        assert_eq!(report.sent, 1);
        let skipped = store.event(skipped).unwrap();
        assert_eq!(skipped.state, WebhookState::Pending);
        assert_eq!(skipped.try_count, 0);

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_events_disable_each_subscription_once() {
        let server = receiver(503).await;
        let mut store = MemoryStore::new();
        let subscription = store.add_subscription(server.uri());
        let first = store.add_event(subscription, 9, created_at());
        let second = store.add_event(subscription, 9, created_at());
        let pool = start_pool();

        let report = SendPipeline::new(pool.handle())
            .send(&mut store, &[first, second], today())
            .await
            .unwrap();

        assert_eq!(report.outcome.recorded, 2);
        assert_eq!(report.outcome.disabled_subscriptions, 1);

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn failing_retry_enqueue_fails_the_run() {
        let server = receiver(500).await;
        let mut store = MemoryStore::new();
        let subscription = store.add_subscription(server.uri());
        let event = store.add_event(subscription, 0, created_at());
        store.fail_retry_enqueue();
        let pool = start_pool();

        let result = SendPipeline::new(pool.handle()).send(&mut store, &[event], today()).await;

        assert!(result.unwrap_err().is_storage());

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn failing_record_stops_before_scheduling() {
        let server = receiver(500).await;
        let mut store = MemoryStore::new();
        let subscription = store.add_subscription(server.uri());
        let event = store.add_event(subscription, 0, created_at());
        store.fail_record();
        let pool = start_pool();

        let result = SendPipeline::new(pool.handle()).send(&mut store, &[event], today()).await;

        assert!(result.is_err());
        assert!(store.retries().is_empty());
        assert_eq!(store.event(event).unwrap().try_count, 0);

        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn empty_batch_sends_nothing() {
        let mut store = MemoryStore::new();
        let pool = start_pool();

        let report = SendPipeline::new(pool.handle()).send(&mut store, &[], today()).await.unwrap();

        assert_eq!(report, SendReport::default());
        pool.shutdown(Duration::from_secs(5)).await.unwrap();
    }
}
