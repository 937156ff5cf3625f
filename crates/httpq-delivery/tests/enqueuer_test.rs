//! Admission tests for the enqueuer.
//!
//! Require `DATABASE_URL` to name a reachable Postgres server.

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use httpq_core::{Clock, ConsumerId, CoreError, TestClock, WebhookState};
use httpq_delivery::Enqueuer;
use httpq_testing::{TenantFixture, TestDatabase};

#[tokio::test]
async fn enqueue_stores_consumer_version_payload() -> Result<()> {
    let db = TestDatabase::new().await?;
    let fixture = TenantFixture::create(db.pool(), "http://receiver.test/hook", &["v1", "v2"]).await?;
    let clock = TestClock::new();
    let enqueuer = Enqueuer::new(db.storage().clone(), Arc::new(clock.clone()));
    let mut event = fixture.new_event();
    event.headers = HashMap::from([("x-signature".to_string(), "abc".to_string())]);

    let event_id = enqueuer.enqueue(&event).await?;

    let stored = db.storage().webhook_events.get(fixture.tenant_id, event_id, clock.today()).await?;
    assert_eq!(stored.state, WebhookState::Pending);
    assert_eq!(stored.partition_date, clock.today());
    assert_eq!(stored.version_id, fixture.versions[0].0);
    assert_eq!(stored.subscription_id, fixture.subscription_id);
    let body = stored.request_body.map(|b| b.0).unwrap_or_default();
    assert_eq!(body["version"], "v1");
    let headers = stored.request_headers.map(|h| h.0).unwrap_or_default();
    assert_eq!(headers.get("x-signature").map(String::as_str), Some("abc"));

    assert_eq!(db.storage().main_queue.dequeue(10).await?, vec![event_id]);
    db.cleanup().await
}

#[tokio::test]
async fn mismatched_versions_are_rejected() -> Result<()> {
    let db = TestDatabase::new().await?;
    let fixture = TenantFixture::create(db.pool(), "http://receiver.test/hook", &["v1", "v2"]).await?;
    let enqueuer = Enqueuer::new(db.storage().clone(), Arc::new(TestClock::new()));

    let mut missing = fixture.new_event();
    missing.versioned_payload.remove("v2");
    let mut extra = fixture.new_event();
    extra.versioned_payload.insert("v3".to_string(), serde_json::json!({}));

    for event in [missing, extra] {
        let error = enqueuer.enqueue(&event).await.unwrap_err();
        assert!(matches!(error, CoreError::Validation(_)), "unexpected error: {error}");
        assert_eq!(error.code(), "E1001");
    }

    assert_eq!(db.storage().main_queue.count().await?, 0);
    db.cleanup().await
}

#[tokio::test]
async fn unknown_references_are_not_found() -> Result<()> {
    let db = TestDatabase::new().await?;
    let fixture = TenantFixture::create(db.pool(), "http://receiver.test/hook", &["v1"]).await?;
    let other = TenantFixture::create(db.pool(), "http://other.test/hook", &["v1"]).await?;
    let enqueuer = Enqueuer::new(db.storage().clone(), Arc::new(TestClock::new()));

    let mut unknown_topic = fixture.new_event();
    unknown_topic.topic_name = "invoice.voided".to_string();
    let mut unknown_consumer = fixture.new_event();
    unknown_consumer.consumer_id = ConsumerId::new();
    let mut foreign_consumer = fixture.new_event();
    foreign_consumer.consumer_id = other.consumer_id;

    for event in [unknown_topic, unknown_consumer, foreign_consumer] {
        let error = enqueuer.enqueue(&event).await.unwrap_err();
        assert!(matches!(error, CoreError::NotFound(_)), "unexpected error: {error}");
        assert_eq!(error.code(), "E1002");
    }

    assert_eq!(db.storage().main_queue.count().await?, 0);
    db.cleanup().await
}

#[tokio::test]
async fn missing_partition_is_a_validation_error() -> Result<()> {
    let db = TestDatabase::new().await?;
    let fixture = TenantFixture::create(db.pool(), "http://receiver.test/hook", &["v1"]).await?;
    let clock = TestClock::new();
    clock.advance(std::time::Duration::from_secs(60 * 86_400));
    let enqueuer = Enqueuer::new(db.storage().clone(), Arc::new(clock));

    let error = enqueuer.enqueue(&fixture.new_event()).await.unwrap_err();

    assert!(matches!(error, CoreError::Validation(_)));
    db.cleanup().await
}
