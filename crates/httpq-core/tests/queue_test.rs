//! Integration tests for the main and retry queues.
//!
//! Exercise the claim semantics against a real Postgres: consuming claims,
//! insertion-order batches, due-time filtering and exclusive concurrent
//! claims. Require `DATABASE_URL` to name a reachable Postgres server.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{Duration, Utc};
use httpq_core::{EventId, RetryEntry};
use httpq_testing::TestDatabase;

#[tokio::test]
async fn main_queue_drains_in_fixed_batches() -> Result<()> {
    let db = TestDatabase::new().await?;
    let queue = &db.storage().main_queue;

    let mut enqueued = Vec::new();
    for _ in 0..206 {
        enqueued.push(queue.enqueue(EventId::new()).await?);
    }

    let first = queue.dequeue(100).await?;
    let second = queue.dequeue(100).await?;
    let third = queue.dequeue(100).await?;
    let fourth = queue.dequeue(100).await?;

    assert_eq!(first.len(), 100);
    assert_eq!(second.len(), 100);
    assert_eq!(third.len(), 6);
    assert!(fourth.is_empty());

    let drained: Vec<EventId> = first.into_iter().chain(second).chain(third).collect();
    assert_eq!(drained, enqueued, "batches follow insertion order without gaps");

    db.cleanup().await
}

#[tokio::test]
async fn empty_main_queue_returns_nothing() -> Result<()> {
    let db = TestDatabase::new().await?;

    assert!(db.storage().main_queue.dequeue(200).await?.is_empty());

    db.cleanup().await
}

#[tokio::test]
async fn rolled_back_claim_returns_entries_to_the_queue() -> Result<()> {
    let db = TestDatabase::new().await?;
    let queue = &db.storage().main_queue;
    let event_id = queue.enqueue(EventId::new()).await?;

    let mut tx = db.pool().begin().await?;
    assert_eq!(queue.dequeue_in_tx(&mut tx, 10).await?, vec![event_id]);
    tx.rollback().await?;

    assert_eq!(queue.dequeue(10).await?, vec![event_id]);

    db.cleanup().await
}

#[tokio::test]
async fn concurrent_claims_never_overlap() -> Result<()> {
    let db = TestDatabase::new().await?;
    let queue = &db.storage().main_queue;
    for _ in 0..30 {
        queue.enqueue(EventId::new()).await?;
    }

    let mut tx_a = db.pool().begin().await?;
    let mut tx_b = db.pool().begin().await?;

    let claimed_a = queue.dequeue_in_tx(&mut tx_a, 20).await?;
    let claimed_b = queue.dequeue_in_tx(&mut tx_b, 20).await?;

    assert_eq!(claimed_a.len(), 20);
    assert_eq!(claimed_b.len(), 10, "rows locked by the first claim are skipped");

    let a: HashSet<_> = claimed_a.iter().collect();
    assert!(claimed_b.iter().all(|id| !a.contains(id)));

    tx_a.commit().await?;
    tx_b.commit().await?;
    assert_eq!(queue.count().await?, 0);

    db.cleanup().await
}

#[tokio::test]
async fn retry_queue_only_returns_due_entries() -> Result<()> {
    let db = TestDatabase::new().await?;
    let queue = &db.storage().retry_queue;
    let now = Utc::now();

    let due = RetryEntry { event_id: EventId::new(), execute_at: now - Duration::seconds(5) };
    let exactly_now = RetryEntry { event_id: EventId::new(), execute_at: now };
    let later = RetryEntry { event_id: EventId::new(), execute_at: now + Duration::seconds(60) };
    queue.enqueue(&[due, exactly_now, later]).await?;

    let claimed = queue.dequeue_older_than(now, 100).await?;
    assert_eq!(claimed, vec![due.event_id, exactly_now.event_id]);

    assert!(queue.dequeue_older_than(now, 100).await?.is_empty());

    let claimed = queue.dequeue_older_than(now + Duration::seconds(60), 100).await?;
    assert_eq!(claimed, vec![later.event_id]);

    db.cleanup().await
}

#[tokio::test]
async fn concurrent_retry_claims_never_overlap() -> Result<()> {
    let db = TestDatabase::new().await?;
    let queue = &db.storage().retry_queue;
    let now = Utc::now();
    let entries: Vec<RetryEntry> = (0..30)
        .map(|_| RetryEntry { event_id: EventId::new(), execute_at: now - Duration::seconds(1) })
        .collect();
    queue.enqueue(&entries).await?;

    let mut tx_a = db.pool().begin().await?;
    let mut tx_b = db.pool().begin().await?;

    let claimed_a = queue.dequeue_older_than_in_tx(&mut tx_a, now, 20).await?;
    let claimed_b = queue.dequeue_older_than_in_tx(&mut tx_b, now, 20).await?;

    assert_eq!(claimed_a.len(), 20);
    assert_eq!(claimed_b.len(), 10, "due rows locked by the first claim are skipped");

    let a: HashSet<_> = claimed_a.iter().collect();
    assert!(claimed_b.iter().all(|id| !a.contains(id)));

    tx_a.commit().await?;
    tx_b.commit().await?;
    assert_eq!(queue.count().await?, 0);

    db.cleanup().await
}

#[tokio::test]
async fn retry_enqueue_of_nothing_is_a_no_op() -> Result<()> {
    let db = TestDatabase::new().await?;

    db.storage().retry_queue.enqueue(&[]).await?;
    assert_eq!(db.storage().retry_queue.count().await?, 0);

    db.cleanup().await
}

#[tokio::test]
async fn retry_queue_keeps_repeated_entries_for_one_event() -> Result<()> {
    let db = TestDatabase::new().await?;
    let queue = &db.storage().retry_queue;
    let event_id = EventId::new();
    let past = Utc::now() - Duration::seconds(1);

    queue.enqueue(&[RetryEntry { event_id, execute_at: past }]).await?;
    queue.enqueue(&[RetryEntry { event_id, execute_at: past }]).await?;

    assert_eq!(queue.dequeue_older_than(Utc::now(), 100).await?, vec![event_id, event_id]);

    db.cleanup().await
}
