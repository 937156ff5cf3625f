//! Postgres persistence for the event log, the work queues and the
//! collaborator entities consulted while admitting and sending events.
//!
//! Each repository is independently constructible over a shared pool. The
//! operations used inside a claim-and-send cycle or an admission come in an
//! `_in_tx` form so callers compose several repositories over one
//! transaction instead of going through a single store object.

use std::sync::Arc;

use sqlx::PgPool;

pub mod consumers;
pub mod main_queue;
pub mod partitions;
pub mod retry_queue;
pub mod schema;
pub mod subscriptions;
pub mod topics;
pub mod versions;
pub mod webhook_events;

use crate::error::Result;

/// Container for all repository instances.
#[derive(Clone)]
pub struct Storage {
    /// Partitioned webhook event log.
    pub webhook_events: Arc<webhook_events::Repository>,

    /// Queue of events awaiting their first attempt.
    pub main_queue: Arc<main_queue::Repository>,

    /// Queue of events awaiting a scheduled retry.
    pub retry_queue: Arc<retry_queue::Repository>,

    /// Daily partitions of the event log.
    pub partitions: Arc<partitions::Repository>,

    /// Subscription lookups and suspension.
    pub subscriptions: Arc<subscriptions::Repository>,

    /// Tenant payload versions.
    pub versions: Arc<versions::Repository>,

    /// Tenant topics.
    pub topics: Arc<topics::Repository>,

    /// Tenant consumers.
    pub consumers: Arc<consumers::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            webhook_events: Arc::new(webhook_events::Repository::new(pool.clone())),
            main_queue: Arc::new(main_queue::Repository::new(pool.clone())),
            retry_queue: Arc::new(retry_queue::Repository::new(pool.clone())),
            partitions: Arc::new(partitions::Repository::new(pool.clone())),
            subscriptions: Arc::new(subscriptions::Repository::new(pool.clone())),
            versions: Arc::new(versions::Repository::new(pool.clone())),
            topics: Arc::new(topics::Repository::new(pool.clone())),
            consumers: Arc::new(consumers::Repository::new(pool)),
        }
    }

    /// Shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.webhook_events.pool()
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool()).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_without_connecting() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://localhost/httpq").unwrap();
        let storage = Storage::new(pool);
        assert!(!storage.pool().is_closed());
    }
}
