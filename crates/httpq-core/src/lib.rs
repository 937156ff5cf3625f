//! Core domain models, partition lifecycle and persistence for httpq.
//!
//! Provides strongly-typed identifiers, the webhook state taxonomy, the
//! daily partition model for the event log, and the Postgres repositories
//! that back the main and retry work queues. The delivery crate builds its
//! pollers and send pipeline on top of these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod partition;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    AttemptedWebhook, Consumer, ConsumerId, DeliveryResponse, EventId, NewWebhookEvent,
    PendingDelivery, RetryEntry, Subscription, SubscriptionId, TenantId, Topic, TopicId, Version,
    VersionId, WebhookEvent, WebhookState,
};
pub use partition::{compute_desired_partitions_state, DailyPartitionTable, StateReconciliationSet};
pub use time::{Clock, RealClock, TestClock};
