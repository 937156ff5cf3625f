//! Webhook delivery for httpq: queue pollers, the send pipeline and the
//! HTTP worker pool.
//!
//! # Architecture
//!
//! Two self-pacing dequeue loops (main and retry) each claim a batch of
//! event ids inside one transaction and push it through the send pipeline:
//!
//! 1. **Prepare** - load the captured request and the current subscription
//!    URL for every claimed event whose subscription is active
//! 2. **Deliver** - fan the requests out to a bounded pool of HTTP workers
//!    and wait for every classified response
//! 3. **Respond** - record each attempt, schedule retries on a base-3
//!    backoff and disable subscriptions whose events ran out of tries
//!
//! The claim, the reads and every write of a cycle share one transaction,
//! so a failure anywhere returns the claimed ids to their queue. A
//! separate partition manager keeps a rolling window of daily event
//! partitions, and the [`Enqueuer`] admits new events onto the main queue.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use httpq_core::{storage::Storage, RealClock};
//! use httpq_delivery::{
//!     client::{ClientConfig, DeliveryClient},
//!     dequeue::DequeueLoop,
//!     pipeline::SendPipeline,
//!     poller::MainQueuePoller,
//!     worker_pool::WorkerPool,
//!     DeliveryError,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(storage: Storage) -> std::result::Result<(), DeliveryError> {
//! let client = DeliveryClient::new(ClientConfig::default())?;
//! let pool = WorkerPool::start(WorkerPool::default_size(), client);
//! let pipeline = Arc::new(SendPipeline::new(pool.handle()));
//! let poller = MainQueuePoller::new(storage, pipeline, httpq_delivery::DEFAULT_MAIN_BATCH_SIZE);
//!
//! let cancellation = CancellationToken::new();
//! DequeueLoop::new(Arc::new(poller), Arc::new(RealClock::new()), cancellation.clone())
//!     .run()
//!     .await;
//! pool.shutdown(std::time::Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod client;
pub mod dequeue;
pub mod enqueuer;
pub mod error;
pub mod partition_manager;
pub mod pipeline;
pub mod poller;
pub mod storage;
pub mod worker_pool;

pub use enqueuer::Enqueuer;
pub use error::{DeliveryError, Result};

/// Events claimed from the main queue per cycle.
pub const DEFAULT_MAIN_BATCH_SIZE: i64 = 200;

/// Events claimed from the retry queue per cycle.
pub const DEFAULT_RETRY_BATCH_SIZE: i64 = 100;

/// Target spacing between the starts of two dequeue cycles.
pub const DEFAULT_EXECUTION_WINDOW_MS: u64 = 3_000;

/// Hard timeout of a single outbound delivery.
pub const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 2_950;

/// Workers spawned per unit of available parallelism.
pub const DEFAULT_WORKER_MULTIPLIER: usize = 4;
