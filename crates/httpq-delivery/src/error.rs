//! Error types for the delivery path.
//!
//! Delivery outcomes themselves are never errors: a refused connection or a
//! 500 response is a classified [`httpq_core::WebhookState`] recorded on the
//! event. The errors here cover storage failures that abort a cycle,
//! backoff invariant violations and the worker pool lifecycle.

use std::time::Duration;

use httpq_core::{CoreError, WebhookState};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error types for delivery operations.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Persistence failed while claiming, reading or recording.
    #[error("storage error: {0}")]
    Storage(#[from] CoreError),

    /// A retry time was requested for an attempt that may not be retried.
    #[error("attempt in state {state} with try count {try_count} is not retriable")]
    NotRetriable {
        /// State recorded by the attempt
        state: WebhookState,
        /// Tries made so far
        try_count: i32,
    },

    /// A retry time was requested before any try was made.
    #[error("try count must be at least 1, got {try_count}")]
    InvalidTryCount {
        /// Offending try count
        try_count: i32,
    },

    /// Invalid client or pool configuration.
    #[error("invalid delivery configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// The worker pool no longer accepts requests.
    #[error("worker pool is shut down")]
    WorkerPoolClosed,

    /// Workers did not stop within the shutdown timeout.
    #[error("worker pool shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// A worker dropped a request without replying.
    #[error("delivery worker failed: {message}")]
    WorkerPanic {
        /// What was observed
        message: String,
    },
}

impl DeliveryError {
    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates a worker failure error.
    pub fn worker_panic(message: impl Into<String>) -> Self {
        Self::WorkerPanic { message: message.into() }
    }

    /// Whether the error stems from the database rather than from delivery
    /// bookkeeping.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
