//! Base-3 exponential backoff between delivery attempts.
//!
//! An attempt that did not deliver may be retried while fewer than
//! [`MAX_TRIES`] tries have been made. Retry times are anchored at the
//! event's creation time rather than at the failed attempt, so the schedule
//! does not drift with poll latency: try `n` is retried at
//! `created_at + 3^n` seconds. The curve and the ceiling are fixed.

use chrono::{DateTime, Utc};
use httpq_core::{AttemptedWebhook, WebhookState};

use crate::error::{DeliveryError, Result};

/// Tries after which an undelivered event is abandoned.
pub const MAX_TRIES: i32 = 10;

/// Base of the exponential delay, in seconds.
pub const BACKOFF_BASE_SECONDS: i64 = 3;

/// Whether another attempt may follow an attempt in `state`.
pub fn is_retriable(state: WebhookState, try_count: i32) -> bool {
    !state.is_delivered() && try_count < MAX_TRIES
}

/// Delay from creation to the retry of try `try_count`.
///
/// # Errors
///
/// Returns `DeliveryError::InvalidTryCount` when `try_count < 1` and
/// `DeliveryError::NotRetriable` when `try_count` has reached [`MAX_TRIES`].
pub fn delay_for(try_count: i32) -> Result<chrono::Duration> {
    let exponent = u32::try_from(try_count)
        .ok()
        .filter(|n| *n >= 1)
        .ok_or(DeliveryError::InvalidTryCount { try_count })?;
    if try_count >= MAX_TRIES {
        return Err(DeliveryError::NotRetriable { state: WebhookState::Pending, try_count });
    }

    // Bounded by 3^9 below the ceiling.
    let seconds = BACKOFF_BASE_SECONDS.pow(exponent);
    chrono::Duration::try_seconds(seconds).ok_or(DeliveryError::InvalidTryCount { try_count })
}

/// When the event should next be attempted.
///
/// # Errors
///
/// Returns `DeliveryError::InvalidTryCount` when `try_count < 1` and
/// `DeliveryError::NotRetriable` when the attempt delivered or used up the
/// last try.
pub fn next_attempt(
    created_at: DateTime<Utc>,
    try_count: i32,
    state: WebhookState,
) -> Result<DateTime<Utc>> {
    if try_count < 1 {
        return Err(DeliveryError::InvalidTryCount { try_count });
    }
    if !is_retriable(state, try_count) {
        return Err(DeliveryError::NotRetriable { state, try_count });
    }

    let delay = delay_for(try_count)?;
    created_at
        .checked_add_signed(delay)
        .ok_or(DeliveryError::NotRetriable { state, try_count })
}

/// What to do with an event after an attempt was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Delivered, nothing left to do.
    Delivered,
    /// Schedule another attempt.
    Retry {
        /// When the next attempt becomes due
        next_attempt_at: DateTime<Utc>,
    },
    /// Out of tries; the subscription gets disabled.
    Exhausted,
}

/// Decides the follow-up for one recorded attempt.
///
/// # Errors
///
/// Returns `DeliveryError::InvalidTryCount` if the attempt carries a try
/// count below 1, which a recorded attempt never does.
pub fn decide(attempt: &AttemptedWebhook) -> Result<RetryDecision> {
    if attempt.state.is_delivered() {
        return Ok(RetryDecision::Delivered);
    }
    if attempt.try_count >= MAX_TRIES {
        return Ok(RetryDecision::Exhausted);
    }

    let next_attempt_at = next_attempt(attempt.created_at, attempt.try_count, attempt.state)?;
    Ok(RetryDecision::Retry { next_attempt_at })
}
