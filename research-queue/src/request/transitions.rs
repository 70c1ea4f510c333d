//! Allowed state transitions and retry decisions.
//!
//! ```text
//! pending --claim--> processing --complete--> completed
//!                        |
//!                        +--fail (retriable, attempts left)--> pending
//!                        +--fail (permanent or exhausted)----> failed
//! ```

use chrono::{DateTime, Utc};

use super::types::{RequestId, RequestStatus};
use crate::error::{QueueError, Result};

impl RequestStatus {
    /// Whether the state machine permits moving from `self` to `to`.
    pub fn can_transition_to(self, to: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, to),
            (Pending, Processing) | (Processing, Completed) | (Processing, Failed) | (Processing, Pending)
        )
    }
}

/// Fail with [`QueueError::InvalidTransition`] unless `from -> to` is allowed.
pub fn ensure_transition(id: RequestId, from: RequestStatus, to: RequestStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(QueueError::InvalidTransition { id, from, to })
    }
}

/// Bounded retry policy with exponential backoff between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of processing attempts before a request is permanently failed
    pub max_attempts: u32,

    /// Base backoff duration in milliseconds (will be exponentially increased)
    pub backoff_ms: u64,

    /// Factor by which the backoff_ms is increased with each retry
    pub backoff_factor: u64,

    /// Maximum backoff time in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 30_000,
            backoff_factor: 2,
            max_backoff_ms: 600_000,
        }
    }
}

/// What happens to a request after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to `pending`, claimable from `not_before` onwards
    Retry { not_before: DateTime<Utc> },
    /// Terminal `failed`
    Fail,
}

impl RetryPolicy {
    /// Whether a request that has been claimed `attempt_count` times may run again.
    pub fn attempts_exhausted(&self, attempt_count: i32) -> bool {
        attempt_count >= self.max_attempts as i32
    }

    /// Backoff before the next attempt, given the number of attempts made so far.
    pub fn backoff_for(&self, attempt_count: i32) -> chrono::Duration {
        let exponent = attempt_count.saturating_sub(1).max(0) as u32;
        let exponential = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(exponent));
        let capped = exponential.min(self.max_backoff_ms);
        chrono::Duration::milliseconds(capped.min(i64::MAX as u64) as i64)
    }

    /// Decide the outcome of a failed attempt.
    pub fn decide(&self, attempt_count: i32, permanent: bool, now: DateTime<Utc>) -> FailureDisposition {
        if permanent || self.attempts_exhausted(attempt_count) {
            FailureDisposition::Fail
        } else {
            FailureDisposition::Retry {
                not_before: now + self.backoff_for(attempt_count),
            }
        }
    }
}
