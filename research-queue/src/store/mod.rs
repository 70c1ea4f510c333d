use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::request::{RequestId, ResearchRequest, RetryPolicy};

pub mod in_memory;

#[cfg(feature = "postgres")]
pub mod postgres;


/// Result of [`RequestStore::create_pending`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateOutcome {
    pub id: RequestId,
    /// `false` when a non-terminal row with the same `(requester, query)` already existed.
    pub created: bool,
}

/// Result of [`RequestStore::reclaim_stale`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimOutcome {
    /// Stale claims returned to `pending`
    pub requeued: Vec<RequestId>,
    /// Stale claims that had no attempts left and were marked `failed`
    pub failed: Vec<RequestId>,
}

impl ReclaimOutcome {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Durable store for research requests.
///
/// The store owns every mutation of a [`ResearchRequest`]. All transitions are atomic, and
/// every method is safe to call concurrently from several processes sharing one backend.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Retry policy applied by [`mark_failed`](RequestStore::mark_failed) and
    /// [`reclaim_stale`](RequestStore::reclaim_stale).
    fn retry_policy(&self) -> RetryPolicy;

    /// Insert a new `pending` request unless a non-terminal one with the same
    /// `(requester, query)` exists, in which case its id is returned with `created = false`.
    async fn create_pending(&self, requester: &str, query: &str) -> Result<CreateOutcome>;

    /// Atomically claim the oldest claimable `pending` request.
    ///
    /// Sets `status = processing`, stamps `claimed_at` and increments `attempt_count`. Two
    /// concurrent callers never receive the same row.
    async fn claim_next(&self) -> Result<Option<ResearchRequest>>;

    /// `processing -> completed`, storing `result`.
    ///
    /// # Errors
    /// - `NotFound` if the request doesn't exist
    /// - `InvalidTransition` if the request is not `processing`
    async fn mark_completed(&self, id: RequestId, result: &str) -> Result<ResearchRequest>;

    /// Record a failed attempt.
    ///
    /// Moves to terminal `failed` if `permanent` or the retry policy has no attempts left,
    /// otherwise back to `pending` with a backoff. Returns the updated row so callers can
    /// tell which of the two happened.
    ///
    /// # Errors
    /// - `NotFound` if the request doesn't exist
    /// - `InvalidTransition` if the request is not `processing`
    async fn mark_failed(&self, id: RequestId, error: &str, permanent: bool) -> Result<ResearchRequest>;

    /// Return `processing` rows claimed longer than `threshold` ago to `pending`.
    ///
    /// `attempt_count` is preserved. Rows that have already used every attempt are marked
    /// `failed` instead, so an abandoned claim can never exceed the retry budget.
    async fn reclaim_stale(&self, threshold: Duration) -> Result<ReclaimOutcome>;

    /// Fetch a request by id.
    async fn get(&self, id: RequestId) -> Result<Option<ResearchRequest>>;

    /// Lease terminal requests whose outcome notification still has to be delivered.
    ///
    /// A row is eligible when it has not been notified, has fewer than `max_notify_attempts`
    /// failed deliveries, and nobody holds a delivery lease younger than `lease`.
    async fn claim_undelivered(
        &self,
        lease: Duration,
        max_notify_attempts: u32,
        limit: usize,
    ) -> Result<Vec<ResearchRequest>>;

    /// Record a successful notification delivery.
    async fn mark_notified(&self, id: RequestId) -> Result<()>;

    /// Record a failed notification delivery and release the lease.
    async fn mark_notify_failed(&self, id: RequestId, error: &str) -> Result<()>;
}
