//! In-memory request store.
//!
//! Suitable for tests and single-process deployments. Requests are lost on restart.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{CreateOutcome, ReclaimOutcome, RequestStore};
use crate::error::{QueueError, Result};
use crate::request::transitions::ensure_transition;
use crate::request::{FailureDisposition, RequestId, RequestStatus, ResearchRequest, RetryPolicy};

/// In-memory implementation of [`RequestStore`].
///
/// Rows are kept in insertion order behind a single mutex, so every operation is trivially
/// atomic and `claim_next` hands out the oldest claimable row first.
#[derive(Clone)]
pub struct InMemoryRequestStore {
    rows: Arc<Mutex<Vec<ResearchRequest>>>,
    retry: RetryPolicy,
}

impl InMemoryRequestStore {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            rows: Arc::new(Mutex::new(Vec::new())),
            retry,
        }
    }

    /// Snapshot of every stored row, oldest first.
    pub fn all(&self) -> Vec<ResearchRequest> {
        self.rows.lock().clone()
    }
}

impl Default for InMemoryRequestStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

fn find_mut(rows: &mut [ResearchRequest], id: RequestId) -> Result<&mut ResearchRequest> {
    rows.iter_mut().find(|r| r.id == id).ok_or(QueueError::NotFound(id))
}

/// `now - age`, or `None` when the age reaches back past the representable range.
fn checked_cutoff(now: DateTime<Utc>, age: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn create_pending(&self, requester: &str, query: &str) -> Result<CreateOutcome> {
        let mut rows = self.rows.lock();

        if let Some(existing) = rows
            .iter()
            .find(|r| !r.status.is_terminal() && r.requester == requester && r.query == query)
        {
            return Ok(CreateOutcome {
                id: existing.id,
                created: false,
            });
        }

        let row = ResearchRequest::new_pending(requester, query, Utc::now());
        let id = row.id;
        rows.push(row);

        Ok(CreateOutcome { id, created: true })
    }

    async fn claim_next(&self) -> Result<Option<ResearchRequest>> {
        let mut rows = self.rows.lock();
        let now = Utc::now();

        let Some(row) = rows.iter_mut().find(|r| {
            r.status == RequestStatus::Pending && r.not_before.is_none_or(|not_before| not_before <= now)
        }) else {
            return Ok(None);
        };

        row.status = RequestStatus::Processing;
        row.claimed_at = Some(now);
        row.not_before = None;
        row.attempt_count += 1;
        row.updated_at = now;

        Ok(Some(row.clone()))
    }

    async fn mark_completed(&self, id: RequestId, result: &str) -> Result<ResearchRequest> {
        let mut rows = self.rows.lock();
        let row = find_mut(&mut rows, id)?;
        ensure_transition(id, row.status, RequestStatus::Completed)?;

        let now = Utc::now();
        row.status = RequestStatus::Completed;
        row.result = Some(result.to_string());
        row.claimed_at = None;
        row.notify_claimed_at = Some(now);
        row.updated_at = now;

        Ok(row.clone())
    }

    async fn mark_failed(&self, id: RequestId, error: &str, permanent: bool) -> Result<ResearchRequest> {
        let mut rows = self.rows.lock();
        let row = find_mut(&mut rows, id)?;
        let now = Utc::now();

        let disposition = self.retry.decide(row.attempt_count, permanent, now);
        let target = match disposition {
            FailureDisposition::Fail => RequestStatus::Failed,
            FailureDisposition::Retry { .. } => RequestStatus::Pending,
        };
        ensure_transition(id, row.status, target)?;

        match disposition {
            FailureDisposition::Fail => {
                row.status = RequestStatus::Failed;
                row.notify_claimed_at = Some(now);
            }
            FailureDisposition::Retry { not_before } => {
                row.status = RequestStatus::Pending;
                row.not_before = Some(not_before);
            }
        }
        row.error = Some(error.to_string());
        row.claimed_at = None;
        row.updated_at = now;

        Ok(row.clone())
    }

    async fn reclaim_stale(&self, threshold: Duration) -> Result<ReclaimOutcome> {
        let mut rows = self.rows.lock();
        let now = Utc::now();
        let mut outcome = ReclaimOutcome::default();
        // Nothing was claimed that long ago
        let Some(cutoff) = checked_cutoff(now, threshold) else {
            return Ok(outcome);
        };

        for row in rows.iter_mut() {
            let stale = row.status == RequestStatus::Processing && row.claimed_at.is_some_and(|at| at <= cutoff);
            if !stale {
                continue;
            }

            if self.retry.attempts_exhausted(row.attempt_count) {
                row.status = RequestStatus::Failed;
                row.error = Some(format!("abandoned by worker after {} attempts", row.attempt_count));
                outcome.failed.push(row.id);
            } else {
                row.status = RequestStatus::Pending;
                outcome.requeued.push(row.id);
            }
            row.claimed_at = None;
            row.updated_at = now;
        }

        Ok(outcome)
    }

    async fn get(&self, id: RequestId) -> Result<Option<ResearchRequest>> {
        Ok(self.rows.lock().iter().find(|r| r.id == id).cloned())
    }

    async fn claim_undelivered(
        &self,
        lease: Duration,
        max_notify_attempts: u32,
        limit: usize,
    ) -> Result<Vec<ResearchRequest>> {
        let mut rows = self.rows.lock();
        let now = Utc::now();
        let lease_cutoff = checked_cutoff(now, lease);

        let claimed = rows
            .iter_mut()
            .filter(|r| {
                r.status.is_terminal()
                    && r.notified_at.is_none()
                    && r.notify_attempts < max_notify_attempts as i32
                    && r.notify_claimed_at
                        .is_none_or(|at| lease_cutoff.is_some_and(|cutoff| at <= cutoff))
            })
            .take(limit)
            .map(|r| {
                r.notify_claimed_at = Some(now);
                r.clone()
            })
            .collect();

        Ok(claimed)
    }

    async fn mark_notified(&self, id: RequestId) -> Result<()> {
        let mut rows = self.rows.lock();
        let row = find_mut(&mut rows, id)?;
        let now = Utc::now();
        row.notified_at = Some(now);
        row.notify_claimed_at = None;
        row.notify_error = None;
        row.updated_at = now;
        Ok(())
    }

    async fn mark_notify_failed(&self, id: RequestId, error: &str) -> Result<()> {
        let mut rows = self.rows.lock();
        let row = find_mut(&mut rows, id)?;
        row.notify_attempts += 1;
        row.notify_error = Some(error.to_string());
        row.notify_claimed_at = None;
        row.updated_at = Utc::now();
        Ok(())
    }
}
