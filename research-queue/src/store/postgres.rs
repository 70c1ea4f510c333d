//! PostgreSQL request store.
//!
//! - Idempotent ingestion through a partial unique index on `(requester, query)` for
//!   non-terminal rows, with `INSERT ... ON CONFLICT DO NOTHING`
//! - Atomic claims using `FOR UPDATE SKIP LOCKED`, so any number of workers can poll the
//!   same table without double-processing
//! - Transitions validated under a row lock before they are written

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPool;

use super::{CreateOutcome, ReclaimOutcome, RequestStore};
use crate::error::{QueueError, Result};
use crate::request::transitions::ensure_transition;
use crate::request::{FailureDisposition, RequestId, RequestStatus, ResearchRequest, RetryPolicy};

/// How many times `create_pending` re-runs its insert when the conflicting row is finalized
/// between the insert and the lookup.
const CREATE_RETRIES: usize = 3;

/// PostgreSQL implementation of [`RequestStore`].
#[derive(Clone)]
pub struct PostgresRequestStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresRequestStore {
    /// Create a new store on top of an existing pool. Run [`crate::migrator`] first.
    ///
    /// # Example
    /// ```ignore
    /// let pool = PgPool::connect("postgresql://localhost/research").await?;
    /// research_queue::migrator().run(&pool).await?;
    /// let store = PostgresRequestStore::new(pool, RetryPolicy::default());
    /// ```
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lock a row and return its status and attempt count.
    async fn lock_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: RequestId,
    ) -> Result<(RequestStatus, i32)> {
        sqlx::query_as::<_, (RequestStatus, i32)>(
            "SELECT status, attempt_count FROM research_requests WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(QueueError::NotFound(id))
    }
}

fn millis(d: Duration) -> f64 {
    d.as_millis() as f64
}

#[async_trait]
impl RequestStore for PostgresRequestStore {
    fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    #[tracing::instrument(skip(self, query), fields(requester = %requester))]
    async fn create_pending(&self, requester: &str, query: &str) -> Result<CreateOutcome> {
        for _ in 0..CREATE_RETRIES {
            let inserted = sqlx::query_scalar::<_, RequestId>(
                r#"
                INSERT INTO research_requests (id, query, requester)
                VALUES ($1, $2, $3)
                ON CONFLICT (requester, query) WHERE status IN ('pending', 'processing')
                DO NOTHING
                RETURNING id
                "#,
            )
            .bind(RequestId::new())
            .bind(query)
            .bind(requester)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(id) = inserted {
                return Ok(CreateOutcome { id, created: true });
            }

            let existing = sqlx::query_scalar::<_, RequestId>(
                r#"
                SELECT id FROM research_requests
                WHERE requester = $1 AND query = $2 AND status IN ('pending', 'processing')
                "#,
            )
            .bind(requester)
            .bind(query)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(id) = existing {
                return Ok(CreateOutcome { id, created: false });
            }

            tracing::debug!("Conflicting request finalized before lookup, retrying insert");
        }

        Err(QueueError::Other(anyhow!(
            "create_pending did not settle after {CREATE_RETRIES} attempts"
        )))
    }

    async fn claim_next(&self) -> Result<Option<ResearchRequest>> {
        let claimed = sqlx::query_as::<_, ResearchRequest>(
            r#"
            UPDATE research_requests
            SET
                status = 'processing',
                claimed_at = NOW(),
                not_before = NULL,
                attempt_count = attempt_count + 1,
                updated_at = NOW()
            WHERE id = (
                SELECT id
                FROM research_requests
                WHERE status = 'pending'
                    AND (not_before IS NULL OR not_before <= NOW())
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed)
    }

    #[tracing::instrument(skip(self, result), fields(request_id = %id))]
    async fn mark_completed(&self, id: RequestId, result: &str) -> Result<ResearchRequest> {
        let mut tx = self.pool.begin().await?;
        let (status, _) = Self::lock_row(&mut tx, id).await?;
        ensure_transition(id, status, RequestStatus::Completed)?;

        let row = sqlx::query_as::<_, ResearchRequest>(
            r#"
            UPDATE research_requests
            SET
                status = 'completed',
                result = $2,
                claimed_at = NULL,
                notify_claimed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(result)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    #[tracing::instrument(skip(self, error), fields(request_id = %id))]
    async fn mark_failed(&self, id: RequestId, error: &str, permanent: bool) -> Result<ResearchRequest> {
        let mut tx = self.pool.begin().await?;
        let (status, attempt_count) = Self::lock_row(&mut tx, id).await?;

        let row = match self.retry.decide(attempt_count, permanent, Utc::now()) {
            FailureDisposition::Fail => {
                ensure_transition(id, status, RequestStatus::Failed)?;
                sqlx::query_as::<_, ResearchRequest>(
                    r#"
                    UPDATE research_requests
                    SET
                        status = 'failed',
                        error = $2,
                        claimed_at = NULL,
                        notify_claimed_at = NOW(),
                        updated_at = NOW()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(id)
                .bind(error)
                .fetch_one(&mut *tx)
                .await?
            }
            FailureDisposition::Retry { .. } => {
                ensure_transition(id, status, RequestStatus::Pending)?;
                // Backoff is measured on the database clock, which claim_next compares against
                let backoff_ms = self.retry.backoff_for(attempt_count).num_milliseconds() as f64;
                sqlx::query_as::<_, ResearchRequest>(
                    r#"
                    UPDATE research_requests
                    SET
                        status = 'pending',
                        error = $2,
                        not_before = NOW() + ($3::float8 * INTERVAL '1 millisecond'),
                        claimed_at = NULL,
                        updated_at = NOW()
                    WHERE id = $1
                    RETURNING *
                    "#,
                )
                .bind(id)
                .bind(error)
                .bind(backoff_ms)
                .fetch_one(&mut *tx)
                .await?
            }
        };

        tx.commit().await?;
        Ok(row)
    }

    async fn reclaim_stale(&self, threshold: Duration) -> Result<ReclaimOutcome> {
        let rows = sqlx::query_as::<_, (RequestId, RequestStatus)>(
            r#"
            UPDATE research_requests
            SET
                status = CASE WHEN attempt_count >= $2
                    THEN 'failed'::research_status
                    ELSE 'pending'::research_status END,
                error = CASE WHEN attempt_count >= $2
                    THEN 'abandoned by worker after ' || attempt_count || ' attempts'
                    ELSE error END,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE id IN (
                SELECT id
                FROM research_requests
                WHERE status = 'processing'
                    AND claimed_at <= NOW() - ($1::float8 * INTERVAL '1 millisecond')
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, status
            "#,
        )
        .bind(millis(threshold))
        .bind(self.retry.max_attempts as i32)
        .fetch_all(&self.pool)
        .await?;

        let mut outcome = ReclaimOutcome::default();
        for (id, status) in rows {
            match status {
                RequestStatus::Failed => outcome.failed.push(id),
                _ => outcome.requeued.push(id),
            }
        }
        Ok(outcome)
    }

    async fn get(&self, id: RequestId) -> Result<Option<ResearchRequest>> {
        let row = sqlx::query_as::<_, ResearchRequest>("SELECT * FROM research_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn claim_undelivered(
        &self,
        lease: Duration,
        max_notify_attempts: u32,
        limit: usize,
    ) -> Result<Vec<ResearchRequest>> {
        let rows = sqlx::query_as::<_, ResearchRequest>(
            r#"
            UPDATE research_requests
            SET notify_claimed_at = NOW()
            WHERE id IN (
                SELECT id
                FROM research_requests
                WHERE status IN ('completed', 'failed')
                    AND notified_at IS NULL
                    AND notify_attempts < $2
                    AND (notify_claimed_at IS NULL
                        OR notify_claimed_at <= NOW() - ($1::float8 * INTERVAL '1 millisecond'))
                ORDER BY updated_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(millis(lease))
        .bind(max_notify_attempts as i32)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn mark_notified(&self, id: RequestId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE research_requests
            SET notified_at = NOW(), notify_claimed_at = NULL, notify_error = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn mark_notify_failed(&self, id: RequestId, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE research_requests
            SET
                notify_attempts = notify_attempts + 1,
                notify_error = $2,
                notify_claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }
}
