//! Polling worker that drives research requests to a terminal state.
//!
//! Each cycle:
//! 1. Returns stale `processing` claims to the queue
//! 2. Redelivers outcome notifications that have not reached the requester
//! 3. Claims and processes pending requests one at a time until none are claimable
//!
//! then sleeps for the poll interval. Several workers may share one store; the store's
//! atomic claim is the only coordination between them.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::notify::{Notification, Notifier};
use crate::provider::ResearchProvider;
use crate::request::{RequestStatus, ResearchRequest};
use crate::store::RequestStore;

#[cfg(test)]
mod tests;

/// Configuration for the worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to sleep between cycles once the queue is drained
    pub poll_interval: Duration,

    /// Claims older than this are considered abandoned. Also used as the lease on
    /// notification delivery. Must exceed `provider_timeout`.
    pub stale_after: Duration,

    /// Upper bound on a single research call; exceeding it is a retriable failure
    pub provider_timeout: Duration,

    /// Upper bound on a single notification send
    pub notify_timeout: Duration,

    /// Failed deliveries after which a notification is given up
    pub max_notify_attempts: u32,

    /// Maximum notifications redelivered per cycle
    pub notify_batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(15 * 60),
            provider_timeout: Duration::from_secs(5 * 60),
            notify_timeout: Duration::from_secs(30),
            max_notify_attempts: 5,
            notify_batch_size: 50,
        }
    }
}

/// Counts of what one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub requeued: usize,
    pub abandoned: usize,
    pub redelivered: usize,
    pub processed: usize,
}

/// Worker processing research requests from a [`RequestStore`].
pub struct Worker {
    store: Arc<dyn RequestStore>,
    provider: Arc<dyn ResearchProvider>,
    notifier: Arc<dyn Notifier>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        store: Arc<dyn RequestStore>,
        provider: Arc<dyn ResearchProvider>,
        notifier: Arc<dyn Notifier>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            provider,
            notifier,
            config,
        }
    }

    /// Run cycles until `shutdown` is cancelled.
    ///
    /// Store errors are logged and retried on the next cycle. A request already in flight when
    /// shutdown is requested is finalized before this returns.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            poll_interval = %humantime::format_duration(self.config.poll_interval),
            stale_after = %humantime::format_duration(self.config.stale_after),
            "Research worker starting"
        );

        loop {
            match self.run_cycle(&shutdown).await {
                Ok(stats) if stats != CycleStats::default() => {
                    tracing::debug!(?stats, "Worker cycle finished");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Worker cycle failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::info!("Research worker stopped");
        Ok(())
    }

    /// Run one cycle: recovery sweep, notification redelivery, then drain the queue.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> Result<CycleStats> {
        let mut stats = CycleStats::default();

        let reclaimed = self.store.reclaim_stale(self.config.stale_after).await?;
        if !reclaimed.is_empty() {
            tracing::warn!(
                requeued = reclaimed.requeued.len(),
                abandoned = reclaimed.failed.len(),
                "Reclaimed stale research requests"
            );
            counter!("research_requests_reclaimed_total", "outcome" => "requeued")
                .increment(reclaimed.requeued.len() as u64);
            counter!("research_requests_reclaimed_total", "outcome" => "failed")
                .increment(reclaimed.failed.len() as u64);
        }
        stats.requeued = reclaimed.requeued.len();
        stats.abandoned = reclaimed.failed.len();

        stats.redelivered = self.redeliver_notifications().await?;

        while !shutdown.is_cancelled() {
            let Some(request) = self.store.claim_next().await? else {
                tracing::trace!("No claimable research requests");
                break;
            };
            counter!("research_requests_claimed_total").increment(1);

            let request_id = request.id;
            if let Err(e) = self.process(request).await {
                tracing::error!(request_id = %request_id, error = %e, "Failed to finalize research request");
            }
            stats.processed += 1;
        }

        Ok(stats)
    }

    /// Run the provider for a claimed request and finalize it.
    #[tracing::instrument(skip(self, request), fields(request_id = %request.id, attempt = request.attempt_count))]
    async fn process(&self, request: ResearchRequest) -> Result<()> {
        tracing::info!("Processing research request");

        let outcome = tokio::time::timeout(self.config.provider_timeout, self.provider.research(&request.query)).await;

        match outcome {
            Ok(Ok(report)) => {
                let row = self.store.mark_completed(request.id, &report).await?;
                counter!("research_requests_completed_total").increment(1);
                tracing::info!("Research request completed");
                self.deliver(&row, Notification::research_ready(&row, &report)).await;
            }
            Ok(Err(e)) => {
                self.fail(&request, &e.to_string(), e.is_permanent()).await?;
            }
            Err(_) => {
                let message = format!(
                    "research timed out after {}",
                    humantime::format_duration(self.config.provider_timeout)
                );
                self.fail(&request, &message, false).await?;
            }
        }

        Ok(())
    }

    async fn fail(&self, request: &ResearchRequest, error: &str, permanent: bool) -> Result<()> {
        let row = self.store.mark_failed(request.id, error, permanent).await?;

        if row.status == RequestStatus::Failed {
            counter!("research_requests_failed_total", "disposition" => "failed").increment(1);
            tracing::warn!(error, permanent, "Research request failed");
            self.deliver(&row, Notification::research_failed(&row, error)).await;
        } else {
            counter!("research_requests_failed_total", "disposition" => "retry").increment(1);
            tracing::info!(error, not_before = ?row.not_before, "Research attempt failed, will retry");
        }

        Ok(())
    }

    /// Send the outcome of a terminal request and record the result. Never fails the caller.
    async fn deliver(&self, row: &ResearchRequest, notification: Notification) {
        let sent = tokio::time::timeout(self.config.notify_timeout, self.notifier.send(&notification)).await;

        let recorded = match sent {
            Ok(Ok(())) => {
                counter!("research_notifications_total", "outcome" => "delivered").increment(1);
                self.store.mark_notified(row.id).await
            }
            Ok(Err(e)) => {
                counter!("research_notifications_total", "outcome" => "failed").increment(1);
                tracing::warn!(request_id = %row.id, error = %e, "Notification delivery failed");
                self.store.mark_notify_failed(row.id, &e.to_string()).await
            }
            Err(_) => {
                counter!("research_notifications_total", "outcome" => "failed").increment(1);
                tracing::warn!(request_id = %row.id, "Notification delivery timed out");
                self.store.mark_notify_failed(row.id, "delivery timed out").await
            }
        };

        if let Err(e) = recorded {
            tracing::error!(request_id = %row.id, error = %e, "Failed to record notification outcome");
        }
    }

    async fn redeliver_notifications(&self) -> Result<usize> {
        let rows = self
            .store
            .claim_undelivered(
                self.config.stale_after,
                self.config.max_notify_attempts,
                self.config.notify_batch_size,
            )
            .await?;

        let count = rows.len();
        for row in rows {
            let Some(notification) = Notification::for_request(&row) else {
                continue;
            };
            tracing::info!(request_id = %row.id, notify_attempts = row.notify_attempts, "Redelivering notification");
            self.deliver(&row, notification).await;
        }

        Ok(count)
    }
}
