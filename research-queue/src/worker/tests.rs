use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{CycleStats, Worker, WorkerConfig};
use crate::notify::MockNotifier;
use crate::provider::{MockProvider, ProviderError};
use crate::request::{RequestStatus, RetryPolicy};
use crate::store::in_memory::InMemoryRequestStore;
use crate::store::RequestStore;

struct Harness {
    store: InMemoryRequestStore,
    provider: MockProvider,
    notifier: MockNotifier,
    worker: Worker,
}

fn harness(retry: RetryPolicy, config: WorkerConfig) -> Harness {
    let store = InMemoryRequestStore::new(retry);
    let provider = MockProvider::new();
    let notifier = MockNotifier::new();
    let worker = Worker::new(
        Arc::new(store.clone()),
        Arc::new(provider.clone()),
        Arc::new(notifier.clone()),
        config,
    );
    Harness {
        store,
        provider,
        notifier,
        worker,
    }
}

fn immediate_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff_ms: 0,
        backoff_factor: 2,
        max_backoff_ms: 0,
    }
}

#[test_log::test(tokio::test)]
async fn test_success_completes_and_notifies_once() {
    let h = harness(immediate_retries(3), WorkerConfig::default());
    h.provider.push_response(Ok("1) Executive summary\n2) Key insights".to_string()));

    let created = h.store.create_pending("u1@example.com", "supply-chain forecasting").await.unwrap();
    let stats = h.worker.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(stats.processed, 1);

    let row = h.store.get(created.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Completed);
    assert_eq!(row.result.as_deref(), Some("1) Executive summary\n2) Key insights"));
    assert_eq!(row.attempt_count, 1);
    assert!(row.claimed_at.is_none());
    assert!(row.notified_at.is_some());

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "u1@example.com");
    assert_eq!(sent[0].html, "1) Executive summary<br>2) Key insights");
    assert_eq!(h.provider.calls(), vec!["supply-chain forecasting".to_string()]);
}

#[test_log::test(tokio::test)]
async fn test_exhausted_retries_fail_with_single_notification() {
    let h = harness(immediate_retries(3), WorkerConfig::default());
    h.provider.fail_times(3);

    let created = h.store.create_pending("u1", "topic").await.unwrap();
    h.worker.run_cycle(&CancellationToken::new()).await.unwrap();

    let row = h.store.get(created.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Failed);
    assert_eq!(row.attempt_count, 3);
    assert_eq!(row.error.as_deref(), Some("transient provider failure: upstream unavailable (3)"));
    assert_eq!(h.provider.calls().len(), 3);

    let sent = h.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].subject.contains("could not be completed"));

    // Nothing left to claim, nothing left to notify
    let stats = h.worker.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(stats, CycleStats::default());
    assert_eq!(h.provider.calls().len(), 3);
    assert_eq!(h.notifier.sent().len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_retriable_failure_waits_for_backoff() {
    let retry = RetryPolicy {
        max_attempts: 3,
        backoff_ms: 60_000,
        backoff_factor: 2,
        max_backoff_ms: 60_000,
    };
    let h = harness(retry, WorkerConfig::default());
    h.provider.fail_times(1);

    let created = h.store.create_pending("u1", "topic").await.unwrap();
    let stats = h.worker.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(stats.processed, 1);

    let row = h.store.get(created.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Pending);
    assert_eq!(row.attempt_count, 1);
    assert!(row.error.is_some());
    assert!(row.not_before.is_some());
    assert!(h.notifier.sent().is_empty());

    // Still backing off
    let stats = h.worker.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(stats.processed, 0);
}

#[test_log::test(tokio::test)]
async fn test_permanent_failure_is_not_retried() {
    let h = harness(immediate_retries(5), WorkerConfig::default());
    h.provider
        .push_response(Err(ProviderError::Permanent("provider returned 400 Bad Request".to_string())));

    let created = h.store.create_pending("u1", "topic").await.unwrap();
    h.worker.run_cycle(&CancellationToken::new()).await.unwrap();

    let row = h.store.get(created.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Failed);
    assert_eq!(row.attempt_count, 1);
    assert_eq!(h.provider.calls().len(), 1);
    assert_eq!(h.notifier.sent().len(), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_provider_timeout_is_retriable() {
    let config = WorkerConfig {
        provider_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let h = harness(immediate_retries(2), config);
    h.provider.set_delay(Duration::from_secs(10));

    let created = h.store.create_pending("u1", "topic").await.unwrap();
    h.worker.run_cycle(&CancellationToken::new()).await.unwrap();

    let row = h.store.get(created.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Failed);
    assert_eq!(row.attempt_count, 2);
    assert_eq!(row.error.as_deref(), Some("research timed out after 1s"));
}

#[test_log::test(tokio::test)]
async fn test_delivery_failure_keeps_status_and_redelivers() {
    let h = harness(immediate_retries(3), WorkerConfig::default());
    h.notifier.push_failure("smtp connection refused");

    let created = h.store.create_pending("u1", "topic").await.unwrap();
    h.worker.run_cycle(&CancellationToken::new()).await.unwrap();

    let row = h.store.get(created.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Completed);
    assert_eq!(row.notify_attempts, 1);
    assert!(row.notified_at.is_none());
    assert!(h.notifier.sent().is_empty());

    let stats = h.worker.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(stats.redelivered, 1);
    assert_eq!(stats.processed, 0);

    let row = h.store.get(created.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Completed);
    assert!(row.notified_at.is_some());
    assert_eq!(h.notifier.sent().len(), 1);
    assert_eq!(h.provider.calls().len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_delivery_gives_up_after_max_attempts() {
    let config = WorkerConfig {
        max_notify_attempts: 2,
        ..Default::default()
    };
    let h = harness(immediate_retries(3), config);
    for _ in 0..5 {
        h.notifier.push_failure("mailbox unavailable");
    }

    let created = h.store.create_pending("u1", "topic").await.unwrap();
    for _ in 0..4 {
        h.worker.run_cycle(&CancellationToken::new()).await.unwrap();
    }

    let row = h.store.get(created.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Completed);
    assert_eq!(row.notify_attempts, 2);
    assert_eq!(row.notify_error.as_deref(), Some("notification delivery failed: mailbox unavailable"));
}

#[test_log::test(tokio::test)]
async fn test_abandoned_claim_is_recovered() {
    let config = WorkerConfig {
        stale_after: Duration::ZERO,
        ..Default::default()
    };
    let h = harness(immediate_retries(3), config);

    let created = h.store.create_pending("u1", "topic").await.unwrap();
    // A worker that crashed mid-flight
    let claimed = h.store.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.id, created.id);

    let stats = h.worker.run_cycle(&CancellationToken::new()).await.unwrap();
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.processed, 1);

    let row = h.store.get(created.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Completed);
    assert_eq!(row.attempt_count, 2);
}

#[test_log::test(tokio::test)]
async fn test_cancelled_worker_claims_nothing() {
    let h = harness(immediate_retries(3), WorkerConfig::default());
    let created = h.store.create_pending("u1", "topic").await.unwrap();

    let shutdown = CancellationToken::new();
    shutdown.cancel();

    h.worker.run(shutdown).await.unwrap();

    let row = h.store.get(created.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Pending);
    assert!(h.provider.calls().is_empty());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_shutdown_finalizes_request_in_flight() {
    let h = Arc::new(harness(immediate_retries(3), WorkerConfig::default()));
    h.provider.set_delay(Duration::from_secs(10));
    let first = h.store.create_pending("u1", "first topic").await.unwrap();
    let second = h.store.create_pending("u2", "second topic").await.unwrap();

    let shutdown = CancellationToken::new();
    let handle = {
        let h = h.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { h.worker.run(shutdown).await })
    };

    // The first request is with the provider when shutdown arrives
    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let row = h.store.get(first.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Completed);
    assert!(row.claimed_at.is_none());
    assert_eq!(h.notifier.sent().len(), 1);

    let row = h.store.get(second.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Pending);
    assert_eq!(row.attempt_count, 0);

    assert_eq!(h.provider.calls(), vec!["first topic".to_string()]);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_run_polls_until_shutdown() {
    let config = WorkerConfig {
        poll_interval: Duration::from_secs(60),
        ..Default::default()
    };
    let h = Arc::new(harness(immediate_retries(3), config));
    let shutdown = CancellationToken::new();

    let handle = {
        let h = h.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { h.worker.run(shutdown).await })
    };

    // Let the first (empty) cycle run, then enqueue work for the next one
    tokio::time::sleep(Duration::from_secs(1)).await;
    let created = h.store.create_pending("u1", "topic").await.unwrap();
    tokio::time::sleep(Duration::from_secs(61)).await;

    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let row = h.store.get(created.id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Completed);
}

#[cfg(feature = "postgres")]
#[sqlx::test(migrations = "./migrations")]
async fn test_concurrent_workers_process_each_request_once_postgres(pool: sqlx::PgPool) {
    use std::collections::HashSet;

    use crate::store::postgres::PostgresRequestStore;

    let store = Arc::new(PostgresRequestStore::new(pool, immediate_retries(3)));
    let provider = MockProvider::new();
    let notifier = MockNotifier::new();

    let mut ids = Vec::new();
    for i in 0..40 {
        ids.push(store.create_pending(&format!("u{i}"), &format!("topic {i}")).await.unwrap().id);
    }

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let worker = Worker::new(
                store.clone(),
                Arc::new(provider.clone()),
                Arc::new(notifier.clone()),
                WorkerConfig::default(),
            );
            tokio::spawn(async move { worker.run_cycle(&CancellationToken::new()).await })
        })
        .collect();

    let mut processed = 0;
    for handle in handles {
        processed += handle.await.unwrap().unwrap().processed;
    }
    assert_eq!(processed, 40);

    let calls = provider.calls();
    assert_eq!(calls.len(), 40);
    assert_eq!(calls.iter().collect::<HashSet<_>>().len(), 40);
    assert_eq!(notifier.sent().len(), 40);

    for id in ids {
        let row = store.get(id).await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Completed);
        assert_eq!(row.attempt_count, 1);
    }
}
