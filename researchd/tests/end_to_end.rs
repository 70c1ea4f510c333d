//! Full link flow: issue a link, click it, let the worker process the request and check what
//! the requester is told.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum_test::TestServer;
use chrono::Utc;
use futures::future::join_all;
use research_queue::{
    InMemoryRequestStore, MockNotifier, MockProvider, RequestStatus, RequestStore, RetryPolicy, Worker, WorkerConfig,
};
use researchd::{AppState, build_router, links::TokenCodec, test_utils::TEST_SECRET};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

const DAY: Duration = Duration::from_secs(86_400);

struct Stack {
    server: TestServer,
    store: InMemoryRequestStore,
    provider: MockProvider,
    notifier: MockNotifier,
    worker: Worker,
    links: Arc<TokenCodec>,
}

fn stack() -> Stack {
    let store = InMemoryRequestStore::new(RetryPolicy {
        max_attempts: 3,
        backoff_ms: 0,
        backoff_factor: 2,
        max_backoff_ms: 0,
    });
    let provider = MockProvider::new();
    let notifier = MockNotifier::new();
    let links = Arc::new(TokenCodec::new(TEST_SECRET, DAY));

    let state = AppState::builder()
        .store(Arc::new(store.clone()))
        .links(links.clone())
        .build();
    let server = TestServer::new(build_router(state, None)).unwrap();

    let worker = Worker::new(
        Arc::new(store.clone()),
        Arc::new(provider.clone()),
        Arc::new(notifier.clone()),
        WorkerConfig::default(),
    );

    Stack {
        server,
        store,
        provider,
        notifier,
        worker,
        links,
    }
}

impl Stack {
    async fn click(&self, query: &str, requester: &str, token: &str) -> axum_test::TestResponse {
        self.server
            .get("/research")
            .add_query_param("q", query)
            .add_query_param("uid", requester)
            .add_query_param("tk", token)
            .await
    }

    async fn cycle(&self) {
        self.worker.run_cycle(&CancellationToken::new()).await.unwrap();
    }
}

#[test_log::test(tokio::test)]
async fn test_click_to_completed_report() {
    let s = stack();
    s.provider
        .push_response(Ok("1) Executive summary\n2) Key insights\n3) Further reading".to_string()));
    let token = s.links.issue("u1@example.com", "supply-chain forecasting");

    s.click("supply-chain forecasting", "u1@example.com", &token)
        .await
        .assert_status_ok();

    let rows = s.store.all();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, RequestStatus::Pending);
    let id = rows[0].id;

    s.cycle().await;

    let row = s.store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Completed);
    assert!(row.result.as_deref().unwrap().contains("Executive summary"));

    let sent = s.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "u1@example.com");
    assert!(sent[0].subject.contains("supply-chain forecasting"));
    assert!(sent[0].html.contains("Key insights"));

    // A finished request does not block asking again with the same link
    s.click("supply-chain forecasting", "u1@example.com", &token)
        .await
        .assert_status_ok();
    let rows = s.store.all();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows.iter().filter(|r| r.status == RequestStatus::Pending).count(), 1);

    // Only the new request produces a notification
    s.cycle().await;
    assert_eq!(s.notifier.sent().len(), 2);
}

#[test_log::test(tokio::test)]
async fn test_provider_outage_ends_in_single_failure_notice() {
    let s = stack();
    s.provider.fail_times(3);
    let token = s.links.issue("u1@example.com", "topic");

    s.click("topic", "u1@example.com", &token).await.assert_status_ok();
    let id = s.store.all()[0].id;

    s.cycle().await;

    let row = s.store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, RequestStatus::Failed);
    assert_eq!(row.attempt_count, 3);
    assert_eq!(s.provider.calls().len(), 3);

    let sent = s.notifier.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].subject.contains("could not be completed"));

    s.cycle().await;
    assert_eq!(s.notifier.sent().len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_bad_links_leave_no_trace() {
    let s = stack();
    let expired = s.links.issue_at("u1", "topic", Utc::now() - chrono::Duration::days(2));
    let valid = s.links.issue("u1", "topic");
    let tampered = format!("{}A", valid);

    let response = s.click("topic", "u1", &expired).await;
    response.assert_status(StatusCode::BAD_REQUEST);
    let body: Value = response.json();
    assert_eq!(body["error"], "invalid_link");
    assert_eq!(body["reason"], "expired");

    let response = s.click("topic", "u1", &tampered).await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["reason"], "invalid");

    s.click("topic", "u1", "not-a-token").await.assert_status(StatusCode::BAD_REQUEST);

    assert!(s.store.all().is_empty());
    s.cycle().await;
    assert!(s.provider.calls().is_empty());
    assert!(s.notifier.sent().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_concurrent_clicks_create_one_request() {
    let s = stack();
    let token = s.links.issue("u1", "topic");

    let clicks = (0..8).map(|_| s.click("topic", "u1", &token));
    for response in join_all(clicks).await {
        response.assert_status_ok();
    }

    assert_eq!(s.store.all().len(), 1);
}
