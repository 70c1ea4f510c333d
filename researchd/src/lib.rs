//! # researchd: one-click deep research links
//!
//! `researchd` turns a clicked link into a durable research request and, some time later, an
//! e-mail with the finished report.
//!
//! ## Architecture
//!
//! - **Links** ([`links`]): HMAC-signed, time-bounded tokens binding a requester to a query.
//!   Links are issued out of band (`researchd issue-link`) and embedded in e-mails.
//! - **Ingestion** ([`api`]): `GET /research` verifies the token and records a pending request
//!   through a [`RequestStore`]. The click returns immediately with an acknowledgement page.
//! - **Worker** ([`research_queue::Worker`]): polls the store, claims pending requests, calls the
//!   research provider and hands the outcome to a notifier ([`email`]).
//!
//! The ingestion side and the worker can run in one process (`researchd all`, the default) or
//! separately (`researchd serve` / `researchd worker`) against a shared PostgreSQL database.
//!
//! ## Configuration
//!
//! See [`config`] for the YAML layout and environment overrides. A secret for link signing is
//! always required; `researchd generate-secret` prints one.

pub mod api;
pub mod config;
pub mod email;
pub mod errors;
pub mod links;
pub mod telemetry;
pub mod test_utils;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Context;
use axum::{Router, routing::get};
use bon::Builder;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use research_queue::{InMemoryRequestStore, OpenAiProvider, PostgresRequestStore, RequestStore, Worker};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info};

pub use config::Config;
use config::DatabaseConfig;
use links::TokenCodec;

/// Shared state for request handlers.
#[derive(Clone, Builder)]
pub struct AppState {
    pub store: Arc<dyn RequestStore>,
    pub links: Arc<TokenCodec>,
}

/// Which halves of the system this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Ingestion endpoint and worker
    All,
    /// Ingestion endpoint only
    Serve,
    /// Worker only
    Worker,
}

impl RunMode {
    pub fn serves_http(self) -> bool {
        matches!(self, RunMode::All | RunMode::Serve)
    }

    pub fn runs_worker(self) -> bool {
        matches!(self, RunMode::All | RunMode::Worker)
    }
}

static PROMETHEUS_HANDLE: OnceLock<Result<PrometheusHandle, String>> = OnceLock::new();

/// Install the global Prometheus recorder on first use and return its handle.
pub fn get_or_install_prometheus_handle() -> anyhow::Result<PrometheusHandle> {
    PROMETHEUS_HANDLE
        .get_or_init(|| PrometheusBuilder::new().install_recorder().map_err(|e| e.to_string()))
        .clone()
        .map_err(|e| anyhow::anyhow!("install Prometheus recorder: {e}"))
}

/// Build the HTTP router: `/research`, `/healthz` and, with a metrics handle, `/internal/metrics`.
pub fn build_router(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/research", get(api::handlers::research::ingest))
        .with_state(state);

    if let Some(handle) = metrics {
        router = router.route(
            "/internal/metrics",
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
    }

    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}

/// Build the link codec from `links` configuration.
pub fn link_codec(config: &Config) -> anyhow::Result<TokenCodec> {
    let secret = config
        .links
        .secret
        .as_deref()
        .context("links.secret is not configured")?;
    Ok(TokenCodec::new(secret, config.links.ttl))
}

/// Build a worker wired to the configured provider and notifier.
pub fn build_worker(config: &Config, store: Arc<dyn RequestStore>) -> anyhow::Result<Worker> {
    let openai = config
        .provider
        .openai_config()
        .context("provider.api_key is required to run the research worker (set OPENAI_API_KEY)")?;
    let notifier = email::build_notifier(&config.notifier)?;

    Ok(Worker::new(
        store,
        Arc::new(OpenAiProvider::new(openai)),
        notifier,
        config.worker.worker_config(&config.provider),
    ))
}

async fn setup_store(config: &Config) -> anyhow::Result<(Arc<dyn RequestStore>, Option<PgPool>)> {
    let retry = config.worker.retry_policy();

    match &config.database {
        DatabaseConfig::Memory => {
            info!("Using in-memory request store: requests are lost on restart");
            Ok((Arc::new(InMemoryRequestStore::new(retry)), None))
        }
        DatabaseConfig::Postgres { url, pool: settings } => {
            info!("Using PostgreSQL request store");
            let non_zero = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));

            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(settings.max_connections)
                .min_connections(settings.min_connections)
                .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
                .idle_timeout(non_zero(settings.idle_timeout_secs))
                .max_lifetime(non_zero(settings.max_lifetime_secs))
                .connect(url)
                .await
                .context("connect to PostgreSQL")?;
            research_queue::migrator().run(&pool).await?;

            Ok((Arc::new(PostgresRequestStore::new(pool.clone(), retry)), Some(pool)))
        }
    }
}

/// Background tasks running alongside (or instead of) the HTTP server.
///
/// Dropping the value cancels the shutdown token through `drop_guard`; [`shutdown`](Self::shutdown)
/// additionally waits for the tasks to finish.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: tokio_util::sync::CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<tokio_util::sync::DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();

        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

fn setup_background_services(
    config: &Config,
    mode: RunMode,
    store: Arc<dyn RequestStore>,
    shutdown_token: tokio_util::sync::CancellationToken,
) -> anyhow::Result<BackgroundServices> {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut background_tasks = Vec::new();

    if mode.runs_worker() {
        let worker = build_worker(config, store)?;
        let token = shutdown_token.clone();
        background_tasks.push(tokio::spawn(async move {
            if let Err(e) = worker.run(token).await {
                tracing::error!(error = %e, "Research worker stopped");
            }
        }));
        info!("Research worker started");
    }

    Ok(BackgroundServices {
        background_tasks,
        shutdown_token,
        drop_guard: Some(drop_guard),
    })
}

/// Owns every resource of a running process: router, store, pool and background worker.
pub struct Application {
    router: Router,
    config: Config,
    mode: RunMode,
    pool: Option<PgPool>,
    bg_services: BackgroundServices,
}

impl Application {
    /// Connect the store, run migrations and start the background worker if `mode` asks for it.
    pub async fn new(config: Config, mode: RunMode) -> anyhow::Result<Self> {
        debug!("Starting researchd ({mode:?}) with configuration: {:#?}", config);

        if matches!(config.database, DatabaseConfig::Memory) && mode != RunMode::All {
            anyhow::bail!(
                "the in-memory request store cannot be shared between processes; \
                 configure a postgres database to run `serve` and `worker` separately"
            );
        }

        let links = Arc::new(link_codec(&config)?);
        let (store, pool) = setup_store(&config).await?;

        let shutdown_token = tokio_util::sync::CancellationToken::new();
        let bg_services = setup_background_services(&config, mode, store.clone(), shutdown_token)?;

        let metrics = if config.enable_metrics {
            Some(get_or_install_prometheus_handle()?)
        } else {
            None
        };

        let state = AppState::builder().store(store).links(links).build();
        let router = build_router(state, metrics);

        Ok(Self {
            router,
            config,
            mode,
            pool,
            bg_services,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Serve until `shutdown` resolves, then stop the worker and release resources.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.mode.serves_http() {
            let bind_addr = self.config.bind_address();
            let listener = TcpListener::bind(&bind_addr).await?;
            info!("Research links accepted on http://{}", bind_addr);

            axum::serve(listener, self.router.into_make_service())
                .with_graceful_shutdown(shutdown)
                .await?;
        } else {
            shutdown.await;
        }

        info!("Stopping background services...");
        self.bg_services.shutdown().await;

        if let Some(pool) = self.pool {
            info!("Closing database connections...");
            pool.close().await;
        }

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::create_test_config;

    #[tokio::test]
    async fn test_application_serves_health_and_research() {
        let config = create_test_config();
        let codec = link_codec(&config).unwrap();

        let app = Application::new(config, RunMode::All).await.unwrap();
        let (server, bg_services) = app.into_test_server();

        let health = server.get("/healthz").await;
        health.assert_status_ok();
        assert_eq!(health.text(), "OK");

        let token = codec.issue("u1", "topic");
        server
            .get("/research")
            .add_query_param("q", "topic")
            .add_query_param("uid", "u1")
            .add_query_param("tk", &token)
            .await
            .assert_status_ok();

        bg_services.shutdown().await;
    }

    #[tokio::test]
    async fn test_memory_store_requires_all_mode() {
        for mode in [RunMode::Serve, RunMode::Worker] {
            let err = Application::new(create_test_config(), mode).await.err().unwrap();
            assert!(err.to_string().contains("in-memory"));
        }
    }

    #[tokio::test]
    async fn test_worker_requires_provider_key() {
        let mut config = create_test_config();
        config.provider.api_key = None;

        let err = Application::new(config, RunMode::All).await.err().unwrap();
        assert!(err.to_string().contains("provider.api_key"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_disabled_by_default() {
        let app = Application::new(create_test_config(), RunMode::All).await.unwrap();
        let (server, bg_services) = app.into_test_server();

        server.get("/internal/metrics").await.assert_status_not_found();

        bg_services.shutdown().await;
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders_counters() {
        let mut config = create_test_config();
        config.enable_metrics = true;

        let app = Application::new(config, RunMode::All).await.unwrap();
        let (server, bg_services) = app.into_test_server();

        server
            .get("/research")
            .add_query_param("q", "topic")
            .await
            .assert_status_bad_request();

        let metrics = server.get("/internal/metrics").await;
        metrics.assert_status_ok();
        assert!(metrics.text().contains("research_links_rejected_total"));

        bg_services.shutdown().await;
    }
}
