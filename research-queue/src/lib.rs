//! Durable queue for one-click research requests.
//!
//! This crate owns the asynchronous half of the research link flow:
//! - A persisted request table with an explicit state machine
//!   (`pending -> processing -> completed | failed`, with retries returning to `pending`)
//! - Atomic, skip-locked claiming so several worker processes can share one store
//! - A polling [`Worker`] that calls a [`ResearchProvider`], finalizes the row and hands
//!   the outcome to a [`Notifier`]
//! - A recovery sweep that returns abandoned claims to the queue
//!
//! # Example
//! ```ignore
//! use research_queue::{InMemoryRequestStore, RetryPolicy, Worker, WorkerConfig};
//!
//! let store = Arc::new(InMemoryRequestStore::new(RetryPolicy::default()));
//! let outcome = store.create_pending("u1", "supply-chain forecasting").await?;
//! assert!(outcome.created);
//!
//! let worker = Worker::new(store, Arc::new(MockProvider::new()), Arc::new(MockNotifier::new()), WorkerConfig::default());
//! worker.run(shutdown_token).await?;
//! ```

pub mod error;
pub mod notify;
pub mod provider;
pub mod request;
pub mod store;
pub mod worker;

pub use error::{QueueError, Result};
pub use notify::{DeliveryError, MockNotifier, Notification, Notifier};
pub use provider::{MockProvider, OpenAiConfig, OpenAiProvider, ProviderError, ResearchProvider};
pub use request::*;
pub use store::in_memory::InMemoryRequestStore;
#[cfg(feature = "postgres")]
pub use store::postgres::PostgresRequestStore;
pub use store::{CreateOutcome, ReclaimOutcome, RequestStore};
pub use worker::{CycleStats, Worker, WorkerConfig};

/// Embedded schema migrations for the PostgreSQL store.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
