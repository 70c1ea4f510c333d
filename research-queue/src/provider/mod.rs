//! Research provider abstraction.
//!
//! The [`ResearchProvider`] trait hides the language-model call that turns a query into a
//! research report, so the worker can be exercised without network access.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

pub mod openai;

pub use openai::{OpenAiConfig, OpenAiProvider};

/// Failure returned by a research provider.
///
/// The variant decides what the worker does next: transient failures are retried within the
/// retry budget, permanent ones fail the request immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("transient provider failure: {0}")]
    Transient(String),

    #[error("permanent provider failure: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, ProviderError::Permanent(_))
    }
}

/// Produces research content for a query.
#[async_trait]
pub trait ResearchProvider: Send + Sync {
    async fn research(&self, query: &str) -> Result<String, ProviderError>;
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Mock provider for testing.
///
/// Returns queued responses in FIFO order, falling back to an echo of the query once the
/// queue is empty. Every call is recorded.
///
/// # Example
/// ```ignore
/// let provider = MockProvider::new();
/// provider.push_response(Err(ProviderError::Transient("upstream 503".into())));
/// provider.push_response(Ok("report".into()));
/// ```
#[derive(Clone, Default)]
pub struct MockProvider {
    responses: Arc<Mutex<VecDeque<Result<String, ProviderError>>>>,
    calls: Arc<Mutex<Vec<String>>>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next unanswered call.
    pub fn push_response(&self, response: Result<String, ProviderError>) {
        self.responses.lock().push_back(response);
    }

    /// Fail the next `times` calls with a transient error.
    pub fn fail_times(&self, times: usize) {
        let mut responses = self.responses.lock();
        for i in 0..times {
            responses.push_back(Err(ProviderError::Transient(format!("upstream unavailable ({})", i + 1))));
        }
    }

    /// Sleep this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Queries this provider has been called with.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ResearchProvider for MockProvider {
    async fn research(&self, query: &str) -> Result<String, ProviderError> {
        self.calls.lock().push(query.to_string());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.responses.lock().pop_front();
        next.unwrap_or_else(|| Ok(format!("Research report on \"{query}\"")))
    }
}
