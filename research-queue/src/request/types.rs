//! Core types for research requests.

use std::fmt;
use std::ops::Deref;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a research request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type), sqlx(transparent))]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl Deref for RequestId {
    type Target = Uuid;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a research request.
///
/// `pending` and `processing` are the non-terminal states; at most one row per
/// `(requester, query)` may be in either of them at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(
    feature = "postgres",
    derive(sqlx::Type),
    sqlx(type_name = "research_status", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted research request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct ResearchRequest {
    pub id: RequestId,
    pub query: String,
    pub requester: String,
    pub status: RequestStatus,
    /// Incremented every time a worker claims the row.
    pub attempt_count: i32,
    pub result: Option<String>,
    /// Last failure message. Kept when a retriable failure sends the row back to `pending`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Non-null iff `status == processing`.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Earliest time a retried row may be claimed again.
    pub not_before: Option<DateTime<Utc>>,
    pub notified_at: Option<DateTime<Utc>>,
    pub notify_attempts: i32,
    pub notify_error: Option<String>,
    /// Delivery lease held by the worker sending the outcome notification.
    pub notify_claimed_at: Option<DateTime<Utc>>,
}

impl ResearchRequest {
    /// Build a fresh `pending` row.
    pub fn new_pending(requester: impl Into<String>, query: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: RequestId::new(),
            query: query.into(),
            requester: requester.into(),
            status: RequestStatus::Pending,
            attempt_count: 0,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            not_before: None,
            notified_at: None,
            notify_attempts: 0,
            notify_error: None,
            notify_claimed_at: None,
        }
    }
}
