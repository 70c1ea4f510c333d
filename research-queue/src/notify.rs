//! Outbound notification of research outcomes.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::request::{RequestStatus, ResearchRequest};

/// A notification failed to reach the requester. Never reverts a request's status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("notification delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// A rendered message addressed to a requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub html: String,
}

impl Notification {
    /// Message carrying a finished research report.
    pub fn research_ready(request: &ResearchRequest, report: &str) -> Self {
        Self {
            to: request.requester.clone(),
            subject: format!("Your deep research on \"{}\" is ready", request.query),
            html: to_html(report),
        }
    }

    /// Message telling the requester their research could not be produced.
    pub fn research_failed(request: &ResearchRequest, error: &str) -> Self {
        let body = format!(
            "We were unable to complete your deep research on \"{}\".\n\nReason: {}\n\nYou can request it again from the original link.",
            request.query, error
        );
        Self {
            to: request.requester.clone(),
            subject: format!("Your deep research on \"{}\" could not be completed", request.query),
            html: to_html(&body),
        }
    }

    /// Outcome message for a terminal request, `None` while it is still in flight.
    pub fn for_request(request: &ResearchRequest) -> Option<Self> {
        match request.status {
            RequestStatus::Completed => Some(Self::research_ready(request, request.result.as_deref().unwrap_or(""))),
            RequestStatus::Failed => Some(Self::research_failed(
                request,
                request.error.as_deref().unwrap_or("unknown error"),
            )),
            RequestStatus::Pending | RequestStatus::Processing => None,
        }
    }
}

/// Escape text for inclusion in HTML.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

fn to_html(text: &str) -> String {
    escape_html(text).replace("\r\n", "\n").replace('\n', "<br>")
}

/// Delivers notifications to requesters.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError>;
}

/// Mock notifier for testing. Records every successful send; queued failures are returned
/// first.
#[derive(Clone, Default)]
pub struct MockNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
    failures: Arc<Mutex<VecDeque<DeliveryError>>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next send with `error`.
    pub fn push_failure(&self, error: impl Into<String>) {
        self.failures.lock().push_back(DeliveryError(error.into()));
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError> {
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        self.sent.lock().push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_ready_notification_renders_report_as_html() {
        let mut request = ResearchRequest::new_pending("u1@example.com", "supply-chain forecasting", Utc::now());
        request.status = RequestStatus::Completed;
        request.result = Some("1) Summary\n2) <Insights> & more".to_string());

        let notification = Notification::for_request(&request).unwrap();

        assert_eq!(notification.to, "u1@example.com");
        assert_eq!(
            notification.subject,
            "Your deep research on \"supply-chain forecasting\" is ready"
        );
        assert_eq!(notification.html, "1) Summary<br>2) &lt;Insights&gt; &amp; more");
    }

    #[test]
    fn test_failed_notification_mentions_reason() {
        let mut request = ResearchRequest::new_pending("u1", "topic", Utc::now());
        request.status = RequestStatus::Failed;
        request.error = Some("provider returned 400".to_string());

        let notification = Notification::for_request(&request).unwrap();
        assert!(notification.subject.contains("could not be completed"));
        assert!(notification.html.contains("Reason: provider returned 400"));
    }

    #[test]
    fn test_no_notification_for_live_requests() {
        let request = ResearchRequest::new_pending("u1", "topic", Utc::now());
        assert!(Notification::for_request(&request).is_none());
    }
}
