use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use research_queue::QueueError;
use serde_json::json;
use thiserror::Error as ThisError;

use crate::links::TokenError;

/// Why a research link was refused. Both kinds surface as `invalid_link` to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRejection {
    Expired,
    Invalid,
}

impl LinkRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkRejection::Expired => "expired",
            LinkRejection::Invalid => "invalid",
        }
    }
}

#[derive(ThisError, Debug)]
pub enum Error {
    /// Link token missing, forged, altered, mismatched or expired
    #[error("Invalid research link ({})", reason.as_str())]
    InvalidLink { reason: LinkRejection },

    /// Invalid request data
    #[error("{message}")]
    BadRequest { message: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Request store error
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<TokenError> for LinkRejection {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => LinkRejection::Expired,
            TokenError::Malformed | TokenError::BadSignature => LinkRejection::Invalid,
        }
    }
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidLink { .. } | Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::Queue(QueueError::NotFound(_)) => StatusCode::NOT_FOUND,
            Error::Internal { .. } | Error::Queue(_) | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::InvalidLink {
                reason: LinkRejection::Expired,
            } => "This research link has expired. Please request a new one.".to_string(),
            Error::InvalidLink {
                reason: LinkRejection::Invalid,
            } => "This research link is invalid.".to_string(),
            Error::BadRequest { message } => message.clone(),
            Error::Queue(QueueError::NotFound(_)) => "Request not found".to_string(),
            Error::Internal { .. } | Error::Queue(_) | Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Internal { .. } | Error::Queue(_) | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::InvalidLink { .. } | Error::BadRequest { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();

        match &self {
            Error::InvalidLink { reason } => {
                let body = json!({
                    "error": "invalid_link",
                    "reason": reason.as_str(),
                    "message": self.user_message(),
                });
                (status, Json(body)).into_response()
            }
            _ => (status, self.user_message()).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_errors_map_to_link_rejections() {
        assert_eq!(LinkRejection::from(TokenError::Expired), LinkRejection::Expired);
        assert_eq!(LinkRejection::from(TokenError::BadSignature), LinkRejection::Invalid);
        assert_eq!(LinkRejection::from(TokenError::Malformed), LinkRejection::Invalid);
    }

    #[test]
    fn test_internal_errors_do_not_leak_details() {
        let err = Error::Other(anyhow::anyhow!("connection to 10.0.0.5 refused"));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.user_message(), "Internal server error");
    }
}
