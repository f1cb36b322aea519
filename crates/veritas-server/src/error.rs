//! Errors raised while accepting a webhook delivery.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Why a delivery was rejected before any review started.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The `X-Hub-Signature-256` header is missing.
    #[error("missing signature header")]
    MissingSignature,

    /// The signature header is not `sha256=<hex>`.
    #[error("invalid signature format: {0}")]
    InvalidSignatureFormat(String),

    /// HMAC verification failed.
    #[error("invalid signature")]
    InvalidSignature,

    /// The `X-GitHub-Event` header is missing.
    #[error("missing event header")]
    MissingEvent,

    /// The body is not the JSON the event type promises.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl WebhookError {
    /// HTTP status returned for this error.
    ///
    /// - Missing/invalid signature: 401 Unauthorized
    /// - Missing event, bad payload: 400 Bad Request
    /// - Internal: 500 Internal Server Error
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingSignature | Self::InvalidSignature | Self::InvalidSignatureFormat(_) => {
                StatusCode::UNAUTHORIZED
            }
            Self::MissingEvent | Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self, "webhook delivery rejected");
        // Bodies stay generic so nothing about the secret or internals leaks.
        let body = match &self {
            Self::MissingSignature => "Missing signature",
            Self::InvalidSignatureFormat(_) => "Invalid signature format",
            Self::InvalidSignature => "Invalid signature",
            Self::MissingEvent => "Missing event type",
            Self::InvalidPayload(_) => "Invalid payload",
            Self::Internal(_) => "Internal server error",
        };
        (self.status_code(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(WebhookError::MissingSignature.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(WebhookError::InvalidSignature.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            WebhookError::InvalidSignatureFormat("no prefix".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(WebhookError::MissingEvent.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            WebhookError::InvalidPayload("eof".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            WebhookError::Internal("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn response_keeps_status() {
        let response = WebhookError::Internal("database password wrong".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
