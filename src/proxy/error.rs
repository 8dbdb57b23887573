//! Error types and response handling for the proxy server.
//!
//! Provides structured error classification, HTTP status code mapping,
//! and JSON error response generation.

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::Response;
use thiserror::Error;

use crate::gate::GateError;
use crate::generation::GenerationId;
use crate::swap::SwapError;

/// Errors that can occur during proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The request could not be bound to a generation
    #[error(transparent)]
    Gate(#[from] GateError),

    /// A manually requested swap failed
    #[error(transparent)]
    Swap(#[from] SwapError),

    /// Failed to connect to the bound generation
    #[error("Connection failed to generation {generation}: {source}")]
    ConnectionError {
        generation: GenerationId,
        #[source]
        source: reqwest::Error,
    },

    /// Backend did not start answering in time
    #[error("Request timeout after {duration}s")]
    RequestTimeout { duration: u64 },

    /// Invalid request format or parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// HTTP error from request building
    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<axum::http::Error> for ProxyError {
    fn from(err: axum::http::Error) -> Self {
        ProxyError::Http(err.to_string())
    }
}

impl ProxyError {
    /// Map error variant to appropriate HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Gate(GateError::NoActiveGeneration) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Gate(GateError::ArtifactMissing(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Swap(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::ConnectionError { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::RequestTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get error type string for JSON responses
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::Gate(GateError::NoActiveGeneration) => "no_active_generation",
            ProxyError::Gate(GateError::ArtifactMissing(_)) => "artifact_missing",
            ProxyError::Swap(_) => "swap_failed",
            ProxyError::ConnectionError { .. } => "connection_error",
            ProxyError::RequestTimeout { .. } => "request_timeout",
            ProxyError::InvalidRequest(_) => "invalid_request",
            ProxyError::Http(_) => "http_error",
        }
    }
}

/// Builder for standardized error responses
pub struct ErrorResponse;

impl ErrorResponse {
    /// Create a JSON error response from a ProxyError
    pub fn from_error(err: &ProxyError, request_id: &str) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": err.error_type(),
                "message": err.to_string(),
                "request_id": request_id
            }
        });

        let mut response = Response::new(Body::from(body.to_string()));
        *response.status_mut() = err.status_code();
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_active_generation_status_code() {
        let err = ProxyError::from(GateError::NoActiveGeneration);
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.error_type(), "no_active_generation");
    }

    #[test]
    fn test_request_timeout_status_code() {
        let err = ProxyError::RequestTimeout { duration: 30 };
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.error_type(), "request_timeout");
    }

    #[test]
    fn test_swap_error_status_code() {
        let err = ProxyError::from(SwapError::Provision {
            generation: GenerationId(2),
            reason: "boom".to_string(),
        });
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.to_string().contains("#2"));
    }

    #[test]
    fn test_error_response_format() {
        let err = ProxyError::from(GateError::NoActiveGeneration);
        let response = ErrorResponse::from_error(&err, "test-id-123");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }
}
