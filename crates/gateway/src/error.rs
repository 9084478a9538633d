//! HTTP error rendering.
//!
//! Every failure leaves the gateway as
//! `{"error": {"code", "message", "type", "param"}}`, the shape OpenAI client
//! SDKs already parse.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use streamweave_agent::ErrorKind;
use streamweave_core::error::{BufferError, Error};

/// Body of an error object, shared by HTTP responses and mid-stream SSE events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
}

impl ErrorBody {
    pub fn of(kind: ErrorKind, message: impl Into<String>) -> Self {
        let (_, code, category) = classify(kind);
        Self {
            code: code.into(),
            message: message.into(),
            kind: category.into(),
            param: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

/// A failed request: status code plus error object.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: classify(kind).0,
            body: ErrorBody::of(kind, message),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn stream_not_found() -> Self {
        Self::new(ErrorKind::NotFound, "Stream not found or expired")
    }

    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: ErrorBody {
                code: "invalid_api_key".into(),
                message: "Missing or invalid API key".into(),
                kind: "authentication_error".into(),
                param: None,
            },
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.body.param = Some(param.into());
        self
    }
}

/// Status, error code and error type for each error class.
fn classify(kind: ErrorKind) -> (StatusCode, &'static str, &'static str) {
    match kind {
        ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found", "invalid_request_error"),
        ErrorKind::Validation => (StatusCode::BAD_REQUEST, "invalid_request", "invalid_request_error"),
        ErrorKind::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_exceeded", "provider_error"),
        ErrorKind::Timeout => (StatusCode::GATEWAY_TIMEOUT, "timeout", "provider_error"),
        ErrorKind::Provider => (StatusCode::BAD_GATEWAY, "provider_error", "provider_error"),
        ErrorKind::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "buffer_unavailable", "server_error"),
        ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "server_error"),
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self::new(ErrorKind::of(&error), error.to_string())
    }
}

impl From<BufferError> for ApiError {
    fn from(error: BufferError) -> Self {
        Self::from(Error::Buffer(error))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::validation(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorEnvelope { error: self.body })).into_response()
    }
}
