use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use relay_core::cursor::CursorError;
use relay_core::ids::SessionIdError;
use relay_core::ErrorDescriptor;
use relay_engine::EngineError;

/// Errors returned by HTTP handlers before (or instead of) a stream.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// The generation engine failed on a non-streaming request.
    #[error("{}", .0.message)]
    Upstream(ErrorDescriptor),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Serialize)]
struct ErrorDetail<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "invalid_request_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Upstream(_) => "upstream_error",
            Self::Timeout(_) => "timeout",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "request failed");
        }
        let code = match &self {
            Self::Upstream(descriptor) => Some(descriptor.kind.as_str()),
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.error_type(),
                message: self.to_string(),
                code,
            },
        };
        (status, Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            e if e.is_client_error() => Self::BadRequest(e.to_string()),
            EngineError::SessionNotFound(_) => Self::NotFound(e.to_string()),
            EngineError::AlreadyTerminal { .. }
            | EngineError::SessionSealed(_)
            | EngineError::ProducerAlreadyStarted(_) => Self::Conflict(e.to_string()),
            EngineError::ShuttingDown => Self::Unavailable(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<CursorError> for ApiError {
    fn from(e: CursorError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl From<SessionIdError> for ApiError {
    fn from(e: SessionIdError) -> Self {
        Self::BadRequest(format!("invalid session id: {e}"))
    }
}
