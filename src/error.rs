//! Error type shared by every core operation.
//!
//! Each variant maps to one HTTP status and to the uniform error envelope
//! `{statusCode, message, success: false, errors: []}`.

use std::fmt;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

#[derive(Debug)]
pub enum CoreError {
    /// Missing or empty required field, malformed id, unknown sort key.
    InvalidArgument(String),
    NotFound(String),
    /// The actor does not own the resource being mutated.
    Forbidden(String),
    /// A uniqueness constraint in the store rejected the write.
    Conflict(String),
    /// No viewer identity where one is required. Raised by the transport only.
    Unauthorized(String),
    /// The store or the blob storage failed.
    UpstreamFailure(String),
    /// A pipeline stage was rejected while executing a view query.
    Query(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamFailure(message.into())
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::Query(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            CoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CoreError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            CoreError::Query(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            CoreError::InvalidArgument(msg)
            | CoreError::NotFound(msg)
            | CoreError::Forbidden(msg)
            | CoreError::Conflict(msg)
            | CoreError::Unauthorized(msg)
            | CoreError::UpstreamFailure(msg)
            | CoreError::Query(msg) => msg,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            CoreError::NotFound(msg) => write!(f, "Not found: {}", msg),
            CoreError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            CoreError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            CoreError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            CoreError::UpstreamFailure(msg) => write!(f, "Upstream failure: {}", msg),
            CoreError::Query(msg) => write!(f, "Query error: {}", msg),
        }
    }
}

impl std::error::Error for CoreError {}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            CoreError::UpstreamFailure(_) | CoreError::Query(_) => {
                tracing::error!("request failed: {}", self);
            }
            CoreError::Forbidden(_) | CoreError::Unauthorized(_) | CoreError::Conflict(_) => {
                tracing::warn!("request rejected: {}", self);
            }
            CoreError::InvalidArgument(_) | CoreError::NotFound(_) => {
                tracing::debug!("request rejected: {}", self);
            }
        }

        let body = Json(json!({
            "statusCode": status.as_u16(),
            "message": self.message(),
            "success": false,
            "errors": [],
        }));

        (status, body).into_response()
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                CoreError::Conflict(format!("record already exists: {err}"))
            }
            _ => CoreError::UpstreamFailure(format!("store operation failed: {err}")),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Query(format!("view document has an unexpected shape: {err}"))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::UpstreamFailure(format!("i/o failure: {err}"))
    }
}
