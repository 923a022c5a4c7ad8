//! HTTP error responses
//!
//! Every failure renders as `{"message": ..., "code": ...}` where `code` is
//! the canonical [`ErrorKind`] code, so the proxy client can rebuild the
//! original failure kind.

use crate::error::{ErrorKind, StoreError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};

/// Error body returned by every route
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpError {
    /// Failure detail, without the kind prefix
    pub message: String,
    /// Canonical error code
    pub code: String,
}

impl HttpError {
    pub fn new(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
        }
    }

    /// Request body that does not decode
    pub fn malformed_body(what: &str, err: impl std::fmt::Display) -> Self {
        Self::new(
            format!("{} body: {}", what, err),
            ErrorKind::Deserialize.code(),
        )
    }

    fn status(&self) -> StatusCode {
        match self.code.as_str() {
            "BAD_PARAMETER" | "DESERIALIZE" => StatusCode::BAD_REQUEST,
            "NAMESPACE_NOT_FOUND" | "NOT_FOUND" => StatusCode::NOT_FOUND,
            "ALREADY_EXISTS" => StatusCode::CONFLICT,
            "STALE_OBJECT" => StatusCode::PRECONDITION_FAILED,
            "NOT_IMPLEMENTED" => StatusCode::NOT_IMPLEMENTED,
            "TRANSPORT" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(code = %self.code, message = %self.message, "request failed");
        }
        (status, Json(self)).into_response()
    }
}

impl From<StoreError> for HttpError {
    fn from(err: StoreError) -> Self {
        HttpError::new(err.detail(), err.kind().code())
    }
}
