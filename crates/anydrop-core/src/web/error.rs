//! HTTP error handling for the acceptor host.
//!
//! Core errors become JSON bodies of the form
//! `{"ok": false, "error": "...", "code": "E0xx"}` with a matching status.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::Error;

/// API error response body.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    /// HTTP status sent with the body
    #[serde(skip)]
    pub status: StatusCode,
    /// Always `false`
    pub ok: bool,
    /// Human-readable error message
    pub error: String,
    /// Stable error code, when the core error has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Additional details about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    /// Create an error with an explicit status.
    #[must_use]
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            ok: false,
            error: error.into(),
            code: None,
            details: None,
        }
    }

    /// Add details to the error.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// 400 Bad Request.
    #[must_use]
    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    /// 404 Not Found.
    #[must_use]
    pub fn not_found(error: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error)
    }

    /// 409 Conflict (operation already in progress).
    #[must_use]
    pub fn conflict(error: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, error)
    }

    /// 500 Internal Server Error.
    #[must_use]
    pub fn internal(error: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::UnknownTransfer(_) | Error::FileNotFound(_) => StatusCode::NOT_FOUND,
            Error::TransferActive(_) | Error::DuplicateTransfer(_) | Error::ConnectionBusy(_) => {
                StatusCode::CONFLICT
            }
            Error::InvalidState { .. }
            | Error::InvalidPath(_)
            | Error::ProtocolError(_)
            | Error::SizeMismatch { .. } => StatusCode::BAD_REQUEST,
            Error::TransferCancelled | Error::PeerError(_) | Error::ConnectionLost(_) => {
                StatusCode::GONE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        Self {
            code: err.code().map(String::from),
            ..Self::new(status, err.to_string())
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(format!("I/O error: {err}"))
    }
}

/// Result type for web handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferId;

    #[test]
    fn test_status_mapping() {
        let active: ApiError = Error::TransferActive("t1".into()).into();
        assert_eq!(active.status, StatusCode::CONFLICT);
        assert_eq!(active.code.as_deref(), Some("E006"));

        let unknown: ApiError = Error::UnknownTransfer(TransferId::from("t2").to_string()).into();
        assert_eq!(unknown.status, StatusCode::NOT_FOUND);

        let short: ApiError = Error::SizeMismatch {
            file: "a".into(),
            expected: 2,
            actual: 1,
        }
        .into();
        assert_eq!(short.status, StatusCode::BAD_REQUEST);

        let io: ApiError = Error::Io(std::io::Error::other("disk full")).into();
        assert_eq!(io.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_serialization() {
        let err = ApiError::conflict("upload already in progress");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"], "upload already in progress");
        assert!(json.get("status").is_none());
        assert!(json.get("details").is_none());

        let err = ApiError::bad_request("bad").with_details("missing transferId");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["details"], "missing transferId");
    }
}
