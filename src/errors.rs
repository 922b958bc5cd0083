//! HTTP-facing error type.
//!
//! Every variant maps to a status code and a stable error code. The enum
//! implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(ApiError::LockIdRequired)`.
//!
//! Bodies are JSON `{"error": "<code>"}` with three exceptions: lock
//! conflicts return the current holder's `LockInfo`, the never-created-unit
//! 404 adds a `message`, and bare 404/405 responses have no body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::storage::backend::LockInfo;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Command operators run to provision a unit.
pub const PROVISION_COMMAND: &str = "statebridge-admin unit create";

#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing, malformed, or unverifiable credentials.
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// A bearer token presented to the credential exchange was missing or bad.
    #[error("{code}: {reason}")]
    BearerRejected { code: &'static str, reason: String },

    /// The request was well-formed but its signature does not match.
    #[error("The request signature we calculated does not match the signature you provided.")]
    SignatureMismatch,

    /// Plain 404 with no body.
    #[error("not found")]
    NotFound,

    /// The path names neither a state object nor a lock object.
    #[error("unknown object")]
    UnknownObject,

    /// The path is well-shaped but names an invalid unit.
    #[error("invalid path: {reason}")]
    InvalidPath { reason: String },

    /// The unit was never provisioned.
    #[error("Unit '{unit_id}' not found. Create it first with '{cmd} {unit_id}'.", cmd = PROVISION_COMMAND)]
    UnitNotFound { unit_id: String },

    /// A state write was refused because someone else holds the lock.
    #[error("state is locked")]
    StateLocked { holder: Option<LockInfo> },

    /// A lock request lost to a different holder.
    #[error("lock is held by {}", .holder.who)]
    LockHeld { holder: LockInfo },

    /// Lock acquisition conflicted but the holder has since gone.
    #[error("lock already held")]
    AlreadyLocked,

    /// Release named a lock id other than the holder's.
    #[error("lock id does not match the current holder")]
    LockIdMismatch,

    /// Release on a unit nobody holds.
    #[error("unit is not locked")]
    NotLocked,

    /// Release could not determine which lock to release.
    #[error("a lock id is required")]
    LockIdRequired,

    /// Malformed request (unreadable body, bad Content-MD5, ...).
    #[error("{message}")]
    BadRequest { code: &'static str, message: String },

    /// HTTP method not allowed for this resource.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// Storage or other internal failure; `code` names the failed step.
    #[error("{code}: {source}")]
    Internal {
        code: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl ApiError {
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        ApiError::Unauthorized {
            reason: reason.into(),
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        ApiError::BadRequest {
            code,
            message: message.into(),
        }
    }

    pub fn internal(code: &'static str, source: impl Into<anyhow::Error>) -> Self {
        ApiError::Internal {
            code,
            source: source.into(),
        }
    }

    /// Stable error code reported in the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized { .. } => "unauthorized",
            ApiError::BearerRejected { code, .. } => *code,
            ApiError::SignatureMismatch => "signature_mismatch",
            ApiError::NotFound => "not_found",
            ApiError::UnknownObject => "unknown_object",
            ApiError::InvalidPath { .. } => "invalid_path",
            ApiError::UnitNotFound { .. } => "unit_not_found",
            ApiError::StateLocked { .. } => "locked",
            ApiError::LockHeld { .. } => "locked",
            ApiError::AlreadyLocked => "already_locked",
            ApiError::LockIdMismatch => "lock_id_mismatch",
            ApiError::NotLocked => "not_locked",
            ApiError::LockIdRequired => "lock_id_required",
            ApiError::BadRequest { code, .. } => *code,
            ApiError::MethodNotAllowed => "method_not_allowed",
            ApiError::Internal { code, .. } => *code,
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            ApiError::BearerRejected { .. } => StatusCode::UNAUTHORIZED,
            ApiError::SignatureMismatch => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::UnknownObject => StatusCode::NOT_FOUND,
            ApiError::InvalidPath { .. } => StatusCode::BAD_REQUEST,
            ApiError::UnitNotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::StateLocked { .. } => StatusCode::CONFLICT,
            ApiError::LockHeld { .. } => StatusCode::LOCKED,
            ApiError::AlreadyLocked => StatusCode::CONFLICT,
            ApiError::LockIdMismatch => StatusCode::CONFLICT,
            ApiError::NotLocked => StatusCode::CONFLICT,
            ApiError::LockIdRequired => StatusCode::BAD_REQUEST,
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            ApiError::NotFound | ApiError::MethodNotAllowed => status.into_response(),
            ApiError::StateLocked {
                holder: Some(holder),
            }
            | ApiError::LockHeld { holder } => (status, Json(holder)).into_response(),
            ApiError::UnitNotFound { .. } => (
                status,
                Json(json!({ "error": self.code(), "message": self.to_string() })),
            )
                .into_response(),
            ApiError::Internal { code, ref source } => {
                error!(code, error = %source, "request failed");
                (status, Json(json!({ "error": code }))).into_response()
            }
            _ => (status, Json(json!({ "error": self.code() }))).into_response(),
        }
    }
}
