//! Lock object handlers: the lock coordinator.
//!
//! Each unit is either unlocked or locked by one `LockInfo`. Acquisition is
//! a `PUT` of the lock object, release a `DELETE`, inspection `GET`/`HEAD`.
//! Mutual exclusion is the store's compare-and-set; this layer only maps
//! its outcomes to statuses.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use super::{resolve_lock_id, LockIdCandidates, RELEASE_LOCK_ID};
use crate::errors::ApiError;
use crate::metrics::record_state_op;
use crate::storage::backend::{LockInfo, StoreError};
use crate::AppState;

/// A lock request body. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct LockRequest {
    #[serde(rename = "ID", default)]
    pub id: Option<String>,
    #[serde(rename = "Operation", default)]
    pub operation: Option<String>,
    #[serde(rename = "Info", default)]
    pub info: Option<String>,
    #[serde(rename = "Who", default)]
    pub who: Option<String>,
    #[serde(rename = "Version", default)]
    pub version: Option<String>,
    #[serde(rename = "Created", default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(rename = "Path", default)]
    pub path: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl LockRequest {
    /// Parse a request body; an empty body is an empty request.
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body)
    }

    /// Fill in whatever the client left out.
    pub fn into_lock_info(self) -> LockInfo {
        LockInfo {
            id: non_empty(self.id).unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            operation: non_empty(self.operation),
            info: non_empty(self.info),
            who: non_empty(self.who).unwrap_or_else(|| "terraform".to_string()),
            version: non_empty(self.version).unwrap_or_else(|| "1.0.0".to_string()),
            created: self.created.unwrap_or_else(Utc::now),
            path: non_empty(self.path),
        }
    }
}

/// `PUT` lock: acquire.
///
/// Re-acquiring with the holder's own id succeeds and returns the existing
/// lock; a different holder gets 423 with the current `LockInfo`.
#[utoipa::path(
    put,
    path = "/s3/{bucket}/{unit}/terraform.tfstate.tflock",
    tag = "Lock",
    operation_id = "AcquireLock",
    params(
        ("bucket" = String, Path, description = "Bucket name (not validated)"),
        ("unit" = String, Path, description = "Unit id, may contain slashes"),
    ),
    request_body(content = String, content_type = "application/json", description = "LockInfo; missing fields are filled in"),
    responses(
        (status = 200, description = "Lock held; body is the LockInfo"),
        (status = 400, description = "Body is not a LockInfo"),
        (status = 404, description = "Unit was never created"),
        (status = 409, description = "Conflict with a holder that has since released"),
        (status = 423, description = "Held by someone else; body is their LockInfo"),
        (status = 500, description = "Storage failure")
    )
)]
pub async fn put_lock(state: Arc<AppState>, unit_id: &str, body: &[u8]) -> Result<Response, ApiError> {
    let request = LockRequest::parse(body)
        .map_err(|e| ApiError::bad_request("invalid_lock_info", e.to_string()))?;
    let requested = request.into_lock_info();

    match state.store.lock(unit_id, &requested).await {
        Ok(()) => {
            record_state_op("lock", "ok");
            info!(unit = unit_id, lock_id = %requested.id, who = %requested.who, "lock acquired");
            Ok((StatusCode::OK, Json(requested)).into_response())
        }
        Err(StoreError::NotFound) => {
            record_state_op("lock", "unit_not_found");
            Err(ApiError::UnitNotFound {
                unit_id: unit_id.to_string(),
            })
        }
        Err(StoreError::LockConflict) => {
            let current = state
                .store
                .get_lock(unit_id)
                .await
                .map_err(|e| ApiError::internal("lock_failed", e))?;
            match current {
                Some(holder) if holder.id == requested.id => {
                    record_state_op("lock", "reacquired");
                    debug!(unit = unit_id, lock_id = %holder.id, "lock re-acquired by holder");
                    Ok((StatusCode::OK, Json(holder)).into_response())
                }
                Some(holder) => {
                    record_state_op("lock", "held");
                    Err(ApiError::LockHeld { holder })
                }
                None => {
                    record_state_op("lock", "conflict");
                    Err(ApiError::AlreadyLocked)
                }
            }
        }
        Err(e) => Err(ApiError::internal("lock_failed", e)),
    }
}

async fn current_lock(state: &AppState, unit_id: &str) -> Result<LockInfo, ApiError> {
    match state.store.get_lock(unit_id).await {
        Ok(Some(info)) => Ok(info),
        Ok(None) | Err(StoreError::NotFound) => Err(ApiError::NotFound),
        Err(e) => Err(ApiError::internal("lock_read_failed", e)),
    }
}

/// `GET` lock: the current holder, or 404 when unlocked.
#[utoipa::path(
    get,
    path = "/s3/{bucket}/{unit}/terraform.tfstate.tflock",
    tag = "Lock",
    operation_id = "GetLock",
    params(
        ("bucket" = String, Path, description = "Bucket name (not validated)"),
        ("unit" = String, Path, description = "Unit id, may contain slashes"),
    ),
    responses(
        (status = 200, description = "Current LockInfo"),
        (status = 404, description = "Not locked")
    )
)]
pub async fn get_lock(state: Arc<AppState>, unit_id: &str) -> Result<Response, ApiError> {
    let info = current_lock(&state, unit_id).await?;
    Ok((StatusCode::OK, Json(info)).into_response())
}

#[utoipa::path(
    head,
    path = "/s3/{bucket}/{unit}/terraform.tfstate.tflock",
    tag = "Lock",
    operation_id = "HeadLock",
    params(
        ("bucket" = String, Path, description = "Bucket name (not validated)"),
        ("unit" = String, Path, description = "Unit id, may contain slashes"),
    ),
    responses(
        (status = 200, description = "Locked"),
        (status = 404, description = "Not locked")
    )
)]
pub async fn head_lock(state: Arc<AppState>, unit_id: &str) -> Result<Response, ApiError> {
    current_lock(&state, unit_id).await?;
    Ok(StatusCode::OK.into_response())
}

/// `DELETE` lock: release.
///
/// The id comes from the body, then the lock header, then the current
/// holder.
#[utoipa::path(
    delete,
    path = "/s3/{bucket}/{unit}/terraform.tfstate.tflock",
    tag = "Lock",
    operation_id = "ReleaseLock",
    params(
        ("bucket" = String, Path, description = "Bucket name (not validated)"),
        ("unit" = String, Path, description = "Unit id, may contain slashes"),
    ),
    responses(
        (status = 200, description = "Released"),
        (status = 400, description = "No lock id could be determined"),
        (status = 404, description = "Unit was never created"),
        (status = 409, description = "Lock id mismatch, or not locked"),
        (status = 500, description = "Storage failure")
    )
)]
pub async fn delete_lock(
    state: Arc<AppState>,
    unit_id: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ApiError> {
    let holder = match state.store.get_lock(unit_id).await {
        Ok(holder) => holder,
        Err(StoreError::NotFound) => {
            return Err(ApiError::UnitNotFound {
                unit_id: unit_id.to_string(),
            })
        }
        Err(e) => return Err(ApiError::internal("unlock_failed", e)),
    };
    // A body that is not a LockInfo simply offers no id.
    let body_id = LockRequest::parse(body).ok().and_then(|r| r.id);

    let lock_id = resolve_lock_id(
        RELEASE_LOCK_ID,
        &LockIdCandidates {
            headers: Some(headers),
            query: None,
            body_id: body_id.as_deref(),
            current_holder: holder.as_ref().map(|h| h.id.as_str()),
        },
    )
    .ok_or(ApiError::LockIdRequired)?;

    match state.store.unlock(unit_id, &lock_id).await {
        Ok(()) => {
            record_state_op("unlock", "ok");
            info!(unit = unit_id, lock_id = %lock_id, "lock released");
            Ok(StatusCode::OK.into_response())
        }
        Err(StoreError::NotFound) => Err(ApiError::UnitNotFound {
            unit_id: unit_id.to_string(),
        }),
        Err(StoreError::NotLocked) => {
            record_state_op("unlock", "not_locked");
            Err(ApiError::NotLocked)
        }
        Err(StoreError::LockConflict) => {
            record_state_op("unlock", "mismatch");
            Err(ApiError::LockIdMismatch)
        }
        Err(e) => Err(ApiError::internal("unlock_failed", e)),
    }
}
