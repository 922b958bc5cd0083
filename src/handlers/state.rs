//! State object handlers: `GET`, `HEAD` and `PUT` on
//! `/s3/{bucket}/{unit}/terraform.tfstate`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use bytes::Bytes;
use md5::{Digest, Md5};
use tracing::{debug, info};

use super::{resolve_lock_id, LockIdCandidates, STATE_WRITE_LOCK_ID};
use crate::errors::ApiError;
use crate::metrics::{record_state_op, STATE_BYTES_WRITTEN_TOTAL};
use crate::storage::backend::{StoreError, UnitMetadata};
use crate::AppState;

/// Validate the `Content-MD5` header against `body`, if present.
fn validate_content_md5(headers: &HeaderMap, body: &[u8]) -> Result<(), ApiError> {
    let Some(md5_header) = headers.get("content-md5") else {
        return Ok(());
    };
    let decoded = md5_header
        .to_str()
        .ok()
        .and_then(|v| base64::engine::general_purpose::STANDARD.decode(v.trim()).ok())
        .filter(|d| d.len() == 16)
        .ok_or_else(|| ApiError::bad_request("invalid_digest", "Content-MD5 is not a valid digest"))?;

    if Md5::digest(body).as_slice() != decoded.as_slice() {
        return Err(ApiError::bad_request(
            "bad_digest",
            "Content-MD5 does not match the body",
        ));
    }
    Ok(())
}

fn etag(body: &[u8]) -> String {
    format!("\"{}\"", hex::encode(Md5::digest(body)))
}

/// Metadata of a unit that has non-empty state; anything else is a 404.
async fn readable_metadata(state: &AppState, unit_id: &str) -> Result<UnitMetadata, ApiError> {
    match state.store.get(unit_id).await {
        Ok(meta) if meta.size > 0 => Ok(meta),
        Ok(_) | Err(StoreError::NotFound) => Err(ApiError::NotFound),
        Err(e) => Err(ApiError::internal("read_failed", e)),
    }
}

fn state_headers(meta: &UnitMetadata, content_length: u64) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));
    let last_modified = httpdate::fmt_http_date(SystemTime::from(meta.updated));
    headers.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_str(&last_modified)
            .map_err(|e| ApiError::internal("read_failed", e))?,
    );
    Ok(headers)
}

/// `GET` state. Absent or zero-length state is a 404 so the client starts
/// from a fresh state.
#[utoipa::path(
    get,
    path = "/s3/{bucket}/{unit}/terraform.tfstate",
    tag = "State",
    operation_id = "GetState",
    params(
        ("bucket" = String, Path, description = "Bucket name (not validated)"),
        ("unit" = String, Path, description = "Unit id, may contain slashes"),
    ),
    responses(
        (status = 200, description = "Current state document", content_type = "application/json"),
        (status = 404, description = "No state stored yet"),
        (status = 500, description = "Storage failure")
    )
)]
pub async fn get_state(state: Arc<AppState>, unit_id: &str) -> Result<Response, ApiError> {
    let meta = readable_metadata(&state, unit_id).await?;
    let data = match state.store.download(unit_id).await {
        Ok(data) if !data.is_empty() => data,
        Ok(_) | Err(StoreError::NotFound) => return Err(ApiError::NotFound),
        Err(e) => return Err(ApiError::internal("download_failed", e)),
    };
    record_state_op("get_state", "ok");

    let mut headers = state_headers(&meta, data.len() as u64)?;
    headers.insert(
        header::ETAG,
        HeaderValue::from_str(&etag(&data)).map_err(|e| ApiError::internal("download_failed", e))?,
    );
    Ok((StatusCode::OK, headers, data).into_response())
}

/// `HEAD` state: size and type of the stored document, no body.
#[utoipa::path(
    head,
    path = "/s3/{bucket}/{unit}/terraform.tfstate",
    tag = "State",
    operation_id = "HeadState",
    params(
        ("bucket" = String, Path, description = "Bucket name (not validated)"),
        ("unit" = String, Path, description = "Unit id, may contain slashes"),
    ),
    responses(
        (status = 200, description = "State exists"),
        (status = 404, description = "No state stored yet")
    )
)]
pub async fn head_state(state: Arc<AppState>, unit_id: &str) -> Result<Response, ApiError> {
    let meta = readable_metadata(&state, unit_id).await?;
    let headers = state_headers(&meta, meta.size)?;
    Ok((StatusCode::OK, headers).into_response())
}

/// `PUT` state.
///
/// The unit must have been provisioned. The lock id is taken from the
/// request when present, else from the current holder; the store decides
/// whether the write conflicts. A successful write schedules a
/// dependency-graph refresh.
#[utoipa::path(
    put,
    path = "/s3/{bucket}/{unit}/terraform.tfstate",
    tag = "State",
    operation_id = "PutState",
    params(
        ("bucket" = String, Path, description = "Bucket name (not validated)"),
        ("unit" = String, Path, description = "Unit id, may contain slashes"),
        ("ID" = Option<String>, Query, description = "Lock id held by the writer"),
    ),
    request_body(content = String, content_type = "application/json", description = "Terraform state document"),
    responses(
        (status = 200, description = "State stored"),
        (status = 400, description = "Bad Content-MD5"),
        (status = 404, description = "Unit was never created"),
        (status = 409, description = "Unit is locked by someone else; body is the holder's LockInfo"),
        (status = 500, description = "Storage failure")
    )
)]
pub async fn put_state(
    state: Arc<AppState>,
    unit_id: &str,
    headers: &HeaderMap,
    query: &BTreeMap<String, String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    validate_content_md5(headers, &body)?;

    let meta = match state.store.get(unit_id).await {
        Ok(meta) => meta,
        Err(StoreError::NotFound) => {
            record_state_op("put_state", "unit_not_found");
            return Err(ApiError::UnitNotFound {
                unit_id: unit_id.to_string(),
            });
        }
        Err(e) => return Err(ApiError::internal("check_failed", e)),
    };

    let lock_id = resolve_lock_id(
        STATE_WRITE_LOCK_ID,
        &LockIdCandidates {
            headers: Some(headers),
            query: Some(query),
            body_id: None,
            current_holder: meta.lock_info.as_ref().map(|l| l.id.as_str()),
        },
    );

    let size = body.len();
    match state
        .store
        .upload(unit_id, body.clone(), lock_id.as_deref())
        .await
    {
        Ok(()) => {}
        Err(StoreError::NotFound) => {
            return Err(ApiError::UnitNotFound {
                unit_id: unit_id.to_string(),
            })
        }
        Err(StoreError::LockConflict) => {
            record_state_op("put_state", "locked");
            let holder = state.store.get_lock(unit_id).await.ok().flatten();
            debug!(unit = unit_id, lock_id = ?lock_id, "state write refused by lock");
            return Err(ApiError::StateLocked { holder });
        }
        Err(e) => return Err(ApiError::internal("upload_failed", e)),
    }

    record_state_op("put_state", "ok");
    metrics::counter!(STATE_BYTES_WRITTEN_TOTAL).increment(size as u64);
    info!(unit = unit_id, size, "state written");

    if let Some(graph) = &state.graph {
        graph.submit(unit_id, body);
    }

    Ok(StatusCode::OK.into_response())
}
