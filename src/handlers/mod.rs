//! S3-compatible request handlers.
//!
//! Object paths have the shape
//! `/s3/<bucket>/<unit/id/segments...>/terraform.tfstate[.lock|.tflock]`.
//! [`route_object`] turns the `(bucket, key)` pair captured by the router into
//! an [`ObjectTarget`]; the `state` and `lock` modules serve the two object
//! kinds, and `bucket` answers the workspace-listing request.

pub mod bucket;
pub mod lock;
pub mod state;

use axum::http::HeaderMap;
use garde::Validate;
use std::collections::BTreeMap;

use crate::errors::ApiError;

/// Final path segment of a state object.
pub const STATE_OBJECT: &str = "terraform.tfstate";

/// Final path segments accepted for a unit's lock object.
pub const LOCK_OBJECTS: &[&str] = &["terraform.tfstate.lock", "terraform.tfstate.tflock"];

/// Header Terraform's HTTP backend uses to carry the lock id.
pub const LOCK_ID_HEADER: &str = "x-terraform-lock-id";

// -- Object routing -----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    State,
    Lock,
}

/// A resolved object path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectTarget {
    pub bucket: String,
    pub unit_id: String,
    pub kind: ObjectKind,
}

#[derive(Debug, Validate)]
struct UnitPath<'a> {
    #[garde(length(min = 1, max = 1024), custom(segments_are_names))]
    unit_id: &'a str,
}

fn segments_are_names(value: &str, _ctx: &()) -> garde::Result {
    for segment in value.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(garde::Error::new(format!(
                "invalid unit id segment {segment:?}"
            )));
        }
    }
    Ok(())
}

/// Check that `unit_id` is a usable slash-separated unit path.
pub fn validate_unit_id(unit_id: &str) -> Result<(), String> {
    UnitPath { unit_id }
        .validate()
        .map_err(|report| report.to_string())
}

/// Split an object key into the unit id and the object it names.
///
/// `key` is everything after the bucket. The last segment decides the
/// object kind; the segments before it, joined with `/`, are the unit id.
pub fn route_object(bucket: &str, key: &str) -> Result<ObjectTarget, ApiError> {
    let (unit_id, object) = key.rsplit_once('/').ok_or(ApiError::UnknownObject)?;
    let kind = if object == STATE_OBJECT {
        ObjectKind::State
    } else if LOCK_OBJECTS.contains(&object) {
        ObjectKind::Lock
    } else {
        return Err(ApiError::UnknownObject);
    };

    validate_unit_id(unit_id).map_err(|reason| ApiError::InvalidPath { reason })?;

    Ok(ObjectTarget {
        bucket: bucket.to_string(),
        unit_id: unit_id.to_string(),
        kind,
    })
}

// -- Lock id resolution -------------------------------------------------------

/// One place a caller may have put the lock id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockIdSource {
    /// The `X-Terraform-Lock-ID` header.
    Header,
    /// A query parameter with the given name.
    Query(&'static str),
    /// The `ID` field of a JSON `LockInfo` request body.
    Body,
    /// Whoever holds the unit's lock right now.
    CurrentHolder,
}

/// Lookup order for the lock id accompanying a state write.
pub const STATE_WRITE_LOCK_ID: &[LockIdSource] = &[
    LockIdSource::Header,
    LockIdSource::Query("ID"),
    LockIdSource::Query("id"),
    LockIdSource::CurrentHolder,
];

/// Lookup order for the lock id of a release.
pub const RELEASE_LOCK_ID: &[LockIdSource] = &[
    LockIdSource::Body,
    LockIdSource::Header,
    LockIdSource::CurrentHolder,
];

/// What a request offers to [`resolve_lock_id`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LockIdCandidates<'a> {
    pub headers: Option<&'a HeaderMap>,
    pub query: Option<&'a BTreeMap<String, String>>,
    pub body_id: Option<&'a str>,
    pub current_holder: Option<&'a str>,
}

impl LockIdCandidates<'_> {
    fn lookup(&self, source: LockIdSource) -> Option<&str> {
        match source {
            LockIdSource::Header => self
                .headers?
                .get(LOCK_ID_HEADER)
                .and_then(|v| v.to_str().ok()),
            LockIdSource::Query(name) => self.query?.get(name).map(String::as_str),
            LockIdSource::Body => self.body_id,
            LockIdSource::CurrentHolder => self.current_holder,
        }
    }
}

/// First non-empty lock id found, trying `sources` in order.
pub fn resolve_lock_id(sources: &[LockIdSource], candidates: &LockIdCandidates<'_>) -> Option<String> {
    sources
        .iter()
        .filter_map(|source| candidates.lookup(*source))
        .map(str::trim)
        .find(|id| !id.is_empty())
        .map(str::to_string)
}
