//! Unit store contract.
//!
//! A *unit* is one Terraform state: an opaque blob plus at most one
//! advisory lock. Units are provisioned out of band with [`UnitStore::create`];
//! the S3 surface never creates them implicitly.
//!
//! Implementations must make [`UnitStore::lock`] an atomic compare-and-set
//! on "no current holder": of two concurrent callers exactly one succeeds
//! and the other observes [`StoreError::LockConflict`].

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Lock holder metadata, in the shape Terraform reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Operation", default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(rename = "Info", default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(rename = "Who")]
    pub who: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Created")]
    pub created: DateTime<Utc>,
    #[serde(rename = "Path", default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Point-in-time view of a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitMetadata {
    /// Unit identifier (slash-separated path).
    pub id: String,
    /// Size of the stored state in bytes; 0 until the first write.
    pub size: u64,
    /// Time of creation or of the last write.
    pub updated: DateTime<Utc>,
    /// Whether a lock is currently held.
    pub locked: bool,
    /// The current holder, if any.
    pub lock_info: Option<LockInfo>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unit not found")]
    NotFound,
    #[error("unit already exists")]
    AlreadyExists,
    #[error("lock conflict")]
    LockConflict,
    #[error("unit is not locked")]
    NotLocked,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Async unit storage.
pub trait UnitStore: Send + Sync + 'static {
    /// Provision an empty unit. `AlreadyExists` if it is already there.
    fn create<'a>(&'a self, unit_id: &'a str) -> StoreFuture<'a, UnitMetadata>;

    /// Metadata for a unit. `NotFound` if it was never created.
    fn get<'a>(&'a self, unit_id: &'a str) -> StoreFuture<'a, UnitMetadata>;

    /// The stored state bytes (empty before the first write).
    fn download<'a>(&'a self, unit_id: &'a str) -> StoreFuture<'a, Bytes>;

    /// Replace the state bytes.
    ///
    /// While the unit is locked, `lock_id` must name the holder; a missing
    /// or different id yields `LockConflict`.
    fn upload<'a>(
        &'a self,
        unit_id: &'a str,
        data: Bytes,
        lock_id: Option<&'a str>,
    ) -> StoreFuture<'a, ()>;

    /// Acquire the lock. `LockConflict` if any holder exists.
    fn lock<'a>(&'a self, unit_id: &'a str, info: &'a LockInfo) -> StoreFuture<'a, ()>;

    /// Release the lock held under `lock_id`.
    ///
    /// `NotLocked` if nobody holds it, `LockConflict` if someone else does.
    fn unlock<'a>(&'a self, unit_id: &'a str, lock_id: &'a str) -> StoreFuture<'a, ()>;

    /// The current holder, or `None` when unlocked.
    fn get_lock<'a>(&'a self, unit_id: &'a str) -> StoreFuture<'a, Option<LockInfo>>;
}

/// Whether an upload carrying `lock_id` may proceed while `holder` holds
/// the lock.
pub(crate) fn upload_permitted(holder: Option<&str>, lock_id: Option<&str>) -> bool {
    match (holder, lock_id) {
        (None, _) => true,
        (Some(held), Some(id)) => held == id,
        (Some(_), None) => false,
    }
}
