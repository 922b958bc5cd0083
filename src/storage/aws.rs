//! S3-compatible object storage unit store.
//!
//! Each unit maps to two objects in a single upstream bucket:
//!   State:  `{prefix}{unit}/terraform.tfstate`
//!   Lock:   `{prefix}{unit}/terraform.tfstate.tflock` (LockInfo JSON)
//!
//! Lock acquisition is a conditional `PutObject` with `If-None-Match: *`,
//! which the upstream store evaluates atomically. Provisioning uses the same
//! condition on the state object.
//!
//! Credentials are resolved via the standard AWS credential chain
//! (env vars, `~/.aws/credentials`, IAM role, etc.) unless configured.

use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use tracing::{debug, info};

use super::backend::{
    upload_permitted, LockInfo, StoreError, StoreFuture, StoreResult, UnitMetadata, UnitStore,
};
use crate::config::AwsStorageConfig;

const STATE_OBJECT: &str = "terraform.tfstate";
const LOCK_OBJECT: &str = "terraform.tfstate.tflock";

/// Error codes upstream stores return when a conditional write loses.
const CONDITION_LOST: &[&str] = &["PreconditionFailed", "ConditionalRequestConflict"];

pub struct AwsUnitStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl AwsUnitStore {
    pub async fn new(config: &AwsStorageConfig) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if !config.endpoint_url.is_empty() {
            config_loader = config_loader.endpoint_url(&config.endpoint_url);
        }

        if !config.access_key_id.is_empty() && !config.secret_access_key.is_empty() {
            let creds = aws_sdk_s3::config::Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None,
                None,
                "statebridge-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.use_path_style)
            .build();

        info!(
            bucket = %config.bucket,
            prefix = %config.prefix,
            "object storage unit store initialized"
        );

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
        })
    }

    fn state_key(&self, unit_id: &str) -> String {
        object_key(&self.prefix, unit_id, STATE_OBJECT)
    }

    fn lock_key(&self, unit_id: &str) -> String {
        object_key(&self.prefix, unit_id, LOCK_OBJECT)
    }

    fn map_sdk_error(context: &str, err: impl std::fmt::Display) -> StoreError {
        StoreError::Backend(anyhow::anyhow!("object storage {context}: {err}"))
    }

    /// Head the state object; `None` when the unit was never created.
    async fn head_state(&self, unit_id: &str) -> StoreResult<Option<(u64, chrono::DateTime<Utc>)>> {
        let key = self.state_key(unit_id);
        debug!(bucket = %self.bucket, key = %key, "head_object");
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(resp) => {
                let size = resp.content_length().unwrap_or(0).max(0) as u64;
                let updated = resp
                    .last_modified()
                    .and_then(|t| Utc.timestamp_opt(t.secs(), t.subsec_nanos()).single())
                    .unwrap_or_else(Utc::now);
                Ok(Some((size, updated)))
            }
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    Ok(None)
                } else {
                    Err(Self::map_sdk_error("head_object", service_err))
                }
            }
        }
    }

    /// Read the lock object; `None` when it does not exist.
    async fn read_lock(&self, unit_id: &str) -> StoreResult<Option<LockInfo>> {
        let key = self.lock_key(unit_id);
        let resp = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                let service_err = e.into_service_error();
                return if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(Self::map_sdk_error("get_object lock", service_err))
                };
            }
        };
        let body = resp
            .body
            .collect()
            .await
            .map_err(|e| Self::map_sdk_error("get_object lock body", e))?
            .into_bytes();
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn require_unit(&self, unit_id: &str) -> StoreResult<(u64, chrono::DateTime<Utc>)> {
        self.head_state(unit_id).await?.ok_or(StoreError::NotFound)
    }
}

fn object_key(prefix: &str, unit_id: &str, object: &str) -> String {
    format!("{prefix}{unit_id}/{object}")
}

fn condition_lost(code: Option<&str>) -> bool {
    code.is_some_and(|c| CONDITION_LOST.contains(&c))
}

impl UnitStore for AwsUnitStore {
    fn create<'a>(&'a self, unit_id: &'a str) -> StoreFuture<'a, UnitMetadata> {
        Box::pin(async move {
            let key = self.state_key(unit_id);
            debug!(bucket = %self.bucket, key = %key, "create unit");
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .if_none_match("*")
                .body(ByteStream::from(Bytes::new()))
                .send()
                .await
                .map_err(|e| {
                    let service_err = e.into_service_error();
                    if condition_lost(service_err.code()) {
                        StoreError::AlreadyExists
                    } else {
                        Self::map_sdk_error("put_object create", service_err)
                    }
                })?;
            Ok(UnitMetadata {
                id: unit_id.to_string(),
                size: 0,
                updated: Utc::now(),
                locked: false,
                lock_info: None,
            })
        })
    }

    fn get<'a>(&'a self, unit_id: &'a str) -> StoreFuture<'a, UnitMetadata> {
        Box::pin(async move {
            let (size, updated) = self.require_unit(unit_id).await?;
            let lock_info = self.read_lock(unit_id).await?;
            Ok(UnitMetadata {
                id: unit_id.to_string(),
                size,
                updated,
                locked: lock_info.is_some(),
                lock_info,
            })
        })
    }

    fn download<'a>(&'a self, unit_id: &'a str) -> StoreFuture<'a, Bytes> {
        Box::pin(async move {
            let key = self.state_key(unit_id);
            debug!(bucket = %self.bucket, key = %key, "get_object");
            let resp = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| {
                    let service_err = e.into_service_error();
                    if service_err.is_no_such_key() {
                        StoreError::NotFound
                    } else {
                        Self::map_sdk_error("get_object", service_err)
                    }
                })?;
            let body = resp
                .body
                .collect()
                .await
                .map_err(|e| Self::map_sdk_error("get_object body", e))?
                .into_bytes();
            Ok(body)
        })
    }

    fn upload<'a>(
        &'a self,
        unit_id: &'a str,
        data: Bytes,
        lock_id: Option<&'a str>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.require_unit(unit_id).await?;
            let holder = self.read_lock(unit_id).await?;
            if !upload_permitted(holder.as_ref().map(|l| l.id.as_str()), lock_id) {
                return Err(StoreError::LockConflict);
            }
            let key = self.state_key(unit_id);
            debug!(bucket = %self.bucket, key = %key, size = data.len(), "put_object");
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .content_type("application/json")
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("put_object", e))?;
            Ok(())
        })
    }

    fn lock<'a>(&'a self, unit_id: &'a str, info: &'a LockInfo) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.require_unit(unit_id).await?;
            let body = serde_json::to_vec(info).map_err(|e| StoreError::Backend(e.into()))?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(self.lock_key(unit_id))
                .if_none_match("*")
                .content_type("application/json")
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|e| {
                    let service_err = e.into_service_error();
                    if condition_lost(service_err.code()) {
                        StoreError::LockConflict
                    } else {
                        Self::map_sdk_error("put_object lock", service_err)
                    }
                })?;
            Ok(())
        })
    }

    fn unlock<'a>(&'a self, unit_id: &'a str, lock_id: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            match self.read_lock(unit_id).await? {
                None => {
                    self.require_unit(unit_id).await?;
                    Err(StoreError::NotLocked)
                }
                Some(held) if held.id != lock_id => Err(StoreError::LockConflict),
                Some(_) => {
                    self.client
                        .delete_object()
                        .bucket(&self.bucket)
                        .key(self.lock_key(unit_id))
                        .send()
                        .await
                        .map_err(|e| Self::map_sdk_error("delete_object lock", e))?;
                    Ok(())
                }
            }
        })
    }

    fn get_lock<'a>(&'a self, unit_id: &'a str) -> StoreFuture<'a, Option<LockInfo>> {
        Box::pin(async move {
            match self.read_lock(unit_id).await? {
                Some(info) => Ok(Some(info)),
                None => {
                    self.require_unit(unit_id).await?;
                    Ok(None)
                }
            }
        })
    }
}
