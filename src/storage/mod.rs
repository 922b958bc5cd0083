//! Unit storage backends.
//!
//! The [`backend::UnitStore`] trait abstracts over where unit state and
//! locks live. Implementations: in-memory, SQLite, and S3-compatible
//! object storage.

pub mod aws;
pub mod backend;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;
use tracing::info;

use crate::config::StorageConfig;
use backend::UnitStore;

/// Open the backend named by `config.backend`.
pub async fn open_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn UnitStore>> {
    let store: Arc<dyn UnitStore> = match config.backend.as_str() {
        "memory" => {
            info!("Using in-memory unit store");
            Arc::new(memory::MemoryUnitStore::new())
        }
        "sqlite" => {
            info!(path = %config.sqlite.path, "Using SQLite unit store");
            Arc::new(sqlite::SqliteUnitStore::new(&config.sqlite.path)?)
        }
        "aws" => {
            let aws = config
                .aws
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("storage.aws section is required for the aws backend"))?;
            Arc::new(aws::AwsUnitStore::new(aws).await?)
        }
        other => anyhow::bail!("unknown storage backend: {other}"),
    };
    Ok(store)
}
