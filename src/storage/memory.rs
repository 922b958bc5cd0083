//! In-memory unit store.
//!
//! Units live in a `tokio::sync::RwLock<HashMap<..>>`. Every mutation takes
//! the write lock, so lock acquisition is trivially compare-and-set. Nothing
//! survives a restart.

use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::backend::{
    upload_permitted, LockInfo, StoreError, StoreResult, UnitMetadata, UnitStore,
};
use std::future::Future;
use std::pin::Pin;

struct UnitRecord {
    data: Bytes,
    updated: chrono::DateTime<Utc>,
    lock: Option<LockInfo>,
}

impl UnitRecord {
    fn metadata(&self, id: &str) -> UnitMetadata {
        UnitMetadata {
            id: id.to_string(),
            size: self.data.len() as u64,
            updated: self.updated,
            locked: self.lock.is_some(),
            lock_info: self.lock.clone(),
        }
    }
}

#[derive(Default)]
pub struct MemoryUnitStore {
    units: RwLock<HashMap<String, UnitRecord>>,
}

impl MemoryUnitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UnitStore for MemoryUnitStore {
    fn create<'a>(
        &'a self,
        unit_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<UnitMetadata>> + Send + 'a>> {
        Box::pin(async move {
            let mut units = self.units.write().await;
            if units.contains_key(unit_id) {
                return Err(StoreError::AlreadyExists);
            }
            let record = UnitRecord {
                data: Bytes::new(),
                updated: Utc::now(),
                lock: None,
            };
            let meta = record.metadata(unit_id);
            units.insert(unit_id.to_string(), record);
            Ok(meta)
        })
    }

    fn get<'a>(
        &'a self,
        unit_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<UnitMetadata>> + Send + 'a>> {
        Box::pin(async move {
            let units = self.units.read().await;
            units
                .get(unit_id)
                .map(|r| r.metadata(unit_id))
                .ok_or(StoreError::NotFound)
        })
    }

    fn download<'a>(
        &'a self,
        unit_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Bytes>> + Send + 'a>> {
        Box::pin(async move {
            let units = self.units.read().await;
            units
                .get(unit_id)
                .map(|r| r.data.clone())
                .ok_or(StoreError::NotFound)
        })
    }

    fn upload<'a>(
        &'a self,
        unit_id: &'a str,
        data: Bytes,
        lock_id: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut units = self.units.write().await;
            let record = units.get_mut(unit_id).ok_or(StoreError::NotFound)?;
            if !upload_permitted(record.lock.as_ref().map(|l| l.id.as_str()), lock_id) {
                return Err(StoreError::LockConflict);
            }
            record.data = data;
            record.updated = Utc::now();
            Ok(())
        })
    }

    fn lock<'a>(
        &'a self,
        unit_id: &'a str,
        info: &'a LockInfo,
    ) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut units = self.units.write().await;
            let record = units.get_mut(unit_id).ok_or(StoreError::NotFound)?;
            if record.lock.is_some() {
                return Err(StoreError::LockConflict);
            }
            record.lock = Some(info.clone());
            Ok(())
        })
    }

    fn unlock<'a>(
        &'a self,
        unit_id: &'a str,
        lock_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut units = self.units.write().await;
            let record = units.get_mut(unit_id).ok_or(StoreError::NotFound)?;
            match &record.lock {
                None => Err(StoreError::NotLocked),
                Some(held) if held.id != lock_id => Err(StoreError::LockConflict),
                Some(_) => {
                    record.lock = None;
                    Ok(())
                }
            }
        })
    }

    fn get_lock<'a>(
        &'a self,
        unit_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = StoreResult<Option<LockInfo>>> + Send + 'a>> {
        Box::pin(async move {
            let units = self.units.read().await;
            units
                .get(unit_id)
                .map(|r| r.lock.clone())
                .ok_or(StoreError::NotFound)
        })
    }
}

/// Store contract checks shared by every backend's test suite.
#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use std::sync::Arc;

    pub fn lock_info(id: &str) -> LockInfo {
        LockInfo {
            id: id.to_string(),
            operation: Some("OperationTypeApply".to_string()),
            info: None,
            who: "tester".to_string(),
            version: "1.9.0".to_string(),
            created: Utc::now(),
            path: None,
        }
    }

    pub async fn create_and_get(store: &dyn UnitStore) {
        let meta = store.create("org/unit1").await.unwrap();
        assert_eq!(meta.id, "org/unit1");
        assert_eq!(meta.size, 0);
        assert!(!meta.locked);
        assert!(matches!(
            store.create("org/unit1").await,
            Err(StoreError::AlreadyExists)
        ));
        assert!(matches!(store.get("missing").await, Err(StoreError::NotFound)));
        assert!(store.download("org/unit1").await.unwrap().is_empty());
    }

    pub async fn upload_and_download(store: &dyn UnitStore) {
        assert!(matches!(
            store.upload("ghost", Bytes::from_static(b"{}"), None).await,
            Err(StoreError::NotFound)
        ));
        store.create("u").await.unwrap();
        store
            .upload("u", Bytes::from_static(b"{\"version\":4}"), None)
            .await
            .unwrap();
        assert_eq!(
            store.download("u").await.unwrap(),
            Bytes::from_static(b"{\"version\":4}")
        );
        assert_eq!(store.get("u").await.unwrap().size, 13);
    }

    pub async fn lock_lifecycle(store: &dyn UnitStore) {
        store.create("u").await.unwrap();
        assert!(store.get_lock("u").await.unwrap().is_none());
        assert!(matches!(
            store.lock("ghost", &lock_info("a")).await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.get_lock("ghost").await,
            Err(StoreError::NotFound)
        ));

        store.lock("u", &lock_info("a")).await.unwrap();
        assert!(matches!(
            store.lock("u", &lock_info("b")).await,
            Err(StoreError::LockConflict)
        ));
        let meta = store.get("u").await.unwrap();
        assert!(meta.locked);
        assert_eq!(meta.lock_info.map(|l| l.id).as_deref(), Some("a"));
        assert_eq!(store.get_lock("u").await.unwrap().unwrap().id, "a");

        // Writes need the holder's id while locked.
        let body = Bytes::from_static(b"{}");
        assert!(matches!(
            store.upload("u", body.clone(), None).await,
            Err(StoreError::LockConflict)
        ));
        assert!(matches!(
            store.upload("u", body.clone(), Some("b")).await,
            Err(StoreError::LockConflict)
        ));
        store.upload("u", body, Some("a")).await.unwrap();

        assert!(matches!(
            store.unlock("u", "b").await,
            Err(StoreError::LockConflict)
        ));
        store.unlock("u", "a").await.unwrap();
        assert!(matches!(
            store.unlock("u", "a").await,
            Err(StoreError::NotLocked)
        ));
        assert!(store.get_lock("u").await.unwrap().is_none());
    }

    pub async fn concurrent_lock_single_winner(store: Arc<dyn UnitStore>) {
        store.create("race").await.unwrap();
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.lock("race", &lock_info(&format!("h{i}"))).await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => winners += 1,
                Err(StoreError::LockConflict) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1);
    }
}
