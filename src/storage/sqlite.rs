//! SQLite unit store.
//!
//! One row per unit holds the state blob and the current lock. Lock
//! acquisition is a single conditional `UPDATE ... WHERE lock_id IS NULL`,
//! which makes it compare-and-set even if several processes share the file.
//!
//! `rusqlite::Connection` is `!Sync`, so it sits in a `std::sync::Mutex`
//! behind an `Arc` and every call runs on `tokio::task::spawn_blocking`.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

use super::backend::{
    upload_permitted, LockInfo, StoreError, StoreFuture, StoreResult, UnitMetadata, UnitStore,
};

pub struct SqliteUnitStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteUnitStore {
    /// Open (or create) the database at `db_path` and initialise the schema.
    pub fn new(db_path: &str) -> anyhow::Result<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA busy_timeout=5000;\
             PRAGMA synchronous=NORMAL;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS units (\
                 id        TEXT PRIMARY KEY,\
                 data      BLOB NOT NULL,\
                 updated   TEXT NOT NULL,\
                 lock_id   TEXT,\
                 lock_info TEXT\
             );",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| anyhow::anyhow!("Mutex poisoned: {e}"))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Backend(e.into()))?
    }
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.into())
}

fn parse_updated(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(anyhow::anyhow!("bad updated timestamp {raw:?}: {e}")))
}

fn parse_lock(raw: Option<String>) -> StoreResult<Option<LockInfo>> {
    raw.map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| StoreError::Backend(e.into()))
}

/// Which of the three lock states a unit row is in.
enum LockState {
    Missing,
    Unlocked,
    Held(String),
}

fn lock_state(conn: &Connection, unit_id: &str) -> StoreResult<LockState> {
    let row: Option<Option<String>> = conn
        .query_row(
            "SELECT lock_id FROM units WHERE id = ?1",
            params![unit_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)?;
    Ok(match row {
        None => LockState::Missing,
        Some(None) => LockState::Unlocked,
        Some(Some(id)) => LockState::Held(id),
    })
}

impl UnitStore for SqliteUnitStore {
    fn create<'a>(&'a self, unit_id: &'a str) -> StoreFuture<'a, UnitMetadata> {
        let id = unit_id.to_string();
        Box::pin(async move {
            self.run(move |conn| {
                let now = Utc::now();
                let inserted = conn
                    .execute(
                        "INSERT OR IGNORE INTO units (id, data, updated) VALUES (?1, x'', ?2)",
                        params![id, now.to_rfc3339()],
                    )
                    .map_err(db_err)?;
                if inserted == 0 {
                    return Err(StoreError::AlreadyExists);
                }
                Ok(UnitMetadata {
                    id,
                    size: 0,
                    updated: now,
                    locked: false,
                    lock_info: None,
                })
            })
            .await
        })
    }

    fn get<'a>(&'a self, unit_id: &'a str) -> StoreFuture<'a, UnitMetadata> {
        let id = unit_id.to_string();
        Box::pin(async move {
            self.run(move |conn| {
                let row: Option<(i64, String, Option<String>)> = conn
                    .query_row(
                        "SELECT length(data), updated, lock_info FROM units WHERE id = ?1",
                        params![id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()
                    .map_err(db_err)?;
                let (size, updated, lock_info) = row.ok_or(StoreError::NotFound)?;
                let lock_info = parse_lock(lock_info)?;
                Ok(UnitMetadata {
                    id,
                    size: size.max(0) as u64,
                    updated: parse_updated(&updated)?,
                    locked: lock_info.is_some(),
                    lock_info,
                })
            })
            .await
        })
    }

    fn download<'a>(&'a self, unit_id: &'a str) -> StoreFuture<'a, Bytes> {
        let id = unit_id.to_string();
        Box::pin(async move {
            self.run(move |conn| {
                let data: Option<Vec<u8>> = conn
                    .query_row(
                        "SELECT data FROM units WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(db_err)?;
                data.map(Bytes::from).ok_or(StoreError::NotFound)
            })
            .await
        })
    }

    fn upload<'a>(
        &'a self,
        unit_id: &'a str,
        data: Bytes,
        lock_id: Option<&'a str>,
    ) -> StoreFuture<'a, ()> {
        let id = unit_id.to_string();
        let lock_id = lock_id.map(str::to_string);
        Box::pin(async move {
            self.run(move |conn| {
                let tx = conn.transaction().map_err(db_err)?;
                let holder = match lock_state(&tx, &id)? {
                    LockState::Missing => return Err(StoreError::NotFound),
                    LockState::Unlocked => None,
                    LockState::Held(holder) => Some(holder),
                };
                if !upload_permitted(holder.as_deref(), lock_id.as_deref()) {
                    return Err(StoreError::LockConflict);
                }
                tx.execute(
                    "UPDATE units SET data = ?2, updated = ?3 WHERE id = ?1",
                    params![id, data.to_vec(), Utc::now().to_rfc3339()],
                )
                .map_err(db_err)?;
                tx.commit().map_err(db_err)
            })
            .await
        })
    }

    fn lock<'a>(&'a self, unit_id: &'a str, info: &'a LockInfo) -> StoreFuture<'a, ()> {
        let id = unit_id.to_string();
        let holder = info.id.clone();
        Box::pin(async move {
            let encoded = serde_json::to_string(info).map_err(|e| StoreError::Backend(e.into()))?;
            self.run(move |conn| {
                let claimed = conn
                    .execute(
                        "UPDATE units SET lock_id = ?2, lock_info = ?3 \
                         WHERE id = ?1 AND lock_id IS NULL",
                        params![id, holder, encoded],
                    )
                    .map_err(db_err)?;
                if claimed == 1 {
                    return Ok(());
                }
                match lock_state(conn, &id)? {
                    LockState::Missing => Err(StoreError::NotFound),
                    _ => Err(StoreError::LockConflict),
                }
            })
            .await
        })
    }

    fn unlock<'a>(&'a self, unit_id: &'a str, lock_id: &'a str) -> StoreFuture<'a, ()> {
        let id = unit_id.to_string();
        let lock_id = lock_id.to_string();
        Box::pin(async move {
            self.run(move |conn| {
                let released = conn
                    .execute(
                        "UPDATE units SET lock_id = NULL, lock_info = NULL \
                         WHERE id = ?1 AND lock_id = ?2",
                        params![id, lock_id],
                    )
                    .map_err(db_err)?;
                if released == 1 {
                    return Ok(());
                }
                match lock_state(conn, &id)? {
                    LockState::Missing => Err(StoreError::NotFound),
                    LockState::Unlocked => Err(StoreError::NotLocked),
                    LockState::Held(_) => Err(StoreError::LockConflict),
                }
            })
            .await
        })
    }

    fn get_lock<'a>(&'a self, unit_id: &'a str) -> StoreFuture<'a, Option<LockInfo>> {
        let id = unit_id.to_string();
        Box::pin(async move {
            self.run(move |conn| {
                let row: Option<Option<String>> = conn
                    .query_row(
                        "SELECT lock_info FROM units WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(db_err)?;
                parse_lock(row.ok_or(StoreError::NotFound)?)
            })
            .await
        })
    }
}
