//! Durable key/value storage with named buckets.
//!
//! Each bucket holds one JSON document. A single `get` or `set` is atomic; callers
//! that need read-modify-write (the buffer, the override sets) must serialize those
//! sequences themselves.

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::StoreError;

pub const BUCKET_SESSIONS: &str = "sessions";
pub const BUCKET_DEVICE_ID: &str = "deviceId";
pub const BUCKET_CATEGORY_OVERRIDES: &str = "categoryOverrides";

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, bucket: &str) -> Result<Option<Value>, StoreError>;
    async fn set(&self, bucket: &str, value: &Value) -> Result<(), StoreError>;
    async fn remove(&self, bucket: &str) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS kv (
  bucket TEXT PRIMARY KEY,
  value_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
"#,
    )
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, bucket: &str) -> Result<Option<Value>, StoreError> {
        let raw: Option<String> = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare("SELECT value_json FROM kv WHERE bucket = ?1")?;
            match stmt.query_row([bucket], |row| row.get(0)) {
                Ok(v) => Some(v),
                Err(rusqlite::Error::QueryReturnedNoRows) => None,
                Err(err) => return Err(err.into()),
            }
        };
        raw.map(|s| {
            serde_json::from_str(&s).map_err(|source| StoreError::Malformed {
                bucket: bucket.to_string(),
                source,
            })
        })
        .transpose()
    }

    async fn set(&self, bucket: &str, value: &Value) -> Result<(), StoreError> {
        let value_json = serde_json::to_string(value).map_err(|source| StoreError::Encode {
            bucket: bucket.to_string(),
            source,
        })?;
        let updated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
INSERT INTO kv (bucket, value_json, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(bucket) DO UPDATE SET
  value_json=excluded.value_json,
  updated_at=excluded.updated_at
"#,
            (bucket, value_json, updated_at),
        )?;
        Ok(())
    }

    async fn remove(&self, bucket: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM kv WHERE bucket = ?1", [bucket])?;
        Ok(())
    }
}

/// In-process store. Writes can be switched to fail, which is how storage
/// outages are exercised in tests.
#[derive(Default)]
pub struct MemoryStore {
    buckets: Mutex<HashMap<String, Value>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, bucket: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.buckets.lock().await.get(bucket).cloned())
    }

    async fn set(&self, bucket: &str, value: &Value) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("write to {bucket} refused")));
        }
        self.buckets
            .lock()
            .await
            .insert(bucket.to_string(), value.clone());
        Ok(())
    }

    async fn remove(&self, bucket: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("remove of {bucket} refused")));
        }
        self.buckets.lock().await.remove(bucket);
        Ok(())
    }
}
