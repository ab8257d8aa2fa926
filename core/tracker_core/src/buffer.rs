//! Bounded, persisted log of closed sessions waiting to be synced.

use std::{collections::HashSet, sync::Arc};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::{
    error::StoreError,
    session::SessionRecord,
    store::{KvStore, BUCKET_SESSIONS},
};

pub const DEFAULT_BUFFER_CAP: usize = 1000;

/// Cheap to clone; all clones share the same records and lock.
///
/// Every mutation holds the lock across the durable write, so an append can never
/// interleave with a flush removing records. When the write fails the in-memory
/// copy is rolled back and the error returned.
#[derive(Clone)]
pub struct LocalBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn KvStore>,
    cap: usize,
    records: Mutex<Vec<SessionRecord>>,
}

impl LocalBuffer {
    /// Loads persisted records, keeping only the newest `cap` of them.
    pub async fn load(store: Arc<dyn KvStore>, cap: usize) -> Self {
        let cap = cap.max(1);
        let mut records: Vec<SessionRecord> = match store.get(BUCKET_SESSIONS).await {
            Ok(Some(v)) => serde_json::from_value(v).unwrap_or_else(|err| {
                warn!("buffered sessions unreadable, starting empty: {err}");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!("buffered sessions load failed, starting empty: {err}");
                Vec::new()
            }
        };
        if records.len() > cap {
            records.drain(..records.len() - cap);
        }
        Self {
            inner: Arc::new(Inner {
                store,
                cap,
                records: Mutex::new(records),
            }),
        }
    }

    pub fn cap(&self) -> usize {
        self.inner.cap
    }

    /// Appends at the tail, evicting from the head past the cap. Returns the new size.
    pub async fn append(&self, record: SessionRecord) -> Result<usize, StoreError> {
        let mut records = self.inner.records.lock().await;
        let mut next = records.clone();
        next.push(record);
        if next.len() > self.inner.cap {
            let overflow = next.len() - self.inner.cap;
            next.drain(..overflow);
        }
        self.persist(&next).await?;
        *records = next;
        Ok(records.len())
    }

    pub async fn read_all(&self) -> Vec<SessionRecord> {
        self.inner.records.lock().await.clone()
    }

    pub async fn size(&self) -> usize {
        self.inner.records.lock().await.len()
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut records = self.inner.records.lock().await;
        self.persist(&[]).await?;
        records.clear();
        Ok(())
    }

    /// Drops the records whose ids were acknowledged by the collector. Records
    /// appended after the batch was taken are kept.
    pub async fn remove_synced(&self, ids: &HashSet<String>) -> Result<usize, StoreError> {
        let mut records = self.inner.records.lock().await;
        let next: Vec<SessionRecord> = records
            .iter()
            .filter(|r| !ids.contains(&r.id))
            .cloned()
            .collect();
        let removed = records.len() - next.len();
        if removed == 0 {
            return Ok(0);
        }
        self.persist(&next).await?;
        *records = next;
        Ok(removed)
    }

    async fn persist(&self, records: &[SessionRecord]) -> Result<(), StoreError> {
        let value = serde_json::to_value(records).map_err(|source| StoreError::Encode {
            bucket: BUCKET_SESSIONS.to_string(),
            source,
        })?;
        if value == Value::Array(Vec::new()) {
            return self.inner.store.remove(BUCKET_SESSIONS).await;
        }
        self.inner.store.set(BUCKET_SESSIONS, &value).await
    }
}
