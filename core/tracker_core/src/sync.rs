//! Hands buffered sessions to the remote collector.
//!
//! A flush sends the whole buffer as one batch. Success removes exactly the records
//! that were sent; failure leaves the buffer as it was. At most one flush runs at a
//! time: a flush requested while another is in flight returns immediately.

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{sync::Mutex, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    buffer::LocalBuffer,
    category::Category,
    device::load_device_id,
    error::SyncError,
    session::SessionRecord,
    store::KvStore,
};

pub const DEFAULT_SYNC_THRESHOLD: usize = 20;
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSession {
    pub domain: String,
    pub url: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
    pub category: Category,
}

impl From<&SessionRecord> for BatchSession {
    fn from(r: &SessionRecord) -> Self {
        Self {
            domain: r.domain.clone(),
            url: r.source_ref.clone(),
            start_time: r.start_time,
            end_time: r.end_time,
            duration_seconds: r.duration_seconds,
            category: r.category,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBatch {
    pub device_id: String,
    pub sessions: Vec<BatchSession>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct BatchAck {
    #[serde(default)]
    pub count: Option<usize>,
}

#[async_trait]
pub trait Collector: Send + Sync {
    async fn register_device(&self, device_id: &str) -> Result<(), SyncError>;
    async fn upload_batch(&self, batch: &SessionBatch) -> Result<BatchAck, SyncError>;
}

pub struct HttpCollector {
    client: Client,
    base_url: String,
}

impl HttpCollector {
    /// `base_url` is the collector's API root, e.g. `http://127.0.0.1:5000/api`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn register_device(&self, device_id: &str) -> Result<(), SyncError> {
        let res = self
            .client
            .post(format!("{}/devices", self.base_url))
            .json(&json!({ "deviceId": device_id }))
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(SyncError::Status(res.status().as_u16()));
        }
        Ok(())
    }

    async fn upload_batch(&self, batch: &SessionBatch) -> Result<BatchAck, SyncError> {
        let res = self
            .client
            .post(format!("{}/sessions/batch", self.base_url))
            .json(batch)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(SyncError::Status(res.status().as_u16()));
        }
        // 2xx means the rows are stored; an odd body must not cause a resend.
        match res.json::<BatchAck>().await {
            Ok(ack) => Ok(ack),
            Err(err) => {
                warn!("batch accepted but ack unreadable: {err}");
                Ok(BatchAck::default())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FlushOutcome {
    InFlight,
    NoDevice,
    Empty,
    Synced { count: usize },
    Failed { error: String },
}

pub struct SyncEngine {
    buffer: LocalBuffer,
    store: Arc<dyn KvStore>,
    collector: Arc<dyn Collector>,
    threshold: usize,
    interval: Duration,
    in_flight: Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        buffer: LocalBuffer,
        store: Arc<dyn KvStore>,
        collector: Arc<dyn Collector>,
        threshold: usize,
        interval: Duration,
    ) -> Self {
        Self {
            buffer,
            store,
            collector,
            threshold: threshold.max(1),
            interval,
            in_flight: Mutex::new(()),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn should_flush(&self, buffered: usize) -> bool {
        buffered >= self.threshold
    }

    /// Starts a flush in the background; the caller never waits on the network.
    pub fn request_flush(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.flush().await;
        });
    }

    pub async fn flush(&self) -> FlushOutcome {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("flush already in flight; skipped");
            return FlushOutcome::InFlight;
        };

        // Re-read every cycle so a repaired id is picked up without a restart.
        let device_id = match load_device_id(self.store.as_ref()).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                warn!("sync skipped: device id missing or malformed");
                return FlushOutcome::NoDevice;
            }
            Err(err) => {
                warn!("sync skipped: device id unreadable: {err}");
                return FlushOutcome::NoDevice;
            }
        };

        let records = self.buffer.read_all().await;
        if records.is_empty() {
            return FlushOutcome::Empty;
        }

        let batch = SessionBatch {
            device_id,
            sessions: records.iter().map(BatchSession::from).collect(),
        };

        match self.collector.upload_batch(&batch).await {
            Ok(ack) => {
                let sent = records.len();
                if let Some(count) = ack.count.filter(|c| *c != sent) {
                    warn!("collector acknowledged {count} of {sent} sessions");
                }
                let ids: HashSet<String> = records.into_iter().map(|r| r.id).collect();
                if let Err(err) = self.buffer.remove_synced(&ids).await {
                    // Next flush resends them; the collector may then hold duplicates.
                    error!("synced sessions could not be removed from buffer: {err}");
                }
                info!("synced {sent} sessions");
                FlushOutcome::Synced { count: sent }
            }
            Err(err) => {
                warn!("sync failed, keeping {} buffered sessions: {err}", records.len());
                FlushOutcome::Failed {
                    error: err.to_string(),
                }
            }
        }
    }

    /// Best-effort device registration; failures are logged and retried on next start.
    pub async fn register_device(&self) {
        let device_id = match load_device_id(self.store.as_ref()).await {
            Ok(Some(id)) => id,
            _ => {
                warn!("device registration skipped: no valid device id");
                return;
            }
        };
        match self.collector.register_device(&device_id).await {
            Ok(()) => info!("device registered with collector: {device_id}"),
            Err(err) => warn!("device registration failed: {err}"),
        }
    }

    /// Periodic flush loop. Runs until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so startup does not flush.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let outcome = self.flush().await;
            debug!("periodic flush: {outcome:?}");
        }
    }
}
