use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::category::Category;

/// What the browser reports about one tab at the moment a trigger fires.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub context_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_id: Option<i64>,
    #[serde(default)]
    pub locator: Option<String>,
}

/// One continuous stretch of time attributed to a single domain.
///
/// While open, `end_time` is `None` and `duration_seconds` is zero. [`SessionRecord::close`]
/// consumes the open record, so a record can only be closed once.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub device_id: String,
    pub domain: String,
    #[serde(rename = "url")]
    pub source_ref: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
    pub category: Category,
    #[serde(rename = "tabId")]
    pub tracking_context_id: i64,
}

impl SessionRecord {
    pub fn open(
        device_id: &str,
        domain: String,
        source_ref: String,
        category: Category,
        tracking_context_id: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            domain,
            source_ref,
            start_time: now,
            end_time: None,
            duration_seconds: 0,
            category,
            tracking_context_id,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Whole seconds elapsed since start; a clock that went backwards counts as zero.
    pub fn elapsed_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.start_time).num_seconds().max(0)
    }

    pub fn close(mut self, now: DateTime<Utc>) -> Self {
        let end = now.max(self.start_time);
        self.duration_seconds = self.elapsed_seconds(end);
        self.end_time = Some(end);
        self
    }
}
