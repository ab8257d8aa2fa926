//! Error types shared by the tracker's storage, categorizer and sync layers.

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("bucket {bucket} holds malformed json: {source}")]
    Malformed {
        bucket: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("encode bucket {bucket}: {source}")]
    Encode {
        bucket: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("request timed out")]
    Timeout,

    #[error("http transport: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("collector answered http_{0}")]
    Status(u16),
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout
        } else if let Some(status) = err.status() {
            SyncError::Status(status.as_u16())
        } else {
            SyncError::Transport(err)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CategoryError {
    #[error("domain must not be empty")]
    EmptyDomain,

    #[error("unknown category '{0}'")]
    UnknownCategory(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
