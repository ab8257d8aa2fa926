use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::{
    error::StoreError,
    store::{KvStore, BUCKET_DEVICE_ID},
};

const DEVICE_ID_MAX_LEN: usize = 128;

pub fn is_valid_device_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= DEVICE_ID_MAX_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Reads the stored device id. Missing or malformed ids come back as `None`.
pub async fn load_device_id(store: &dyn KvStore) -> Result<Option<String>, StoreError> {
    let id = match store.get(BUCKET_DEVICE_ID).await? {
        Some(Value::String(s)) => s,
        _ => return Ok(None),
    };
    Ok(is_valid_device_id(&id).then_some(id))
}

/// Returns the installation's device id, minting and persisting a new one on first run.
pub async fn load_or_create_device_id(store: &dyn KvStore) -> Result<String, StoreError> {
    if let Some(id) = load_device_id(store).await? {
        info!("existing device id: {id}");
        return Ok(id);
    }
    let id = Uuid::new_v4().to_string();
    store
        .set(BUCKET_DEVICE_ID, &Value::String(id.clone()))
        .await?;
    info!("new device id generated: {id}");
    Ok(id)
}
