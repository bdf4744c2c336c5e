//! Sync watermark tracking.
//!
//! A watermark is a per (device, entity-type) cursor over the last point up
//! to which server-side changes have been delivered to that device. The
//! tracker keeps a process-local cache whose source of truth is the synced
//! subset of queue rows; losing the cache is safe because every value is
//! re-derivable from the store.

use crate::{run_blocking, SyncResult};
use chrono::{DateTime, Utc};
use driftline_store::QueueStore;
use driftline_types::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Cursor state for one (device, entity-type) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    /// The syncing device.
    pub device_id: DeviceId,
    /// Registry key of the entity type this cursor covers.
    pub entity_type: String,
    /// Last successfully synced point; non-decreasing once syncs occur.
    pub last_sync: DateTime<Utc>,
    /// Last seen entity version, for version-based entity types.
    pub last_entity_version: Option<i64>,
}

/// Tracks watermarks for all (device, entity-type) pairs.
///
/// Reads only ever gate which already-synced rows are reported as changed;
/// they never gate write application, so a momentarily stale cache (e.g.
/// across horizontally scaled instances) causes redundant change reporting
/// at worst.
pub struct WatermarkTracker {
    store: Arc<dyn QueueStore>,
    cache: RwLock<HashMap<(DeviceId, String), Watermark>>,
}

impl WatermarkTracker {
    /// Creates a tracker over the given queue store.
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the watermark for a (device, entity-type) pair.
    ///
    /// On a cache miss the initial value is derived from the most recently
    /// synced queue item for the pair, defaulting to epoch zero when the
    /// device has never synced this entity type.
    pub async fn get(&self, device: &DeviceId, entity_type: &str) -> SyncResult<Watermark> {
        let key = (*device, entity_type.to_string());
        if let Some(watermark) = self.cache.read().await.get(&key) {
            return Ok(watermark.clone());
        }

        let store = self.store.clone();
        let dev = *device;
        let etype = entity_type.to_string();
        let derived = run_blocking(move || store.last_synced_at(&dev, &etype)).await?;

        let watermark = Watermark {
            device_id: *device,
            entity_type: entity_type.to_string(),
            last_sync: derived.unwrap_or(DateTime::UNIX_EPOCH),
            last_entity_version: None,
        };
        debug!(
            "derived watermark for {}:{} -> {}",
            device, entity_type, watermark.last_sync
        );

        self.cache.write().await.insert(key, watermark.clone());
        Ok(watermark)
    }

    /// Overwrites the cached watermark for a (device, entity-type) pair.
    ///
    /// Callers are responsible for supplying non-decreasing timestamps; the
    /// tracker does not enforce monotonicity itself. A regression is logged
    /// but still applied, since the caller may be rebuilding state.
    pub async fn update(
        &self,
        device: &DeviceId,
        entity_type: &str,
        timestamp: DateTime<Utc>,
    ) {
        let key = (*device, entity_type.to_string());
        let mut cache = self.cache.write().await;
        match cache.get_mut(&key) {
            Some(watermark) => {
                if timestamp < watermark.last_sync {
                    warn!(
                        "watermark regression for {}:{} ({} -> {})",
                        device, entity_type, watermark.last_sync, timestamp
                    );
                }
                watermark.last_sync = timestamp;
            }
            None => {
                cache.insert(
                    key,
                    Watermark {
                        device_id: *device,
                        entity_type: entity_type.to_string(),
                        last_sync: timestamp,
                        last_entity_version: None,
                    },
                );
            }
        }
        debug!("watermark {}:{} -> {}", device, entity_type, timestamp);
    }

    /// Distinct entity ids whose synced queue rows land strictly after the
    /// current watermark — the changes a reconnecting device has not yet
    /// pulled, without re-fetching the full data set.
    pub async fn changed_entity_ids(
        &self,
        device: &DeviceId,
        entity_type: &str,
    ) -> SyncResult<Vec<String>> {
        let watermark = self.get(device, entity_type).await?;

        let store = self.store.clone();
        let dev = *device;
        let etype = entity_type.to_string();
        run_blocking(move || store.synced_entity_ids_after(&dev, &etype, watermark.last_sync))
            .await
    }

    /// Evicts the cached watermark for one entity type, or for every entity
    /// type of the device when `entity_type` is `None` (device
    /// de-registration).
    pub async fn clear(&self, device: &DeviceId, entity_type: Option<&str>) {
        let mut cache = self.cache.write().await;
        match entity_type {
            Some(etype) => {
                cache.remove(&(*device, etype.to_string()));
            }
            None => {
                cache.retain(|(dev, _), _| dev != device);
            }
        }
    }
}
