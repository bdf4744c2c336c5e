//! The durable mutation queue.
//!
//! An async facade over the blocking queue and conflict stores. Mutations
//! are never deduplicated: repeated enqueues for the same entity produce
//! independent entries, applied in enqueue order per device.

use crate::{run_blocking, SyncResult};
use chrono::{DateTime, Utc};
use driftline_store::{ConflictStore, QueueStore};
use driftline_types::{
    ConflictStatus, DeviceId, Mutation, QueueItem, QueueItemId, QueueStats, SyncConflict, UserId,
};
use std::sync::Arc;
use tracing::debug;

/// Ordered queue of pending client-originated mutations.
#[derive(Clone)]
pub struct SyncQueue {
    store: Arc<dyn QueueStore>,
    conflicts: Arc<dyn ConflictStore>,
}

impl SyncQueue {
    /// Creates a queue over the given stores.
    pub fn new(store: Arc<dyn QueueStore>, conflicts: Arc<dyn ConflictStore>) -> Self {
        Self { store, conflicts }
    }

    /// Appends a client mutation as a fresh, unsynced queue item.
    pub async fn enqueue(&self, user: UserId, mutation: Mutation) -> SyncResult<QueueItem> {
        let item = QueueItem::new(user, mutation);
        debug!(
            "enqueue {} {} on {}/{} for device {}",
            item.action, item.id, item.entity_type, item.entity_id, item.device_id
        );

        let store = self.store.clone();
        let stored = item.clone();
        run_blocking(move || store.enqueue(&stored)).await?;
        Ok(item)
    }

    /// Fetches a queue item by id.
    pub async fn item(&self, id: QueueItemId) -> SyncResult<Option<QueueItem>> {
        let store = self.store.clone();
        run_blocking(move || store.get(&id)).await
    }

    /// Returns up to `batch_size` unsynced items for the (user, device),
    /// oldest client timestamp first. With `include_retries` false only
    /// never-attempted items are returned; `max_attempts` excludes items at
    /// or past an external retry cutoff.
    pub async fn pending_items(
        &self,
        user: &UserId,
        device: &DeviceId,
        batch_size: usize,
        include_retries: bool,
        max_attempts: Option<u32>,
    ) -> SyncResult<Vec<QueueItem>> {
        let store = self.store.clone();
        let user = *user;
        let device = *device;
        run_blocking(move || store.pending(&user, &device, batch_size, include_retries, max_attempts))
            .await
    }

    /// Records a sync attempt: overwrites the attempt counter and the
    /// last-error text. Never changes `synced`.
    pub async fn update_attempts(
        &self,
        id: QueueItemId,
        attempts: u32,
        error: Option<String>,
    ) -> SyncResult<()> {
        let store = self.store.clone();
        run_blocking(move || store.update_attempts(&id, attempts, error.as_deref())).await
    }

    /// Marks an item synced now. Returns the timestamp written, which the
    /// orchestrator feeds into the watermark.
    pub async fn mark_synced(&self, id: QueueItemId) -> SyncResult<DateTime<Utc>> {
        let now = Utc::now();
        let store = self.store.clone();
        run_blocking(move || store.mark_synced(&id, now)).await?;
        Ok(now)
    }

    /// Flags an item conflict-detected without altering `synced`.
    pub async fn mark_conflict_detected(&self, id: QueueItemId) -> SyncResult<()> {
        let store = self.store.clone();
        run_blocking(move || store.mark_conflict(&id)).await
    }

    /// Aggregate pending/synced/conflicted/failed counts for observability.
    pub async fn statistics(&self, user: &UserId, device: &DeviceId) -> SyncResult<QueueStats> {
        let store = self.store.clone();
        let user = *user;
        let device = *device;
        run_blocking(move || store.stats(&user, &device)).await
    }

    /// Unsynced conflicted items joined with their pending conflict records.
    pub async fn pending_conflicts(
        &self,
        user: &UserId,
        device: &DeviceId,
    ) -> SyncResult<Vec<(QueueItem, SyncConflict)>> {
        let store = self.store.clone();
        let conflicts = self.conflicts.clone();
        let user = *user;
        let device = *device;
        run_blocking(move || {
            let mut joined = Vec::new();
            for item in store.conflicted(&user, &device)? {
                if let Some(conflict) = conflicts.for_queue_item(&item.id)? {
                    if conflict.status == ConflictStatus::Pending {
                        joined.push((item, conflict));
                    }
                }
            }
            Ok(joined)
        })
        .await
    }

    /// Deletes synced items older than the cutoff (queue housekeeping;
    /// conflict records are never pruned). Returns the number removed.
    pub async fn prune_synced(&self, before: DateTime<Utc>) -> SyncResult<usize> {
        let store = self.store.clone();
        let pruned = run_blocking(move || store.prune_synced(before)).await?;
        if pruned > 0 {
            debug!("pruned {pruned} synced queue items");
        }
        Ok(pruned)
    }

    /// The conflict store this queue joins against.
    pub(crate) fn conflicts(&self) -> &Arc<dyn ConflictStore> {
        &self.conflicts
    }
}
