//! SQLite persistence for the Driftline sync queue and conflict log.
//!
//! The queue and conflict tables are the sync engine's source of truth:
//! every queued mutation persists until synced, every conflict persists
//! forever (audit trail). The engine consumes the two traits defined here;
//! [`SqliteStore`] implements both over a single database file and is the
//! store used in production and (via `open_in_memory`) in tests.
//!
//! All trait methods are blocking. Async callers run them on the blocking
//! thread pool.

mod error;
mod sqlite;

pub use error::{StoreError, StoreResult};
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use driftline_types::{
    ConflictId, DeviceId, QueueItem, QueueItemId, QueueStats, SyncConflict, UserId,
};

/// Persistence operations over [`QueueItem`] rows.
pub trait QueueStore: Send + Sync {
    /// Appends a queue item.
    fn enqueue(&self, item: &QueueItem) -> StoreResult<()>;

    /// Fetches a queue item by id.
    fn get(&self, id: &QueueItemId) -> StoreResult<Option<QueueItem>>;

    /// Returns up to `limit` unsynced items for the (user, device), oldest
    /// client timestamp first. When `include_retries` is false only fresh
    /// items (`attempts == 0`) are returned. When `max_attempts` is set,
    /// items at or past the cutoff are excluded.
    fn pending(
        &self,
        user: &UserId,
        device: &DeviceId,
        limit: usize,
        include_retries: bool,
        max_attempts: Option<u32>,
    ) -> StoreResult<Vec<QueueItem>>;

    /// Overwrites the attempt counter and last-error text. Passing no error
    /// clears the previous one (each attempt starts clean). Does not change
    /// `synced`.
    fn update_attempts(
        &self,
        id: &QueueItemId,
        attempts: u32,
        error: Option<&str>,
    ) -> StoreResult<()>;

    /// Marks an item synced at the given time.
    fn mark_synced(&self, id: &QueueItemId, at: DateTime<Utc>) -> StoreResult<()>;

    /// Flags an item conflict-detected without altering `synced`.
    fn mark_conflict(&self, id: &QueueItemId) -> StoreResult<()>;

    /// Returns unsynced items flagged conflict-detected for the
    /// (user, device), oldest first.
    fn conflicted(&self, user: &UserId, device: &DeviceId) -> StoreResult<Vec<QueueItem>>;

    /// Aggregate counts for the (user, device).
    fn stats(&self, user: &UserId, device: &DeviceId) -> StoreResult<QueueStats>;

    /// The latest `synced_at` among synced items for the (device,
    /// entity type), or `None` if nothing has synced yet.
    fn last_synced_at(
        &self,
        device: &DeviceId,
        entity_type: &str,
    ) -> StoreResult<Option<DateTime<Utc>>>;

    /// Distinct entity ids among synced items for the (device, entity type)
    /// whose `synced_at` is strictly after the cursor.
    fn synced_entity_ids_after(
        &self,
        device: &DeviceId,
        entity_type: &str,
        after: DateTime<Utc>,
    ) -> StoreResult<Vec<String>>;

    /// Deletes synced items whose `synced_at` is before the cutoff.
    /// Returns the number of rows removed. Conflict rows are never pruned.
    fn prune_synced(&self, before: DateTime<Utc>) -> StoreResult<usize>;
}

/// Persistence operations over [`SyncConflict`] rows.
pub trait ConflictStore: Send + Sync {
    /// Appends a conflict record.
    fn insert(&self, conflict: &SyncConflict) -> StoreResult<()>;

    /// Fetches a conflict by id.
    fn get(&self, id: &ConflictId) -> StoreResult<Option<SyncConflict>>;

    /// Overwrites a conflict's mutable fields (status, resolution,
    /// merged data, resolved-at/by) by id.
    fn update(&self, conflict: &SyncConflict) -> StoreResult<()>;

    /// The most recent conflict recorded for a queue item, if any.
    fn for_queue_item(&self, id: &QueueItemId) -> StoreResult<Option<SyncConflict>>;
}
