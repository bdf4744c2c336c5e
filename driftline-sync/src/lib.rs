//! Offline mutation replay engine for Driftline.
//!
//! A device accumulates mutations while disconnected and replays them
//! against server state that may have moved on in the meantime. This crate
//! drives that replay: queueing, watermark-based change delivery,
//! optimistic-concurrency conflict detection, and conflict resolution.
//! Entity-specific apply logic stays behind the
//! [`ServiceRegistry`](driftline_registry::ServiceRegistry) seam.
//!
//! # Components
//!
//! - **[`SyncQueue`]**: durable, ordered queue of pending client mutations
//!   per device, with attempt counts and statistics
//! - **[`WatermarkTracker`]**: per (device, entity-type) cursor over the
//!   last-synced timestamp, used to report server-side changes a
//!   reconnecting device has not yet pulled
//! - **[`ConflictDetector`] / [`ConflictResolver`]**: decide whether a
//!   queued mutation diverged from server state, capture both versions, and
//!   reconcile them under a chosen strategy
//! - **[`SyncOrchestrator`]**: the end-to-end cycle — pull a batch, detect,
//!   resolve or defer, apply, mark synced, advance the watermark
//!
//! # Sync cycle
//!
//! 1. **Pull**: oldest-first pending mutations for the (user, device)
//! 2. **Detect**: compare each mutation against current server state
//! 3. **Resolve**: auto-resolve under the run's strategy, or leave the
//!    conflict pending for manual resolution
//! 4. **Apply**: dispatch through the registered entity service
//! 5. **Advance**: mark items synced and move the device's watermark
//!
//! Items are processed strictly sequentially so a device's mutations apply
//! in client-submission order (a CREATE must land before an UPDATE that
//! targets it).

mod conflict;
mod error;
mod orchestrator;
mod queue;
mod watermark;

pub use conflict::{payload_checksum, ConflictDetector, ConflictResolver};
pub use error::{SyncError, SyncResult};
pub use orchestrator::{
    ConflictStrategy, ItemError, SyncConfig, SyncOptions, SyncOrchestrator, SyncReport,
};
pub use queue::SyncQueue;
pub use watermark::{Watermark, WatermarkTracker};

/// Runs a blocking store closure on the blocking thread pool.
pub(crate) async fn run_blocking<T, F>(f: F) -> SyncResult<T>
where
    F: FnOnce() -> Result<T, driftline_store::StoreError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => Ok(result?),
        Err(e) => Err(SyncError::TaskJoin(e.to_string())),
    }
}
