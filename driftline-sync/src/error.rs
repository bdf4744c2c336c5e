//! Error types for the sync engine.

use driftline_registry::{RegistryError, ServiceError};
use driftline_store::StoreError;
use driftline_types::{ConflictId, QueueItemId};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
///
/// Inside `sync_pending_actions` these are per-item: they are recorded on
/// the queue item and reported in the batch result without aborting sibling
/// items. Inside `batch_sync` any of them fails the whole batch.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No entity service registered for the item's type.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The entity service rejected or failed the operation.
    #[error("entity service error: {0}")]
    Service(#[from] ServiceError),

    /// The payload failed the service's shape check; no mutation was attempted.
    #[error("payload validation failed for entity type: {0}")]
    Validation(String),

    /// Queue or conflict persistence failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Queue item not found.
    #[error("queue item not found: {0}")]
    QueueItemNotFound(QueueItemId),

    /// Conflict not found.
    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    /// The conflict was already resolved; conflicts resolve exactly once.
    #[error("conflict already resolved: {0}")]
    AlreadyResolved(ConflictId),

    /// Manual resolution requires a caller-supplied merged payload.
    #[error("manual resolution requires merged data")]
    MissingMergedData,

    /// An unresolvable conflict inside an all-or-nothing batch.
    #[error("conflict detected for item {0} in atomic batch")]
    BatchConflict(QueueItemId),

    /// A blocking store task panicked.
    #[error("blocking task failed: {0}")]
    TaskJoin(String),
}
