//! Queue items — one pending or completed client mutation each.

use crate::{ActionType, DeviceId, Mutation, QueueItemId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One client mutation in the sync queue.
///
/// Created on enqueue, mutated by the orchestrator during sync attempts,
/// terminal once `synced` is set (or abandoned past the caller's retry
/// cutoff). `synced == true` always implies `synced_at` is present;
/// `attempts` only ever increases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique identifier, immutable for the item's lifetime.
    pub id: QueueItemId,

    /// The owning user.
    pub user_id: UserId,

    /// The device that submitted the mutation.
    pub device_id: DeviceId,

    /// Registry key of the owning entity service.
    pub entity_type: String,

    /// Entity-service-defined key of the target entity.
    pub entity_id: String,

    /// The operation to perform.
    pub action: ActionType,

    /// Opaque payload as submitted by the client.
    pub data: serde_json::Value,

    /// Client-side mutation time, used for conflict comparison.
    pub timestamp: DateTime<Utc>,

    /// Number of sync attempts so far; incremented on every attempt.
    pub attempts: u32,

    /// Whether the mutation has been applied to server state.
    pub synced: bool,

    /// When the mutation was applied. Present iff `synced`.
    pub synced_at: Option<DateTime<Utc>>,

    /// Whether a conflict was detected on some attempt.
    pub conflict_detected: bool,

    /// Error text from the most recent failed attempt.
    pub last_error: Option<String>,
}

impl QueueItem {
    /// Creates a fresh, unsynced queue item from a client mutation.
    #[must_use]
    pub fn new(user_id: UserId, mutation: Mutation) -> Self {
        Self {
            id: QueueItemId::new(),
            user_id,
            device_id: mutation.device_id,
            entity_type: mutation.entity_type,
            entity_id: mutation.entity_id,
            action: mutation.action,
            data: mutation.data,
            timestamp: mutation.timestamp,
            attempts: 0,
            synced: false,
            synced_at: None,
            conflict_detected: false,
            last_error: None,
        }
    }

    /// Returns true if this item is still awaiting a successful sync.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.synced
    }
}

/// Aggregate queue counts for one (user, device), for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Items not yet synced.
    pub pending: usize,
    /// Items applied to server state.
    pub synced: usize,
    /// Items with a conflict detected on some attempt.
    pub conflicts: usize,
    /// Unsynced items whose last attempt recorded an error.
    pub failed: usize,
    /// All items for the (user, device).
    pub total: usize,
}
