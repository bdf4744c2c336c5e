//! Conflict records — a detected divergence between a queued mutation and
//! current server state.
//!
//! Conflicts are an audit trail: they are created by the detector, mutated
//! exactly once by the resolution step, and never deleted.

use crate::{ConflictId, Error, QueueItem, QueueItemId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One side's view of an entity at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    /// The entity payload as that side saw it.
    pub data: serde_json::Value,
    /// When that side's view was captured.
    pub timestamp: DateTime<Utc>,
    /// Who produced that view (a user id, "system", or "server").
    pub user_id: String,
}

impl VersionSnapshot {
    /// Creates a snapshot.
    #[must_use]
    pub fn new(
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            data,
            timestamp,
            user_id: user_id.into(),
        }
    }
}

/// Lifecycle state of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

impl ConflictStatus {
    /// Stable string form used in storage columns.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Resolved => "RESOLVED",
        }
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RESOLVED" => Ok(Self::Resolved),
            other => Err(Error::InvalidValue(format!(
                "unknown conflict status: {other}"
            ))),
        }
    }
}

/// How a conflict was (or should be) reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    /// The client payload replaces server state.
    ClientWins,
    /// Server state stands; the client mutation is discarded.
    ServerWins,
    /// Field-level merge of both payloads (automatic or caller-supplied).
    Merge,
    /// A human supplied the reconciled payload.
    Manual,
}

impl Resolution {
    /// Stable string form used in storage columns.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ClientWins => "CLIENT_WINS",
            Self::ServerWins => "SERVER_WINS",
            Self::Merge => "MERGE",
            Self::Manual => "MANUAL",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CLIENT_WINS" => Ok(Self::ClientWins),
            "SERVER_WINS" => Ok(Self::ServerWins),
            "MERGE" => Ok(Self::Merge),
            "MANUAL" => Ok(Self::Manual),
            other => Err(Error::InvalidValue(format!("unknown resolution: {other}"))),
        }
    }
}

/// A detected divergence between a queued mutation and server state.
///
/// `status == Resolved` implies both `resolution` and `merged_data` are
/// present; `merged_data` is what the orchestrator applies to the entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Unique identifier.
    pub id: ConflictId,

    /// The owning queue item (1:1 for the conflict's lifetime).
    pub queue_item_id: QueueItemId,

    /// Registry key of the owning entity service.
    pub entity_type: String,

    /// Entity-service-defined key of the contested entity.
    pub entity_id: String,

    /// The client's view at mutation time, captured verbatim.
    pub client: VersionSnapshot,

    /// The server's authoritative state at detection time, captured verbatim.
    pub server: VersionSnapshot,

    /// Lifecycle state.
    pub status: ConflictStatus,

    /// The strategy used to resolve, once resolved.
    pub resolution: Option<Resolution>,

    /// The reconciled payload, once resolved.
    pub merged_data: Option<serde_json::Value>,

    /// When the conflict was resolved.
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who resolved the conflict.
    pub resolved_by: Option<String>,
}

impl SyncConflict {
    /// Creates a pending conflict for a queue item, capturing both views.
    #[must_use]
    pub fn new(item: &QueueItem, client: VersionSnapshot, server: VersionSnapshot) -> Self {
        Self {
            id: ConflictId::new(),
            queue_item_id: item.id,
            entity_type: item.entity_type.clone(),
            entity_id: item.entity_id.clone(),
            client,
            server,
            status: ConflictStatus::Pending,
            resolution: None,
            merged_data: None,
            resolved_at: None,
            resolved_by: None,
        }
    }

    /// Returns true once the resolution step has run.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.status == ConflictStatus::Resolved
    }
}
