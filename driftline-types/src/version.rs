//! Server-side entity version metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version metadata for a server-side entity, served on demand by the
/// owning entity service. Read-only from the engine's perspective; the
/// engine never persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityVersion {
    /// Entity-service-defined key.
    pub id: String,
    /// Monotonic optimistic-lock counter.
    pub version: i64,
    /// When the entity was last written server-side.
    pub updated_at: DateTime<Utc>,
    /// Who performed the last server-side write.
    pub updated_by: String,
    /// Optional content digest for divergence checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}
