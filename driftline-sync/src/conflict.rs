//! Conflict detection and resolution.
//!
//! Detection is optimistic-concurrency style: the client's mutation carries
//! the timestamp (and optionally a version token) of the snapshot it was
//! based on, and the detector compares that against the server's current
//! version metadata. Both views are captured verbatim on the conflict
//! record; resolution produces the merged payload the orchestrator then
//! applies.

use crate::{run_blocking, SyncError, SyncResult};
use chrono::{DateTime, Duration, Utc};
use driftline_registry::ServiceRegistry;
use driftline_store::ConflictStore;
use driftline_types::{
    ActionType, ConflictId, ConflictStatus, QueueItem, Resolution, SyncConflict, UserId,
    VersionSnapshot,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

/// Decides whether a queued mutation diverged from current server state.
pub struct ConflictDetector {
    registry: Arc<ServiceRegistry>,
    /// A checksum mismatch only counts as a conflict when server update and
    /// client mutation landed within this window of each other; outside it,
    /// a later client timestamp is an intentional overwrite, not a race.
    checksum_window: Duration,
}

impl ConflictDetector {
    /// Creates a detector over the given registry.
    pub fn new(registry: Arc<ServiceRegistry>, checksum_window: Duration) -> Self {
        Self {
            registry,
            checksum_window,
        }
    }

    /// Checks one queued mutation against current server state.
    ///
    /// Creates and reads can never conflict: a create targets an entity the
    /// server has not seen, and a read has no write semantics to reconcile.
    /// For the rest, divergence is judged by server version metadata when
    /// the entity service provides it, falling back to the server payload's
    /// own `updatedAt`/`updated_at` field otherwise.
    pub async fn detect(&self, item: &QueueItem) -> SyncResult<Option<SyncConflict>> {
        if matches!(item.action, ActionType::Create | ActionType::Read) {
            return Ok(None);
        }

        let service = self.registry.get(&item.entity_type)?;

        let Some(server_data) = service.find_by_id(&item.entity_id).await? else {
            if item.action == ActionType::Update {
                // Deleted server-side while the client edited it.
                info!(
                    "update/delete conflict on {}/{}: entity gone server-side",
                    item.entity_type, item.entity_id
                );
                let conflict = SyncConflict::new(
                    item,
                    client_snapshot(item),
                    VersionSnapshot::new(Value::Null, Utc::now(), "system"),
                );
                return Ok(Some(conflict));
            }
            // Nothing to reconcile against.
            return Ok(None);
        };

        let version = service.get_version(&item.entity_id).await?;

        let diverged = match &version {
            None => payload_updated_at(&server_data)
                .is_some_and(|server_ts| server_ts > item.timestamp),
            Some(v) => {
                if v.updated_at > item.timestamp {
                    true
                } else if stale_lock_token(&item.data, v.version) {
                    true
                } else if let Some(server_checksum) = &v.checksum {
                    payload_checksum(&item.data) != *server_checksum
                        && item.timestamp - v.updated_at < self.checksum_window
                } else {
                    false
                }
            }
        };

        if !diverged {
            return Ok(None);
        }

        let server_ts = version
            .as_ref()
            .map(|v| v.updated_at)
            .or_else(|| payload_updated_at(&server_data))
            .unwrap_or_else(Utc::now);
        let server_by = version
            .as_ref()
            .map(|v| v.updated_by.clone())
            .unwrap_or_else(|| "server".to_string());

        debug!(
            "conflict on {}/{}: server at {}, client at {}",
            item.entity_type, item.entity_id, server_ts, item.timestamp
        );

        let conflict = SyncConflict::new(
            item,
            client_snapshot(item),
            VersionSnapshot::new(server_data, server_ts, server_by),
        );
        Ok(Some(conflict))
    }
}

fn client_snapshot(item: &QueueItem) -> VersionSnapshot {
    VersionSnapshot::new(item.data.clone(), item.timestamp, item.user_id.to_string())
}

/// Reads the server payload's own last-write timestamp, for entity services
/// that keep no version metadata. Accepts RFC 3339 strings and integer
/// epoch milliseconds under `updatedAt` or `updated_at`.
fn payload_updated_at(data: &Value) -> Option<DateTime<Utc>> {
    let field = data.get("updatedAt").or_else(|| data.get("updated_at"))?;
    parse_timestamp(field)
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if let Some(s) = value.as_str() {
        return DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc));
    }
    value.as_i64().and_then(DateTime::from_timestamp_millis)
}

/// True if the client payload carries an optimistic-lock token older than
/// the server's version counter.
fn stale_lock_token(data: &Value, server_version: i64) -> bool {
    data.get("version")
        .and_then(Value::as_i64)
        .is_some_and(|client_version| client_version < server_version)
}

/// Order-independent digest of a payload: SHA-256 over the top-level
/// entries sorted by key. Only ever compared against a checksum computed
/// the same way; the exact bit pattern is not a compatibility surface.
pub fn payload_checksum(data: &Value) -> String {
    let mut hasher = Sha256::new();
    match data.as_object() {
        Some(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by_key(|(key, _)| key.as_str());
            for (key, value) in entries {
                hasher.update(key.as_bytes());
                hasher.update(b"=");
                hasher.update(value.to_string().as_bytes());
                hasher.update(b"\n");
            }
        }
        None => hasher.update(data.to_string().as_bytes()),
    }
    hex::encode(hasher.finalize())
}

/// Applies resolution strategies to pending conflicts.
pub struct ConflictResolver {
    conflicts: Arc<dyn ConflictStore>,
}

impl ConflictResolver {
    /// Creates a resolver over the given conflict store.
    pub fn new(conflicts: Arc<dyn ConflictStore>) -> Self {
        Self { conflicts }
    }

    /// Resolves a pending conflict under the given strategy.
    ///
    /// The returned record carries the `merged_data` the orchestrator
    /// applies to the entity. Manual resolution requires a caller-supplied
    /// payload and leaves the conflict pending when it is missing;
    /// resolving twice is an error.
    pub async fn resolve(
        &self,
        user: &UserId,
        conflict_id: ConflictId,
        resolution: Resolution,
        merged_data: Option<Value>,
    ) -> SyncResult<SyncConflict> {
        let conflicts = self.conflicts.clone();
        let mut conflict = run_blocking(move || conflicts.get(&conflict_id))
            .await?
            .ok_or(SyncError::ConflictNotFound(conflict_id))?;

        if conflict.is_resolved() {
            return Err(SyncError::AlreadyResolved(conflict_id));
        }

        let merged = match resolution {
            Resolution::ClientWins => conflict.client.data.clone(),
            Resolution::ServerWins => conflict.server.data.clone(),
            Resolution::Merge => merged_data
                .unwrap_or_else(|| auto_merge(&conflict.server.data, &conflict.client.data)),
            Resolution::Manual => merged_data.ok_or(SyncError::MissingMergedData)?,
        };

        conflict.status = ConflictStatus::Resolved;
        conflict.resolution = Some(resolution);
        conflict.merged_data = Some(merged);
        conflict.resolved_at = Some(Utc::now());
        conflict.resolved_by = Some(user.to_string());

        let conflicts = self.conflicts.clone();
        let stored = conflict.clone();
        run_blocking(move || conflicts.update(&stored)).await?;

        info!(
            "conflict {} on {}/{} resolved as {} by {}",
            conflict.id, conflict.entity_type, conflict.entity_id, resolution, user
        );
        Ok(conflict)
    }
}

/// Field-level automatic merge: start from server data, prefer the client
/// value where the server value is null or absent, prefer the later
/// timestamp for date-like fields, union arrays present on both sides.
/// Everything else keeps the server value.
pub(crate) fn auto_merge(server: &Value, client: &Value) -> Value {
    let (Some(server_map), Some(client_map)) = (server.as_object(), client.as_object()) else {
        // Non-object payloads have no fields to reconcile.
        return if server.is_null() {
            client.clone()
        } else {
            server.clone()
        };
    };

    let mut merged = server_map.clone();
    for (key, client_value) in client_map {
        match server_map.get(key) {
            None => {
                merged.insert(key.clone(), client_value.clone());
            }
            Some(server_value) if server_value.is_null() => {
                merged.insert(key.clone(), client_value.clone());
            }
            Some(server_value) if is_date_field(key) => {
                let client_ts = parse_timestamp(client_value);
                let server_ts = parse_timestamp(server_value);
                if let (Some(client_ts), Some(server_ts)) = (client_ts, server_ts) {
                    if client_ts > server_ts {
                        merged.insert(key.clone(), client_value.clone());
                    }
                }
            }
            Some(server_value) => {
                if let (Some(server_items), Some(client_items)) =
                    (server_value.as_array(), client_value.as_array())
                {
                    let mut union = server_items.clone();
                    for item in client_items {
                        if !union.contains(item) {
                            union.push(item.clone());
                        }
                    }
                    merged.insert(key.clone(), Value::Array(union));
                }
                // Scalar disagreement: the server value stands.
            }
        }
    }
    Value::Object(merged)
}

fn is_date_field(key: &str) -> bool {
    key.contains("Date") || key.ends_with("At") || key.ends_with("_at")
}
