//! SQLite-backed queue and conflict stores.
//!
//! One database file holds both tables. Timestamps are stored as integer
//! milliseconds since the Unix epoch so range filters and ordering happen
//! in SQL; payloads are stored as JSON text.

use crate::{ConflictStore, QueueStore, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use driftline_types::{
    ActionType, ConflictId, ConflictStatus, DeviceId, QueueItem, QueueItemId, QueueStats,
    Resolution, SyncConflict, UserId, VersionSnapshot,
};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Persistent store for queue items and conflicts backed by SQLite.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) a store at the given path.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sync_queue (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                action TEXT NOT NULL,
                data TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                synced INTEGER NOT NULL DEFAULT 0,
                synced_at INTEGER,
                conflict_detected INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_queue_owner
                ON sync_queue(user_id, device_id, synced);

            CREATE INDEX IF NOT EXISTS idx_queue_watermark
                ON sync_queue(device_id, entity_type, synced, synced_at);

            CREATE INDEX IF NOT EXISTS idx_queue_timestamp
                ON sync_queue(timestamp);

            CREATE TABLE IF NOT EXISTS sync_conflicts (
                id TEXT PRIMARY KEY,
                queue_item_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                client_data TEXT NOT NULL,
                client_timestamp INTEGER NOT NULL,
                client_user TEXT NOT NULL,
                server_data TEXT NOT NULL,
                server_timestamp INTEGER NOT NULL,
                server_user TEXT NOT NULL,
                status TEXT NOT NULL,
                resolution TEXT,
                merged_data TEXT,
                resolved_at INTEGER,
                resolved_by TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_conflicts_item
                ON sync_conflicts(queue_item_id);

            CREATE INDEX IF NOT EXISTS idx_conflicts_status
                ON sync_conflicts(status);
            ",
        )?;
        Ok(())
    }
}

const QUEUE_COLUMNS: &str = "id, user_id, device_id, entity_type, entity_id, action, data, \
     timestamp, attempts, synced, synced_at, conflict_detected, last_error";

const CONFLICT_COLUMNS: &str = "id, queue_item_id, entity_type, entity_id, \
     client_data, client_timestamp, client_user, \
     server_data, server_timestamp, server_user, \
     status, resolution, merged_data, resolved_at, resolved_by";

/// Raw column values of one `sync_queue` row, before decoding.
struct QueueRow {
    id: String,
    user_id: String,
    device_id: String,
    entity_type: String,
    entity_id: String,
    action: String,
    data: String,
    timestamp: i64,
    attempts: i64,
    synced: bool,
    synced_at: Option<i64>,
    conflict_detected: bool,
    last_error: Option<String>,
}

impl QueueRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            device_id: row.get(2)?,
            entity_type: row.get(3)?,
            entity_id: row.get(4)?,
            action: row.get(5)?,
            data: row.get(6)?,
            timestamp: row.get(7)?,
            attempts: row.get(8)?,
            synced: row.get(9)?,
            synced_at: row.get(10)?,
            conflict_detected: row.get(11)?,
            last_error: row.get(12)?,
        })
    }

    fn decode(self) -> StoreResult<QueueItem> {
        Ok(QueueItem {
            id: parse_id::<QueueItemId>(&self.id)?,
            user_id: parse_id::<UserId>(&self.user_id)?,
            device_id: parse_id::<DeviceId>(&self.device_id)?,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            action: self
                .action
                .parse::<ActionType>()
                .map_err(|e| StoreError::InvalidData(e.to_string()))?,
            data: serde_json::from_str(&self.data)?,
            timestamp: from_millis(self.timestamp)?,
            attempts: self.attempts as u32,
            synced: self.synced,
            synced_at: self.synced_at.map(from_millis).transpose()?,
            conflict_detected: self.conflict_detected,
            last_error: self.last_error,
        })
    }
}

/// Raw column values of one `sync_conflicts` row, before decoding.
struct ConflictRow {
    id: String,
    queue_item_id: String,
    entity_type: String,
    entity_id: String,
    client_data: String,
    client_timestamp: i64,
    client_user: String,
    server_data: String,
    server_timestamp: i64,
    server_user: String,
    status: String,
    resolution: Option<String>,
    merged_data: Option<String>,
    resolved_at: Option<i64>,
    resolved_by: Option<String>,
}

impl ConflictRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            queue_item_id: row.get(1)?,
            entity_type: row.get(2)?,
            entity_id: row.get(3)?,
            client_data: row.get(4)?,
            client_timestamp: row.get(5)?,
            client_user: row.get(6)?,
            server_data: row.get(7)?,
            server_timestamp: row.get(8)?,
            server_user: row.get(9)?,
            status: row.get(10)?,
            resolution: row.get(11)?,
            merged_data: row.get(12)?,
            resolved_at: row.get(13)?,
            resolved_by: row.get(14)?,
        })
    }

    fn decode(self) -> StoreResult<SyncConflict> {
        Ok(SyncConflict {
            id: parse_id::<ConflictId>(&self.id)?,
            queue_item_id: parse_id::<QueueItemId>(&self.queue_item_id)?,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            client: VersionSnapshot {
                data: serde_json::from_str(&self.client_data)?,
                timestamp: from_millis(self.client_timestamp)?,
                user_id: self.client_user,
            },
            server: VersionSnapshot {
                data: serde_json::from_str(&self.server_data)?,
                timestamp: from_millis(self.server_timestamp)?,
                user_id: self.server_user,
            },
            status: self
                .status
                .parse::<ConflictStatus>()
                .map_err(|e| StoreError::InvalidData(e.to_string()))?,
            resolution: self
                .resolution
                .as_deref()
                .map(str::parse::<Resolution>)
                .transpose()
                .map_err(|e| StoreError::InvalidData(e.to_string()))?,
            merged_data: self
                .merged_data
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            resolved_at: self.resolved_at.map(from_millis).transpose()?,
            resolved_by: self.resolved_by,
        })
    }
}

impl QueueStore for SqliteStore {
    fn enqueue(&self, item: &QueueItem) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_queue (id, user_id, device_id, entity_type, entity_id, action, \
             data, timestamp, attempts, synced, synced_at, conflict_detected, last_error) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                item.id.to_string(),
                item.user_id.to_string(),
                item.device_id.to_string(),
                item.entity_type,
                item.entity_id,
                item.action.as_str(),
                serde_json::to_string(&item.data)?,
                item.timestamp.timestamp_millis(),
                item.attempts,
                item.synced,
                item.synced_at.map(|t| t.timestamp_millis()),
                item.conflict_detected,
                item.last_error,
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &QueueItemId) -> StoreResult<Option<QueueItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM sync_queue WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![id.to_string()], QueueRow::read)?;
        rows.next().transpose()?.map(QueueRow::decode).transpose()
    }

    fn pending(
        &self,
        user: &UserId,
        device: &DeviceId,
        limit: usize,
        include_retries: bool,
        max_attempts: Option<u32>,
    ) -> StoreResult<Vec<QueueItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM sync_queue \
             WHERE user_id = ?1 AND device_id = ?2 AND synced = 0 \
               AND (?3 OR attempts = 0) \
               AND (?4 IS NULL OR attempts < ?4) \
             ORDER BY timestamp ASC \
             LIMIT ?5"
        ))?;
        let rows = stmt.query_map(
            params![
                user.to_string(),
                device.to_string(),
                include_retries,
                max_attempts,
                limit as i64,
            ],
            QueueRow::read,
        )?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?.decode()?);
        }
        Ok(items)
    }

    fn update_attempts(
        &self,
        id: &QueueItemId,
        attempts: u32,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE sync_queue SET attempts = ?1, last_error = ?2 WHERE id = ?3",
            params![attempts, error, id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn mark_synced(&self, id: &QueueItemId, at: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE sync_queue SET synced = 1, synced_at = ?1 WHERE id = ?2",
            params![at.timestamp_millis(), id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn mark_conflict(&self, id: &QueueItemId) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE sync_queue SET conflict_detected = 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn conflicted(&self, user: &UserId, device: &DeviceId) -> StoreResult<Vec<QueueItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM sync_queue \
             WHERE user_id = ?1 AND device_id = ?2 AND synced = 0 AND conflict_detected = 1 \
             ORDER BY timestamp ASC"
        ))?;
        let rows = stmt.query_map(
            params![user.to_string(), device.to_string()],
            QueueRow::read,
        )?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?.decode()?);
        }
        Ok(items)
    }

    fn stats(&self, user: &UserId, device: &DeviceId) -> StoreResult<QueueStats> {
        let conn = self.conn.lock().unwrap();
        let stats = conn.query_row(
            "SELECT \
                 SUM(CASE WHEN synced = 0 THEN 1 ELSE 0 END), \
                 SUM(CASE WHEN synced = 1 THEN 1 ELSE 0 END), \
                 SUM(CASE WHEN conflict_detected = 1 THEN 1 ELSE 0 END), \
                 SUM(CASE WHEN synced = 0 AND last_error IS NOT NULL THEN 1 ELSE 0 END), \
                 COUNT(*) \
             FROM sync_queue WHERE user_id = ?1 AND device_id = ?2",
            params![user.to_string(), device.to_string()],
            |row| {
                Ok(QueueStats {
                    pending: row.get::<_, Option<i64>>(0)?.unwrap_or(0) as usize,
                    synced: row.get::<_, Option<i64>>(1)?.unwrap_or(0) as usize,
                    conflicts: row.get::<_, Option<i64>>(2)?.unwrap_or(0) as usize,
                    failed: row.get::<_, Option<i64>>(3)?.unwrap_or(0) as usize,
                    total: row.get::<_, i64>(4)? as usize,
                })
            },
        )?;
        Ok(stats)
    }

    fn last_synced_at(
        &self,
        device: &DeviceId,
        entity_type: &str,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(synced_at) FROM sync_queue \
             WHERE device_id = ?1 AND entity_type = ?2 AND synced = 1",
            params![device.to_string(), entity_type],
            |row| row.get(0),
        )?;
        max.map(from_millis).transpose()
    }

    fn synced_entity_ids_after(
        &self,
        device: &DeviceId,
        entity_type: &str,
        after: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT entity_id FROM sync_queue \
             WHERE device_id = ?1 AND entity_type = ?2 AND synced = 1 AND synced_at > ?3 \
             ORDER BY entity_id",
        )?;
        let rows = stmt.query_map(
            params![device.to_string(), entity_type, after.timestamp_millis()],
            |row| row.get::<_, String>(0),
        )?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    fn prune_synced(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM sync_queue WHERE synced = 1 AND synced_at < ?1",
            params![before.timestamp_millis()],
        )?;
        Ok(deleted)
    }
}

impl ConflictStore for SqliteStore {
    fn insert(&self, conflict: &SyncConflict) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_conflicts (id, queue_item_id, entity_type, entity_id, \
             client_data, client_timestamp, client_user, \
             server_data, server_timestamp, server_user, \
             status, resolution, merged_data, resolved_at, resolved_by) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                conflict.id.to_string(),
                conflict.queue_item_id.to_string(),
                conflict.entity_type,
                conflict.entity_id,
                serde_json::to_string(&conflict.client.data)?,
                conflict.client.timestamp.timestamp_millis(),
                conflict.client.user_id,
                serde_json::to_string(&conflict.server.data)?,
                conflict.server.timestamp.timestamp_millis(),
                conflict.server.user_id,
                conflict.status.as_str(),
                conflict.resolution.map(|r| r.as_str()),
                conflict
                    .merged_data
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                conflict.resolved_at.map(|t| t.timestamp_millis()),
                conflict.resolved_by,
            ],
        )?;
        Ok(())
    }

    fn get(&self, id: &ConflictId) -> StoreResult<Option<SyncConflict>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![id.to_string()], ConflictRow::read)?;
        rows.next()
            .transpose()?
            .map(ConflictRow::decode)
            .transpose()
    }

    fn update(&self, conflict: &SyncConflict) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE sync_conflicts SET status = ?1, resolution = ?2, merged_data = ?3, \
             resolved_at = ?4, resolved_by = ?5 WHERE id = ?6",
            params![
                conflict.status.as_str(),
                conflict.resolution.map(|r| r.as_str()),
                conflict
                    .merged_data
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                conflict.resolved_at.map(|t| t.timestamp_millis()),
                conflict.resolved_by,
                conflict.id.to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(conflict.id.to_string()));
        }
        Ok(())
    }

    fn for_queue_item(&self, id: &QueueItemId) -> StoreResult<Option<SyncConflict>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts \
             WHERE queue_item_id = ?1 ORDER BY rowid DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query_map(params![id.to_string()], ConflictRow::read)?;
        rows.next()
            .transpose()?
            .map(ConflictRow::decode)
            .transpose()
    }
}

fn parse_id<T: std::str::FromStr>(s: &str) -> StoreResult<T>
where
    T::Err: std::fmt::Display,
{
    s.parse::<T>()
        .map_err(|e| StoreError::InvalidData(format!("invalid id {s}: {e}")))
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::InvalidData(format!("timestamp out of range: {ms}")))
}
