//! Client-originated mutations.
//!
//! A mutation is the unit of work a device submits for replay: one
//! create/update/delete/read against one entity, captured with the
//! client-side timestamp at which the device performed it locally.
//! The engine never inspects `data` beyond conflict bookkeeping; its
//! shape is owned by the entity service for `entity_type`.

use crate::{DeviceId, Error};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of operation a queued mutation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    Create,
    Update,
    Delete,
    Read,
}

impl ActionType {
    /// Stable string form used in storage columns.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Read => "READ",
        }
    }

    /// Returns true if this action writes server state.
    /// Reads have no write semantics to reconcile, so they can never conflict.
    #[must_use]
    pub const fn is_write(&self) -> bool {
        !matches!(self, Self::Read)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "READ" => Ok(Self::Read),
            other => Err(Error::InvalidValue(format!("unknown action type: {other}"))),
        }
    }
}

/// A client submission awaiting enqueue.
///
/// `entity_id` is an opaque, entity-service-defined key. For creates the
/// client generates it up front so later mutations from the same offline
/// session can reference the entity before the server has seen it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// The device that produced this mutation.
    pub device_id: DeviceId,
    /// Registry key of the owning entity service.
    pub entity_type: String,
    /// Entity-service-defined key of the target entity.
    pub entity_id: String,
    /// The operation to perform.
    pub action: ActionType,
    /// Opaque payload; shape is owned by the entity service.
    pub data: serde_json::Value,
    /// Client-side mutation time, used for conflict comparison.
    pub timestamp: DateTime<Utc>,
}

impl Mutation {
    /// Creates a mutation with the given action, timestamped now.
    #[must_use]
    pub fn new(
        device_id: DeviceId,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        action: ActionType,
        data: serde_json::Value,
    ) -> Self {
        Self {
            device_id,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            action,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Creates an entity-create mutation.
    #[must_use]
    pub fn create(
        device_id: DeviceId,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self::new(device_id, entity_type, entity_id, ActionType::Create, data)
    }

    /// Creates an entity-update mutation.
    #[must_use]
    pub fn update(
        device_id: DeviceId,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self::new(device_id, entity_type, entity_id, ActionType::Update, data)
    }

    /// Creates an entity-delete mutation.
    #[must_use]
    pub fn delete(
        device_id: DeviceId,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self::new(
            device_id,
            entity_type,
            entity_id,
            ActionType::Delete,
            serde_json::Value::Null,
        )
    }

    /// Creates an entity-read mutation (a deferred fetch).
    #[must_use]
    pub fn read(
        device_id: DeviceId,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Self {
        Self::new(
            device_id,
            entity_type,
            entity_id,
            ActionType::Read,
            serde_json::Value::Null,
        )
    }

    /// Overrides the client-side timestamp (the device's offline capture time).
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
