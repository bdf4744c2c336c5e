//! Core type definitions for Driftline.
//!
//! This crate defines the fundamental, domain-agnostic types used throughout
//! the sync engine:
//! - Device, user, queue-item and conflict identifiers (UUID v7)
//! - Client mutations and their action types
//! - Queue items (one pending or completed client mutation)
//! - Conflicts (a detected divergence between client and server state)
//! - Entity version metadata served by domain services
//!
//! Domain-specific entity shapes (students, charts, contacts, ...) never
//! appear here; payloads are opaque `serde_json::Value`s validated by the
//! owning entity service.

mod conflict;
mod ids;
mod mutation;
mod queue;
mod version;

pub use conflict::{ConflictStatus, Resolution, SyncConflict, VersionSnapshot};
pub use ids::{ConflictId, DeviceId, QueueItemId, UserId};
pub use mutation::{ActionType, Mutation};
pub use queue::{QueueItem, QueueStats};
pub use version::EntityVersion;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}
