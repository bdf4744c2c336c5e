//! The per-entity-type capability contract.

use async_trait::async_trait;
use driftline_types::EntityVersion;
use serde_json::Value;

/// Result type for entity service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors an entity service can report.
///
/// Any of these surfaces through the orchestrator as an apply failure on
/// the single item being processed; it never aborts the rest of the batch
/// in the best-effort path.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The target entity does not exist.
    #[error("entity not found: {0}")]
    NotFound(String),

    /// The service rejected the payload on domain grounds.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The service's backing store failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// Payload could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The capability set a business domain exposes to the sync engine.
///
/// Implementations own all entity-specific behavior: persistence, payload
/// shape, version bookkeeping. The engine treats `data` as opaque and relies
/// on [`validate_data`](EntityService::validate_data) as the only shape
/// check before an apply.
///
/// All I/O-bound operations are async; the orchestrator awaits each one
/// before moving to the next queue item.
#[async_trait]
pub trait EntityService: Send + Sync + std::fmt::Debug {
    /// Creates an entity from a client payload. Returns the stored entity.
    async fn create(&self, data: &Value, actor: &str) -> ServiceResult<Value>;

    /// Updates an existing entity. Returns the stored entity.
    async fn update(&self, id: &str, data: &Value, actor: &str) -> ServiceResult<Value>;

    /// Deletes an entity.
    async fn delete(&self, id: &str, actor: &str) -> ServiceResult<()>;

    /// Fetches an entity, or `None` if it does not exist.
    async fn find_by_id(&self, id: &str) -> ServiceResult<Option<Value>>;

    /// Fetches version metadata for an entity, or `None` if the service
    /// keeps no version info (the detector then falls back to payload
    /// timestamps).
    async fn get_version(&self, id: &str) -> ServiceResult<Option<EntityVersion>>;

    /// Cheap shape check run before create/update applies.
    /// Most services accept anything their own `create`/`update` can parse.
    fn validate_data(&self, data: &Value) -> bool {
        let _ = data;
        true
    }
}
