//! Runtime map from entity-type name to its service.

use crate::EntityService;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Errors that can occur during registry lookups.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No service is registered for the entity type.
    #[error("no entity service registered for type: {0}")]
    NotRegistered(String),
}

/// Maps entity-type names to their capability objects.
///
/// Registration normally happens once at startup, one call per domain
/// module; lookups happen on every sync step. Re-registering a type
/// replaces the previous service.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn EntityService>>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service under an entity-type name.
    pub fn register(&self, entity_type: impl Into<String>, service: Arc<dyn EntityService>) {
        let entity_type = entity_type.into();
        debug!("registering entity service for type {entity_type}");
        self.services
            .write()
            .unwrap()
            .insert(entity_type, service);
    }

    /// Looks up the service for an entity type.
    pub fn get(&self, entity_type: &str) -> Result<Arc<dyn EntityService>, RegistryError> {
        self.services
            .read()
            .unwrap()
            .get(entity_type)
            .cloned()
            .ok_or_else(|| RegistryError::NotRegistered(entity_type.to_string()))
    }

    /// Returns true if a service is registered for the entity type.
    pub fn has(&self, entity_type: &str) -> bool {
        self.services.read().unwrap().contains_key(entity_type)
    }

    /// Returns the registered entity-type names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut types: Vec<String> = self.services.read().unwrap().keys().cloned().collect();
        types.sort();
        types
    }
}
