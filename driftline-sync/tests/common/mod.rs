//! Shared test double: a HashMap-backed entity service.
//!
//! Creates take the entity id from the payload's `"id"` field, the way a
//! client-generated-id domain service would. An op log records every write
//! so tests can assert apply order; reads are not logged (the detector
//! performs them too).

#![allow(dead_code)]

use async_trait::async_trait;
use driftline_registry::{EntityService, ServiceError, ServiceResult};
use driftline_types::EntityVersion;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default, Debug)]
pub struct MemoryEntityService {
    inner: Mutex<Inner>,
    objects_only: bool,
}

#[derive(Default, Debug)]
struct Inner {
    entities: HashMap<String, Value>,
    versions: HashMap<String, EntityVersion>,
    applied: Vec<String>,
    fail: Option<(String, String)>,
}

impl MemoryEntityService {
    pub fn new() -> Self {
        Self::default()
    }

    /// A service whose `validate_data` only accepts JSON objects.
    pub fn strict() -> Self {
        Self {
            objects_only: true,
            ..Self::default()
        }
    }

    /// Seeds server-side entity state.
    pub fn seed(&self, id: &str, data: Value) {
        self.inner
            .lock()
            .unwrap()
            .entities
            .insert(id.to_string(), data);
    }

    /// Seeds version metadata for an entity.
    pub fn seed_version(&self, version: EntityVersion) {
        self.inner
            .lock()
            .unwrap()
            .versions
            .insert(version.id.clone(), version);
    }

    /// Makes every `op` ("create"/"update"/"delete") against `id` fail.
    pub fn fail_on(&self, op: &str, id: &str) {
        self.inner.lock().unwrap().fail = Some((op.to_string(), id.to_string()));
    }

    /// Current server-side state of an entity.
    pub fn entity(&self, id: &str) -> Option<Value> {
        self.inner.lock().unwrap().entities.get(id).cloned()
    }

    /// The write log, in apply order ("create:id", "update:id", "delete:id").
    pub fn applied(&self) -> Vec<String> {
        self.inner.lock().unwrap().applied.clone()
    }

    fn check_fail(inner: &Inner, op: &str, id: &str) -> ServiceResult<()> {
        if let Some((fail_op, fail_id)) = &inner.fail {
            if fail_op == op && fail_id == id {
                return Err(ServiceError::Backend(format!(
                    "injected {op} failure for {id}"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EntityService for MemoryEntityService {
    async fn create(&self, data: &Value, _actor: &str) -> ServiceResult<Value> {
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::Rejected("payload missing id".to_string()))?
            .to_string();

        let mut inner = self.inner.lock().unwrap();
        Self::check_fail(&inner, "create", &id)?;
        inner.entities.insert(id.clone(), data.clone());
        inner.applied.push(format!("create:{id}"));
        Ok(data.clone())
    }

    async fn update(&self, id: &str, data: &Value, _actor: &str) -> ServiceResult<Value> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fail(&inner, "update", id)?;
        if !inner.entities.contains_key(id) {
            return Err(ServiceError::NotFound(id.to_string()));
        }
        inner.entities.insert(id.to_string(), data.clone());
        inner.applied.push(format!("update:{id}"));
        Ok(data.clone())
    }

    async fn delete(&self, id: &str, _actor: &str) -> ServiceResult<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::check_fail(&inner, "delete", id)?;
        inner.entities.remove(id);
        inner.applied.push(format!("delete:{id}"));
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> ServiceResult<Option<Value>> {
        Ok(self.inner.lock().unwrap().entities.get(id).cloned())
    }

    async fn get_version(&self, id: &str) -> ServiceResult<Option<EntityVersion>> {
        Ok(self.inner.lock().unwrap().versions.get(id).cloned())
    }

    fn validate_data(&self, data: &Value) -> bool {
        !self.objects_only || data.is_object()
    }
}
