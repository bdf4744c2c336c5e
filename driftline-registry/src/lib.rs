//! Entity service registry for Driftline.
//!
//! The registry is the sole seam between the generic sync machinery and
//! entity-specific business logic. Each business domain implements
//! [`EntityService`] for its entity type and registers it under that type's
//! name; the engine dispatches every apply, lookup, and version check
//! through the registered service and never special-cases a type by name.
//!
//! New entity types plug in without touching sync internals:
//!
//! ```ignore
//! let registry = ServiceRegistry::new();
//! registry.register("student", Arc::new(StudentService::new(pool)));
//! registry.register("care_plan", Arc::new(CarePlanService::new(pool)));
//! ```

mod registry;
mod service;

pub use registry::{RegistryError, ServiceRegistry};
pub use service::{EntityService, ServiceError, ServiceResult};
