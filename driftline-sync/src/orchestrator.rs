//! The sync orchestrator — drives the end-to-end replay cycle.
//!
//! Two entry points with intentionally different atomicity:
//! [`SyncOrchestrator::sync_pending_actions`] is best-effort per item (one
//! item's failure never aborts its siblings), while
//! [`SyncOrchestrator::batch_sync`] is all-or-nothing (a planning pass
//! rejects the batch before any mutation where it can, and an apply failure
//! compensates the already-applied prefix). Callers pick the
//! failure-isolation property they need.

use crate::conflict::auto_merge;
use crate::{
    run_blocking, ConflictDetector, ConflictResolver, SyncError, SyncQueue, SyncResult,
    WatermarkTracker,
};
use chrono::{DateTime, Duration, Utc};
use driftline_registry::{EntityService, ServiceRegistry};
use driftline_store::{ConflictStore, QueueStore};
use driftline_types::{
    ActionType, ConflictId, ConflictStatus, DeviceId, QueueItem, QueueItemId, Resolution,
    SyncConflict, UserId,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Engine-level configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Default number of items pulled per sync cycle.
    pub batch_size: usize,
    /// Width of the checksum concurrency window (see
    /// [`ConflictDetector`]); a tuning parameter.
    pub checksum_window_ms: u64,
    /// External retry policy: items with this many attempts are no longer
    /// pulled. `None` leaves retries unbounded.
    pub max_attempts: Option<u32>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            checksum_window_ms: 60_000,
            max_attempts: None,
        }
    }
}

/// Per-run options for a sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Overrides [`SyncConfig::batch_size`] for this run.
    pub batch_size: Option<usize>,
    /// Include items that already failed at least once.
    pub retry_failed: bool,
    /// When set (and not [`ConflictStrategy::Manual`]), detected conflicts
    /// are resolved immediately instead of being left pending.
    pub conflict_strategy: Option<ConflictStrategy>,
}

/// How the orchestrator auto-resolves conflicts found during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    /// The client payload always wins.
    ClientWins,
    /// Server state always stands.
    ServerWins,
    /// Whichever side wrote later wins, by actual timestamp comparison.
    NewestWins,
    /// Field-level automatic merge.
    Merge,
    /// Never auto-resolve; leave conflicts pending for a human.
    Manual,
}

impl ConflictStrategy {
    /// Maps the strategy onto a concrete resolution for one conflict.
    ///
    /// `NewestWins` compares the captured client and server timestamps and
    /// hands victory to whichever side wrote later (ties go to the client,
    /// whose mutation is the one being replayed).
    #[must_use]
    pub fn decide(self, conflict: &SyncConflict) -> Resolution {
        match self {
            Self::ClientWins => Resolution::ClientWins,
            Self::ServerWins => Resolution::ServerWins,
            Self::Merge => Resolution::Merge,
            Self::Manual => Resolution::Manual,
            Self::NewestWins => {
                if conflict.client.timestamp >= conflict.server.timestamp {
                    Resolution::ClientWins
                } else {
                    Resolution::ServerWins
                }
            }
        }
    }
}

/// One item's failure inside a best-effort cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    /// The failing queue item.
    pub item: QueueItemId,
    /// The recorded error text.
    pub message: String,
}

/// Counts for one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Items applied and marked synced.
    pub synced: usize,
    /// Items that errored and stayed unsynced.
    pub failed: usize,
    /// Conflicts detected this cycle (resolved or left pending).
    pub conflicts: usize,
    /// Per-item error details.
    pub errors: Vec<ItemError>,
}

enum ItemOutcome {
    Applied(DateTime<Utc>),
    ConflictPending,
    ConflictResolved(DateTime<Utc>),
}

/// What an apply did to server state; drives batch compensation.
enum AppliedEffect {
    Created(String),
    Updated { id: String, prior: Value },
    Deleted { prior: Value },
    None,
}

/// One planned apply inside an atomic batch.
struct PlannedApply {
    item: QueueItem,
    /// Resolved in-memory during planning; persisted only on commit.
    conflict: Option<SyncConflict>,
    /// Pre-apply server state, kept for compensation.
    prior: Option<Value>,
}

/// Drives sync cycles for devices.
pub struct SyncOrchestrator {
    registry: Arc<ServiceRegistry>,
    queue: SyncQueue,
    watermarks: WatermarkTracker,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    config: SyncConfig,
}

impl SyncOrchestrator {
    /// Creates an orchestrator over a registry and its backing stores.
    pub fn new(
        registry: Arc<ServiceRegistry>,
        queue_store: Arc<dyn QueueStore>,
        conflict_store: Arc<dyn ConflictStore>,
        config: SyncConfig,
    ) -> Self {
        let detector = ConflictDetector::new(
            registry.clone(),
            Duration::milliseconds(config.checksum_window_ms as i64),
        );
        Self {
            queue: SyncQueue::new(queue_store.clone(), conflict_store.clone()),
            watermarks: WatermarkTracker::new(queue_store),
            resolver: ConflictResolver::new(conflict_store),
            detector,
            registry,
            config,
        }
    }

    /// The mutation queue (for enqueueing, statistics, conflict listings).
    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    /// The watermark tracker (for change delivery and de-registration).
    pub fn watermarks(&self) -> &WatermarkTracker {
        &self.watermarks
    }

    /// The entity service registry.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Runs one best-effort sync cycle for a (user, device).
    ///
    /// Items are pulled oldest-first and processed strictly sequentially so
    /// a device's mutations apply in client-submission order. A failing
    /// item records its error and stays queued for a later cycle; siblings
    /// continue. After the cycle, the device's watermark advances per
    /// entity type to the latest `synced_at` this run produced.
    pub async fn sync_pending_actions(
        &self,
        user: &UserId,
        device: &DeviceId,
        options: SyncOptions,
    ) -> SyncResult<SyncReport> {
        let batch_size = options.batch_size.unwrap_or(self.config.batch_size);
        let items = self
            .queue
            .pending_items(
                user,
                device,
                batch_size,
                options.retry_failed,
                self.config.max_attempts,
            )
            .await?;
        info!(
            "sync cycle for {}/{}: {} pending items",
            user,
            device,
            items.len()
        );

        let mut report = SyncReport::default();
        let mut high_water: HashMap<String, DateTime<Utc>> = HashMap::new();

        for item in items {
            let attempts = item.attempts + 1;
            self.queue.update_attempts(item.id, attempts, None).await?;

            match self
                .process_item(user, &item, options.conflict_strategy)
                .await
            {
                Ok(ItemOutcome::Applied(at)) => {
                    report.synced += 1;
                    note_high_water(&mut high_water, &item.entity_type, at);
                }
                Ok(ItemOutcome::ConflictResolved(at)) => {
                    report.synced += 1;
                    report.conflicts += 1;
                    note_high_water(&mut high_water, &item.entity_type, at);
                }
                Ok(ItemOutcome::ConflictPending) => {
                    report.conflicts += 1;
                }
                Err(e) => {
                    warn!("sync of item {} failed: {e}", item.id);
                    report.failed += 1;
                    report.errors.push(ItemError {
                        item: item.id,
                        message: e.to_string(),
                    });
                    if let Err(store_err) = self
                        .queue
                        .update_attempts(item.id, attempts, Some(e.to_string()))
                        .await
                    {
                        warn!("failed to record error for item {}: {store_err}", item.id);
                    }
                }
            }
        }

        for (entity_type, at) in high_water {
            self.watermarks.update(device, &entity_type, at).await;
        }

        info!(
            "sync cycle for {}/{} done: {} synced, {} conflicts, {} failed",
            user, device, report.synced, report.conflicts, report.failed
        );
        Ok(report)
    }

    async fn process_item(
        &self,
        user: &UserId,
        item: &QueueItem,
        strategy: Option<ConflictStrategy>,
    ) -> SyncResult<ItemOutcome> {
        if let Some(detected) = self.detector.detect(item).await? {
            self.queue.mark_conflict_detected(item.id).await?;

            // A retried item may already carry a pending conflict from an
            // earlier cycle; reuse it so the item stays 1:1 with its conflict.
            let conflicts = self.queue.conflicts().clone();
            let item_id = item.id;
            let existing = run_blocking(move || conflicts.for_queue_item(&item_id)).await?;
            let conflict = match existing {
                Some(prior) if !prior.is_resolved() => prior,
                _ => {
                    let conflicts = self.queue.conflicts().clone();
                    let stored = detected.clone();
                    run_blocking(move || conflicts.insert(&stored)).await?;
                    detected
                }
            };

            let Some(strategy) = strategy else {
                return Ok(ItemOutcome::ConflictPending);
            };
            if strategy == ConflictStrategy::Manual {
                return Ok(ItemOutcome::ConflictPending);
            }

            let resolution = strategy.decide(&conflict);
            let resolved = self
                .resolver
                .resolve(user, conflict.id, resolution, None)
                .await?;
            self.apply_resolved(item, &resolved).await?;
            let at = self.queue.mark_synced(item.id).await?;
            return Ok(ItemOutcome::ConflictResolved(at));
        }

        self.apply_mutation(item).await?;
        let at = self.queue.mark_synced(item.id).await?;
        Ok(ItemOutcome::Applied(at))
    }

    /// Applies a non-conflicting mutation through the registered service.
    async fn apply_mutation(&self, item: &QueueItem) -> SyncResult<()> {
        let service = self.registry.get(&item.entity_type)?;
        let actor = item.user_id.to_string();

        match item.action {
            ActionType::Create => {
                validate(&*service, item)?;
                service.create(&item.data, &actor).await?;
            }
            ActionType::Update => {
                validate(&*service, item)?;
                service.update(&item.entity_id, &item.data, &actor).await?;
            }
            ActionType::Delete => {
                service.delete(&item.entity_id, &actor).await?;
            }
            ActionType::Read => {
                service.find_by_id(&item.entity_id).await?;
            }
        }
        debug!(
            "applied {} on {}/{}",
            item.action, item.entity_type, item.entity_id
        );
        Ok(())
    }

    /// Applies a resolution's merged payload to the entity.
    ///
    /// A delete mutation whose client side won keeps its delete semantics.
    /// Otherwise the merged payload lands as an update, a create (entity
    /// was deleted server-side and the resolution restores it), a delete
    /// (resolution says the entity should not exist), or a no-op.
    async fn apply_resolved(&self, item: &QueueItem, conflict: &SyncConflict) -> SyncResult<()> {
        let service = self.registry.get(&item.entity_type)?;
        let actor = conflict
            .resolved_by
            .clone()
            .unwrap_or_else(|| item.user_id.to_string());
        let merged = conflict.merged_data.clone().unwrap_or(Value::Null);

        if item.action == ActionType::Delete && conflict.resolution == Some(Resolution::ClientWins)
        {
            service.delete(&item.entity_id, &actor).await?;
            return Ok(());
        }

        let existing = service.find_by_id(&item.entity_id).await?;
        match (existing.is_some(), merged.is_null()) {
            (true, false) => {
                service.update(&item.entity_id, &merged, &actor).await?;
            }
            (false, false) => {
                service.create(&merged, &actor).await?;
            }
            (true, true) => {
                service.delete(&item.entity_id, &actor).await?;
            }
            (false, true) => {}
        }
        Ok(())
    }

    /// Applies a caller-supplied batch atomically.
    ///
    /// Planning rejects the whole batch before any mutation when an item
    /// cannot proceed: unregistered type, validation failure, or a conflict
    /// the run's strategy cannot resolve. The apply pass then applies every
    /// item; if one fails, the already-applied prefix is compensated in
    /// reverse order and the call fails as a whole. Queue rows (attempts,
    /// synced flags) and conflict records are written only after the entire
    /// batch has applied.
    pub async fn batch_sync(
        &self,
        user: &UserId,
        device: &DeviceId,
        items: Vec<QueueItem>,
        options: SyncOptions,
    ) -> SyncResult<SyncReport> {
        info!(
            "atomic batch for {}/{}: {} items",
            user,
            device,
            items.len()
        );

        // Plan: read-only pass over every item.
        let mut plans = Vec::with_capacity(items.len());
        for item in items {
            let service = self.registry.get(&item.entity_type)?;

            let conflict = match self.detector.detect(&item).await? {
                Some(detected) => {
                    let strategy = options
                        .conflict_strategy
                        .filter(|s| *s != ConflictStrategy::Manual)
                        .ok_or(SyncError::BatchConflict(item.id))?;
                    Some(resolve_in_memory(user, detected, strategy))
                }
                None => None,
            };

            if conflict.is_none()
                && matches!(item.action, ActionType::Create | ActionType::Update)
            {
                validate(&*service, &item)?;
            }

            let prior = service.find_by_id(&item.entity_id).await?;
            plans.push(PlannedApply {
                item,
                conflict,
                prior,
            });
        }

        // Apply: mutate server state, compensating on failure.
        let mut effects: Vec<(String, AppliedEffect)> = Vec::with_capacity(plans.len());
        for plan in &plans {
            match self.apply_planned(plan).await {
                Ok(effect) => effects.push((plan.item.entity_type.clone(), effect)),
                Err(e) => {
                    warn!(
                        "atomic batch failed on item {}: {e}; compensating {} applied items",
                        plan.item.id,
                        effects.len()
                    );
                    self.compensate(&effects).await;
                    return Err(e);
                }
            }
        }

        // Commit: queue rows, conflict records, watermark.
        let mut report = SyncReport::default();
        let mut high_water: HashMap<String, DateTime<Utc>> = HashMap::new();
        for plan in &plans {
            self.queue
                .update_attempts(plan.item.id, plan.item.attempts + 1, None)
                .await?;
            if let Some(conflict) = &plan.conflict {
                self.queue.mark_conflict_detected(plan.item.id).await?;
                let conflicts = self.queue.conflicts().clone();
                let stored = conflict.clone();
                run_blocking(move || conflicts.insert(&stored)).await?;
                report.conflicts += 1;
            }
            let at = self.queue.mark_synced(plan.item.id).await?;
            note_high_water(&mut high_water, &plan.item.entity_type, at);
            report.synced += 1;
        }
        for (entity_type, at) in high_water {
            self.watermarks.update(device, &entity_type, at).await;
        }

        info!(
            "atomic batch for {}/{} committed: {} synced, {} conflicts",
            user, device, report.synced, report.conflicts
        );
        Ok(report)
    }

    async fn apply_planned(&self, plan: &PlannedApply) -> SyncResult<AppliedEffect> {
        let item = &plan.item;
        let service = self.registry.get(&item.entity_type)?;
        let actor = item.user_id.to_string();

        if let Some(conflict) = &plan.conflict {
            let merged = conflict.merged_data.clone().unwrap_or(Value::Null);
            if item.action == ActionType::Delete
                && conflict.resolution == Some(Resolution::ClientWins)
            {
                return self.apply_delete(&*service, item, &actor, plan.prior.clone()).await;
            }
            return match (&plan.prior, merged.is_null()) {
                (Some(prior), false) => {
                    service.update(&item.entity_id, &merged, &actor).await?;
                    Ok(AppliedEffect::Updated {
                        id: item.entity_id.clone(),
                        prior: prior.clone(),
                    })
                }
                (None, false) => {
                    service.create(&merged, &actor).await?;
                    Ok(AppliedEffect::Created(item.entity_id.clone()))
                }
                (Some(_), true) => {
                    self.apply_delete(&*service, item, &actor, plan.prior.clone())
                        .await
                }
                (None, true) => Ok(AppliedEffect::None),
            };
        }

        match item.action {
            ActionType::Create => {
                service.create(&item.data, &actor).await?;
                Ok(AppliedEffect::Created(item.entity_id.clone()))
            }
            ActionType::Update => {
                let Some(prior) = plan.prior.clone() else {
                    return Err(SyncError::Service(
                        driftline_registry::ServiceError::NotFound(item.entity_id.clone()),
                    ));
                };
                service.update(&item.entity_id, &item.data, &actor).await?;
                Ok(AppliedEffect::Updated {
                    id: item.entity_id.clone(),
                    prior,
                })
            }
            ActionType::Delete => {
                self.apply_delete(&*service, item, &actor, plan.prior.clone())
                    .await
            }
            ActionType::Read => {
                service.find_by_id(&item.entity_id).await?;
                Ok(AppliedEffect::None)
            }
        }
    }

    async fn apply_delete(
        &self,
        service: &dyn EntityService,
        item: &QueueItem,
        actor: &str,
        prior: Option<Value>,
    ) -> SyncResult<AppliedEffect> {
        service.delete(&item.entity_id, actor).await?;
        match prior {
            Some(prior) => Ok(AppliedEffect::Deleted { prior }),
            None => Ok(AppliedEffect::None),
        }
    }

    /// Undoes the applied prefix of a failed atomic batch, newest first.
    /// Compensation is best effort; a failing undo is logged and skipped.
    async fn compensate(&self, effects: &[(String, AppliedEffect)]) {
        for (entity_type, effect) in effects.iter().rev() {
            let service = match self.registry.get(entity_type) {
                Ok(service) => service,
                Err(e) => {
                    warn!("cannot compensate {entity_type}: {e}");
                    continue;
                }
            };
            let result = match effect {
                AppliedEffect::Created(id) => service.delete(id, "system").await,
                AppliedEffect::Updated { id, prior } => {
                    service.update(id, prior, "system").await.map(|_| ())
                }
                AppliedEffect::Deleted { prior } => {
                    service.create(prior, "system").await.map(|_| ())
                }
                AppliedEffect::None => Ok(()),
            };
            if let Err(e) = result {
                warn!("compensation failed for {entity_type}: {e}");
            }
        }
    }

    /// Completes the manual-resolution path: resolves a pending conflict,
    /// applies the merged payload, marks the owning item synced, and
    /// advances the watermark.
    pub async fn resolve_pending_conflict(
        &self,
        user: &UserId,
        conflict_id: ConflictId,
        resolution: Resolution,
        merged_data: Option<Value>,
    ) -> SyncResult<SyncConflict> {
        let resolved = self
            .resolver
            .resolve(user, conflict_id, resolution, merged_data)
            .await?;

        let item = self
            .queue
            .item(resolved.queue_item_id)
            .await?
            .ok_or(SyncError::QueueItemNotFound(resolved.queue_item_id))?;

        self.apply_resolved(&item, &resolved).await?;
        let at = self.queue.mark_synced(item.id).await?;
        self.watermarks
            .update(&item.device_id, &item.entity_type, at)
            .await;

        Ok(resolved)
    }
}

/// Resolves a conflict in memory during batch planning; nothing is
/// persisted until the batch commits.
fn resolve_in_memory(
    user: &UserId,
    mut conflict: SyncConflict,
    strategy: ConflictStrategy,
) -> SyncConflict {
    let resolution = strategy.decide(&conflict);
    let merged = match resolution {
        Resolution::ClientWins => conflict.client.data.clone(),
        Resolution::ServerWins => conflict.server.data.clone(),
        Resolution::Merge | Resolution::Manual => {
            auto_merge(&conflict.server.data, &conflict.client.data)
        }
    };
    conflict.status = ConflictStatus::Resolved;
    conflict.resolution = Some(resolution);
    conflict.merged_data = Some(merged);
    conflict.resolved_at = Some(Utc::now());
    conflict.resolved_by = Some(user.to_string());
    conflict
}

fn validate(service: &dyn EntityService, item: &QueueItem) -> SyncResult<()> {
    if !service.validate_data(&item.data) {
        return Err(SyncError::Validation(item.entity_type.clone()));
    }
    Ok(())
}

fn note_high_water(
    high_water: &mut HashMap<String, DateTime<Utc>>,
    entity_type: &str,
    at: DateTime<Utc>,
) {
    high_water
        .entry(entity_type.to_string())
        .and_modify(|current| {
            if at > *current {
                *current = at;
            }
        })
        .or_insert(at);
}
