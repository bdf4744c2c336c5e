mod common;

use chrono::{DateTime, TimeZone, Utc};
use common::MemoryEntityService;
use driftline_registry::ServiceRegistry;
use driftline_store::{ConflictStore, SqliteStore};
use driftline_sync::{ConflictStrategy, SyncConfig, SyncError, SyncOptions, SyncOrchestrator};
use driftline_types::{
    ConflictStatus, DeviceId, EntityVersion, Mutation, QueueItem, Resolution, UserId,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;

fn ts(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 11, 3, 9, minute, 0).unwrap()
}

struct Harness {
    service: Arc<MemoryEntityService>,
    store: Arc<SqliteStore>,
    orchestrator: SyncOrchestrator,
    user: UserId,
    device: DeviceId,
}

fn harness() -> Harness {
    harness_with(MemoryEntityService::new())
}

fn harness_with(service: MemoryEntityService) -> Harness {
    let service = Arc::new(service);
    let registry = Arc::new(ServiceRegistry::new());
    registry.register("student", service.clone());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let orchestrator = SyncOrchestrator::new(
        registry,
        store.clone(),
        store.clone(),
        SyncConfig::default(),
    );
    Harness {
        service,
        store,
        orchestrator,
        user: UserId::new(),
        device: DeviceId::new(),
    }
}

impl Harness {
    async fn enqueue(&self, mutation: Mutation) -> QueueItem {
        self.orchestrator
            .queue()
            .enqueue(self.user, mutation)
            .await
            .unwrap()
    }

    fn create(&self, entity_id: &str, data: Value, minute: u32) -> Mutation {
        Mutation::create(self.device, "student", entity_id, data).with_timestamp(ts(minute))
    }

    fn update(&self, entity_id: &str, data: Value, minute: u32) -> Mutation {
        Mutation::update(self.device, "student", entity_id, data).with_timestamp(ts(minute))
    }

    fn delete(&self, entity_id: &str, minute: u32) -> Mutation {
        Mutation::delete(self.device, "student", entity_id).with_timestamp(ts(minute))
    }

    async fn sync(&self, options: SyncOptions) -> driftline_sync::SyncReport {
        self.orchestrator
            .sync_pending_actions(&self.user, &self.device, options)
            .await
            .unwrap()
    }

    async fn item(&self, id: driftline_types::QueueItemId) -> QueueItem {
        self.orchestrator.queue().item(id).await.unwrap().unwrap()
    }

    /// Seeds a conflicting server state: entity `{name: "B"}` written at
    /// `ts(10)` under version 2, so any client update captured before then
    /// diverges.
    fn seed_conflicting_server_state(&self, entity_id: &str) {
        self.service
            .seed(entity_id, json!({"id": entity_id, "name": "B"}));
        self.service.seed_version(EntityVersion {
            id: entity_id.to_string(),
            version: 2,
            updated_at: ts(10),
            updated_by: "server".to_string(),
            checksum: None,
        });
    }
}

// ── Best-effort cycle ────────────────────────────────────────────

#[tokio::test]
async fn applies_items_in_submission_order() {
    let h = harness();
    let a = h
        .enqueue(h.create("s-1", json!({"id": "s-1", "name": "Ada"}), 0))
        .await;
    let b = h
        .enqueue(h.update("s-1", json!({"id": "s-1", "name": "Ada L."}), 1))
        .await;
    let c = h
        .enqueue(h.create("s-2", json!({"id": "s-2", "name": "Grace"}), 2))
        .await;

    let report = h.sync(SyncOptions::default()).await;
    assert_eq!(report.synced, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.conflicts, 0);
    assert!(report.errors.is_empty());

    assert_eq!(
        h.service.applied(),
        vec!["create:s-1", "update:s-1", "create:s-2"]
    );

    for id in [a.id, b.id, c.id] {
        let item = h.item(id).await;
        assert!(item.synced);
        assert!(item.synced_at.is_some());
        assert_eq!(item.attempts, 1);
    }
}

#[tokio::test]
async fn rerunning_after_success_is_a_noop() {
    let h = harness();
    h.enqueue(h.create("s-1", json!({"id": "s-1"}), 0)).await;
    h.sync(SyncOptions::default()).await;

    let report = h
        .sync(SyncOptions {
            retry_failed: true,
            ..SyncOptions::default()
        })
        .await;
    assert_eq!(report.synced, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(report.conflicts, 0);
}

#[tokio::test]
async fn creates_sync_despite_concurrent_server_activity() {
    let h = harness();
    h.seed_conflicting_server_state("s-1");

    h.enqueue(h.create("s-1", json!({"id": "s-1", "name": "Ada"}), 0))
        .await;
    let report = h.sync(SyncOptions::default()).await;
    assert_eq!(report.synced, 1);
    assert_eq!(report.conflicts, 0);
}

#[tokio::test]
async fn reads_sync_without_writes() {
    let h = harness();
    h.service.seed("s-1", json!({"id": "s-1"}));
    let item = h
        .enqueue(Mutation::read(h.device, "student", "s-1").with_timestamp(ts(0)))
        .await;

    let report = h.sync(SyncOptions::default()).await;
    assert_eq!(report.synced, 1);
    assert!(h.service.applied().is_empty());
    assert!(h.item(item.id).await.synced);
}

// ── Conflict paths ───────────────────────────────────────────────

#[tokio::test]
async fn conflicting_update_stays_pending_without_a_strategy() {
    let h = harness();
    h.seed_conflicting_server_state("s-1");
    let item = h.enqueue(h.update("s-1", json!({"name": "A"}), 5)).await;

    let report = h.sync(SyncOptions::default()).await;
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.synced, 0);
    assert_eq!(report.failed, 0);

    let stored = h.item(item.id).await;
    assert!(!stored.synced);
    assert!(stored.conflict_detected);
    assert_eq!(stored.attempts, 1);

    let pending = h
        .orchestrator
        .queue()
        .pending_conflicts(&h.user, &h.device)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    let (owner, conflict) = &pending[0];
    assert_eq!(owner.id, item.id);
    assert_eq!(conflict.client.data["name"], "A");
    assert_eq!(conflict.server.data["name"], "B");
    assert_eq!(conflict.status, ConflictStatus::Pending);

    // Server state is untouched while the conflict is pending.
    assert_eq!(h.service.entity("s-1").unwrap()["name"], "B");
    assert!(h.service.applied().is_empty());
}

#[tokio::test]
async fn server_wins_resolution_applies_end_to_end() {
    let h = harness();
    h.seed_conflicting_server_state("s-1");
    let item = h.enqueue(h.update("s-1", json!({"name": "A"}), 5)).await;
    h.sync(SyncOptions::default()).await;

    let (_, conflict) = h
        .orchestrator
        .queue()
        .pending_conflicts(&h.user, &h.device)
        .await
        .unwrap()
        .remove(0);

    let resolved = h
        .orchestrator
        .resolve_pending_conflict(&h.user, conflict.id, Resolution::ServerWins, None)
        .await
        .unwrap();
    assert_eq!(resolved.merged_data.as_ref().unwrap()["name"], "B");

    let stored = h.item(item.id).await;
    assert!(stored.synced);
    assert_eq!(h.service.entity("s-1").unwrap()["name"], "B");

    let remaining = h
        .orchestrator
        .queue()
        .pending_conflicts(&h.user, &h.device)
        .await
        .unwrap();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn client_wins_strategy_auto_resolves_during_the_cycle() {
    let h = harness();
    h.seed_conflicting_server_state("s-1");
    let item = h.enqueue(h.update("s-1", json!({"name": "A"}), 5)).await;

    let report = h
        .sync(SyncOptions {
            conflict_strategy: Some(ConflictStrategy::ClientWins),
            ..SyncOptions::default()
        })
        .await;
    assert_eq!(report.synced, 1);
    assert_eq!(report.conflicts, 1);

    assert_eq!(h.service.entity("s-1").unwrap()["name"], "A");
    assert!(h.item(item.id).await.synced);

    // The conflict is kept as a resolved audit record.
    let audit = h.store.for_queue_item(&item.id).unwrap().unwrap();
    assert!(audit.is_resolved());
    assert_eq!(audit.resolution, Some(Resolution::ClientWins));
}

#[tokio::test]
async fn manual_strategy_defers_like_no_strategy() {
    let h = harness();
    h.seed_conflicting_server_state("s-1");
    h.enqueue(h.update("s-1", json!({"name": "A"}), 5)).await;

    let report = h
        .sync(SyncOptions {
            conflict_strategy: Some(ConflictStrategy::Manual),
            ..SyncOptions::default()
        })
        .await;
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.synced, 0);
    assert_eq!(h.service.entity("s-1").unwrap()["name"], "B");
}

#[tokio::test]
async fn newest_wins_hands_victory_to_the_later_writer() {
    // Client wrote after the server's last update (conflict came from a
    // stale lock token): the client is the newest writer.
    let h = harness();
    h.service.seed("s-1", json!({"id": "s-1", "name": "B"}));
    h.service.seed_version(EntityVersion {
        id: "s-1".to_string(),
        version: 3,
        updated_at: ts(1),
        updated_by: "server".to_string(),
        checksum: None,
    });
    h.enqueue(h.update("s-1", json!({"name": "A", "version": 1}), 5))
        .await;

    let report = h
        .sync(SyncOptions {
            conflict_strategy: Some(ConflictStrategy::NewestWins),
            ..SyncOptions::default()
        })
        .await;
    assert_eq!(report.synced, 1);
    assert_eq!(h.service.entity("s-1").unwrap()["name"], "A");

    // Server wrote after the client captured its snapshot: server wins.
    let h = harness();
    h.seed_conflicting_server_state("s-2");
    h.enqueue(h.update("s-2", json!({"name": "A"}), 5)).await;

    let report = h
        .sync(SyncOptions {
            conflict_strategy: Some(ConflictStrategy::NewestWins),
            ..SyncOptions::default()
        })
        .await;
    assert_eq!(report.synced, 1);
    assert_eq!(h.service.entity("s-2").unwrap()["name"], "B");
}

#[tokio::test]
async fn winning_delete_keeps_its_delete_semantics() {
    let h = harness();
    h.seed_conflicting_server_state("s-1");
    h.enqueue(h.delete("s-1", 5)).await;

    let report = h
        .sync(SyncOptions {
            conflict_strategy: Some(ConflictStrategy::ClientWins),
            ..SyncOptions::default()
        })
        .await;
    assert_eq!(report.synced, 1);
    assert_eq!(report.conflicts, 1);
    assert!(h.service.entity("s-1").is_none());
}

// ── Failure isolation ────────────────────────────────────────────

#[tokio::test]
async fn validation_failure_records_the_error_and_continues() {
    let h = harness_with(MemoryEntityService::strict());
    let bad = h.enqueue(h.create("s-1", json!("not an object"), 0)).await;
    let good = h
        .enqueue(h.create("s-2", json!({"id": "s-2"}), 1))
        .await;

    let report = h.sync(SyncOptions::default()).await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.synced, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].item, bad.id);
    assert!(report.errors[0].message.contains("validation"));

    let stored = h.item(bad.id).await;
    assert!(!stored.synced);
    assert_eq!(stored.attempts, 1);
    assert!(stored.last_error.is_some());
    assert!(h.item(good.id).await.synced);
    // No entity mutation was attempted for the invalid payload.
    assert_eq!(h.service.applied(), vec!["create:s-2"]);
}

#[tokio::test]
async fn unregistered_entity_type_fails_only_its_item() {
    let h = harness();
    h.enqueue(
        Mutation::create(h.device, "invoice", "i-1", json!({"id": "i-1"})).with_timestamp(ts(0)),
    )
    .await;
    h.enqueue(h.create("s-1", json!({"id": "s-1"}), 1)).await;

    let report = h.sync(SyncOptions::default()).await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.synced, 1);
    assert!(report.errors[0].message.contains("invoice"));
    assert_eq!(h.service.applied(), vec!["create:s-1"]);
}

#[tokio::test]
async fn failed_items_stay_queued_for_retry_cycles() {
    let h = harness();
    h.service.seed("s-1", json!({"id": "s-1", "name": "old"}));
    h.service.fail_on("update", "s-1");
    let item = h.enqueue(h.update("s-1", json!({"name": "new"}), 0)).await;

    let report = h.sync(SyncOptions::default()).await;
    assert_eq!(report.failed, 1);
    let stored = h.item(item.id).await;
    assert_eq!(stored.attempts, 1);
    assert!(stored.last_error.as_deref().unwrap().contains("injected"));

    // Fresh-only cycles skip it; retry cycles pick it back up.
    let report = h.sync(SyncOptions::default()).await;
    assert_eq!(report.failed, 0);
    assert_eq!(h.item(item.id).await.attempts, 1);

    let report = h
        .sync(SyncOptions {
            retry_failed: true,
            ..SyncOptions::default()
        })
        .await;
    assert_eq!(report.failed, 1);
    assert_eq!(h.item(item.id).await.attempts, 2);
}

#[tokio::test]
async fn statistics_reflect_mixed_outcomes() {
    let h = harness();
    h.seed_conflicting_server_state("s-1");
    h.service.seed("s-2", json!({"id": "s-2"}));
    h.service.fail_on("update", "s-2");

    h.enqueue(h.update("s-1", json!({"name": "A"}), 0)).await; // conflict
    h.enqueue(h.update("s-2", json!({"name": "x"}), 1)).await; // failure
    h.enqueue(h.create("s-3", json!({"id": "s-3"}), 2)).await; // success

    h.sync(SyncOptions::default()).await;
    let stats = h
        .orchestrator
        .queue()
        .statistics(&h.user, &h.device)
        .await
        .unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.synced, 1);
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.conflicts, 1);
    assert_eq!(stats.failed, 1);
}

// ── Watermarks ───────────────────────────────────────────────────

#[tokio::test]
async fn watermark_advances_to_the_latest_synced_at() {
    let h = harness();
    let a = h.enqueue(h.create("s-1", json!({"id": "s-1"}), 0)).await;
    let b = h.enqueue(h.create("s-2", json!({"id": "s-2"}), 1)).await;
    h.sync(SyncOptions::default()).await;

    let latest = [h.item(a.id).await, h.item(b.id).await]
        .iter()
        .filter_map(|i| i.synced_at)
        .max()
        .unwrap();
    let watermark = h
        .orchestrator
        .watermarks()
        .get(&h.device, "student")
        .await
        .unwrap();
    assert_eq!(watermark.last_sync, latest);
}

// ── Atomic batches ───────────────────────────────────────────────

#[tokio::test]
async fn batch_sync_applies_everything_or_nothing_success_case() {
    let h = harness();
    h.service.seed("s-1", json!({"id": "s-1", "name": "old"}));
    h.enqueue(h.update("s-1", json!({"id": "s-1", "name": "new"}), 0))
        .await;
    h.enqueue(h.create("s-2", json!({"id": "s-2"}), 1)).await;

    let items = h
        .orchestrator
        .queue()
        .pending_items(&h.user, &h.device, 10, true, None)
        .await
        .unwrap();
    let report = h
        .orchestrator
        .batch_sync(&h.user, &h.device, items.clone(), SyncOptions::default())
        .await
        .unwrap();

    assert_eq!(report.synced, 2);
    assert_eq!(h.service.entity("s-1").unwrap()["name"], "new");
    assert!(h.service.entity("s-2").is_some());
    for item in items {
        assert!(h.item(item.id).await.synced);
    }
}

#[tokio::test]
async fn batch_sync_rolls_back_the_applied_prefix_on_failure() {
    let h = harness();
    for (id, name) in [("s-1", "one"), ("s-2", "two"), ("s-3", "three")] {
        h.service.seed(id, json!({"id": id, "name": name}));
    }
    h.service.fail_on("update", "s-3");

    h.enqueue(h.update("s-1", json!({"id": "s-1", "name": "ONE"}), 0))
        .await;
    h.enqueue(h.update("s-2", json!({"id": "s-2", "name": "TWO"}), 1))
        .await;
    h.enqueue(h.update("s-3", json!({"id": "s-3", "name": "THREE"}), 2))
        .await;

    let items = h
        .orchestrator
        .queue()
        .pending_items(&h.user, &h.device, 10, true, None)
        .await
        .unwrap();
    let err = h
        .orchestrator
        .batch_sync(&h.user, &h.device, items.clone(), SyncOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Service(_)));

    // Earlier applies are compensated; nothing is observable afterwards.
    assert_eq!(h.service.entity("s-1").unwrap()["name"], "one");
    assert_eq!(h.service.entity("s-2").unwrap()["name"], "two");
    assert_eq!(h.service.entity("s-3").unwrap()["name"], "three");

    // Queue rows were never committed.
    for item in items {
        let stored = h.item(item.id).await;
        assert!(!stored.synced);
        assert_eq!(stored.attempts, 0);
    }
}

#[tokio::test]
async fn batch_sync_rejects_unresolvable_conflicts_before_applying() {
    let h = harness();
    h.service.seed("s-2", json!({"id": "s-2", "name": "clean"}));
    h.seed_conflicting_server_state("s-1");

    h.enqueue(h.update("s-2", json!({"id": "s-2", "name": "touched"}), 0))
        .await;
    let conflicted = h.enqueue(h.update("s-1", json!({"name": "A"}), 5)).await;

    let items = h
        .orchestrator
        .queue()
        .pending_items(&h.user, &h.device, 10, true, None)
        .await
        .unwrap();
    let err = h
        .orchestrator
        .batch_sync(&h.user, &h.device, items, SyncOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::BatchConflict(id) if id == conflicted.id));

    // Planning rejected the batch before any mutation.
    assert!(h.service.applied().is_empty());
    assert_eq!(h.service.entity("s-2").unwrap()["name"], "clean");
}

#[tokio::test]
async fn batch_sync_auto_resolves_under_a_strategy() {
    let h = harness();
    h.seed_conflicting_server_state("s-1");
    let item = h.enqueue(h.update("s-1", json!({"name": "A"}), 5)).await;

    let items = h
        .orchestrator
        .queue()
        .pending_items(&h.user, &h.device, 10, true, None)
        .await
        .unwrap();
    let report = h
        .orchestrator
        .batch_sync(
            &h.user,
            &h.device,
            items,
            SyncOptions {
                conflict_strategy: Some(ConflictStrategy::ClientWins),
                ..SyncOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(report.synced, 1);
    assert_eq!(report.conflicts, 1);
    assert_eq!(h.service.entity("s-1").unwrap()["name"], "A");

    let stored = h.item(item.id).await;
    assert!(stored.synced);
    assert!(stored.conflict_detected);
    let audit = h.store.for_queue_item(&item.id).unwrap().unwrap();
    assert!(audit.is_resolved());
}
