//! Entity commit protocol: build/fire, rollback, coalescing, pending
//! actions, and removal paths.

use perdure_core::{
    AccessorError, CommitOutcome, CoreError, DatabaseConfig, DatabaseRegistry, PendingAction,
    PersistenceState,
};
use perdure_testkit::prelude::*;
use std::sync::Arc;

#[tokio::test]
async fn create_and_commit_persists_record() {
    let harness = TestHarness::open("main").unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();
    let batch = harness.batch();
    let entity = things
        .create(&batch, TestItem::new(100, "A \"Quoted\" String"))
        .await
        .unwrap();
    assert_eq!(entity.persistence_state(), PersistenceState::New);
    assert_eq!(entity.version(), 0);

    let result = batch.commit().await.unwrap();
    assert!(result.is_fully_committed());
    assert_eq!(entity.persistence_state(), PersistenceState::Persistent);
    assert_eq!(entity.version(), 1);
    assert!(entity.snapshot().await.saved.is_some());

    let raw = harness
        .accessor
        .raw_record("things", entity.id().as_uuid())
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(json["id"], entity.id().to_string());
    assert_eq!(json["persistenceState"], "persistent");
    assert_eq!(json["version"], 1);
    assert_eq!(json["schemaVersion"], 1);
    assert_eq!(json["item"]["myInt"], 100);
    assert_eq!(json["item"]["myString"], "A \"Quoted\" String");
    assert!(json["created"].is_string());
    assert!(json["saved"].is_string());
}

#[tokio::test]
async fn persistent_commit_is_a_guaranteed_noop() {
    let harness = TestHarness::open("main").unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();
    let batch = harness.batch();
    let entity = things.create(&batch, TestItem::new(1, "one")).await.unwrap();
    batch.commit().await.unwrap();

    let before = harness.accessor.counts();
    assert_eq!(entity.commit(None).await, CommitOutcome::Ok);
    assert_eq!(harness.accessor.counts(), before);
    assert_eq!(entity.version(), 1);
}

#[tokio::test]
async fn recoverable_failure_reverts_to_previous_stable_state() {
    let harness = TestHarness::open("main").unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();
    let batch = harness.batch();
    let entity = things.create(&batch, TestItem::new(1, "one")).await.unwrap();

    harness
        .accessor
        .queue_failure(AccessorError::recoverable("disk busy"));
    let outcome = entity.commit(None).await;
    assert!(matches!(outcome, CommitOutcome::Error(_)));
    // Fired once, then rolled back: state and version as if never attempted.
    assert_eq!(harness.accessor.counts().adds, 1);
    assert_eq!(entity.persistence_state(), PersistenceState::New);
    assert_eq!(entity.version(), 0);

    // The retry succeeds from the reverted state.
    assert_eq!(entity.commit(None).await, CommitOutcome::Ok);
    assert_eq!(entity.persistence_state(), PersistenceState::Persistent);
    assert_eq!(entity.version(), 1);
    batch.commit().await.unwrap();
}

#[tokio::test]
async fn unrecoverable_failure_reverts_and_is_not_retried_internally() {
    let harness = TestHarness::open("main").unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();
    let batch = harness.batch();
    let entity = things.create(&batch, TestItem::new(1, "one")).await.unwrap();

    harness
        .accessor
        .queue_failure(AccessorError::unrecoverable("constraint violated"));
    let outcome = entity.commit(None).await;
    assert!(outcome.is_unrecoverable());
    assert_eq!(entity.persistence_state(), PersistenceState::New);
    assert_eq!(entity.version(), 0);
    batch.commit().await.unwrap();
}

#[tokio::test]
async fn remove_before_first_persist_abandons_without_storage() {
    let harness = TestHarness::open("main").unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();
    let batch = harness.batch();
    let entity = things.create(&batch, TestItem::new(1, "one")).await.unwrap();
    entity.remove(&batch).await.unwrap();

    let result = batch.commit().await.unwrap();
    assert!(result.is_fully_committed());
    assert_eq!(entity.persistence_state(), PersistenceState::Abandoned);
    // The resolution still consumes a version, but the store was never
    // touched.
    assert_eq!(entity.version(), 1);
    assert_eq!(harness.accessor.counts().total(), 0);
    assert_eq!(harness.accessor.record_count("things"), 0);
}

#[tokio::test]
async fn remove_after_persist_deletes_record() {
    let harness = TestHarness::open("main").unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();
    let batch = harness.batch();
    let entity = things.create(&batch, TestItem::new(1, "one")).await.unwrap();
    batch.commit().await.unwrap();
    assert_eq!(harness.accessor.record_count("things"), 1);

    let batch = harness.batch();
    entity.remove(&batch).await.unwrap();
    assert_eq!(entity.persistence_state(), PersistenceState::PendingRemoval);
    let result = batch.commit().await.unwrap();
    assert!(result.is_fully_committed());
    assert_eq!(entity.persistence_state(), PersistenceState::Removed);
    assert_eq!(entity.version(), 2);
    assert_eq!(harness.accessor.record_count("things"), 0);
}

#[tokio::test]
async fn update_after_remove_is_rejected() {
    let harness = TestHarness::open("main").unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();
    let batch = harness.batch();
    let entity = things.create(&batch, TestItem::new(1, "one")).await.unwrap();
    entity.remove(&batch).await.unwrap();

    let err = entity
        .update(&batch, |item| item.my_int = 2)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidOperation { .. }));

    batch.commit().await.unwrap();
    // Terminal state: still rejected.
    let batch = harness.batch();
    let err = entity
        .update(&batch, |item| item.my_int = 2)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidOperation { .. }));
    batch.commit().await.unwrap();
}

#[tokio::test]
async fn mutation_during_fire_drains_in_the_same_commit_pass() {
    let registry = DatabaseRegistry::new();
    let mut gate = None;
    let harness = TestHarness::open_wrapped(&registry, DatabaseConfig::new("main"), |inner| {
        let gated = Arc::new(GatedAccessor::new(inner));
        gate = Some(Arc::clone(&gated));
        gated
    })
    .unwrap();
    let gate = gate.unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();

    let batch = harness.batch();
    let entity = things.create(&batch, TestItem::new(1, "one")).await.unwrap();
    batch.commit().await.unwrap();
    assert_eq!(entity.version(), 1);

    gate.close_writes();
    let batch = harness.batch();
    entity.update(&batch, |item| item.my_int = 2).await.unwrap();
    assert_eq!(entity.persistence_state(), PersistenceState::Dirty);
    let driver = tokio::spawn(async move { batch.commit().await });

    // The update statement is now in flight; mutate behind it.
    gate.wait_for_parked(1).await;
    assert_eq!(entity.persistence_state(), PersistenceState::Saving);
    let late = harness.batch();
    entity.update(&late, |item| item.my_int = 3).await.unwrap();
    assert_eq!(entity.snapshot().await.pending, PendingAction::Update);

    gate.open_writes();
    let result = driver.await.unwrap().unwrap();
    assert!(result.is_fully_committed());

    // Two fired updates, one version each, drained in one pass.
    assert_eq!(entity.persistence_state(), PersistenceState::Persistent);
    assert_eq!(entity.version(), 3);
    assert_eq!(harness.accessor.counts().updates, 2);
    let raw = harness
        .accessor
        .raw_record("things", entity.id().as_uuid())
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(json["item"]["myInt"], 3);
    assert_eq!(json["version"], 3);

    // The late batch finds the entity already settled.
    let result = late.commit().await.unwrap();
    assert!(result.is_fully_committed());
    assert_eq!(harness.accessor.counts().updates, 2);
}

#[tokio::test]
async fn concurrent_commits_coalesce_onto_one_write() {
    let registry = DatabaseRegistry::new();
    let mut gate = None;
    let harness = TestHarness::open_wrapped(&registry, DatabaseConfig::new("main"), |inner| {
        let gated = Arc::new(GatedAccessor::new(inner));
        gate = Some(Arc::clone(&gated));
        gated
    })
    .unwrap();
    let gate = gate.unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();

    let batch = harness.batch();
    let entity = things.create(&batch, TestItem::new(1, "one")).await.unwrap();

    gate.close_writes();
    let first = {
        let entity = entity.clone();
        tokio::spawn(async move { entity.commit(None).await })
    };
    let second = {
        let entity = entity.clone();
        tokio::spawn(async move { entity.commit(None).await })
    };

    gate.wait_for_parked(1).await;
    // The second commit coalesces onto the in-flight one instead of
    // queueing a second statement.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert_eq!(gate.parked_writes(), 1);

    gate.open_writes();
    assert_eq!(first.await.unwrap(), CommitOutcome::Ok);
    assert_eq!(second.await.unwrap(), CommitOutcome::Ok);
    assert_eq!(entity.version(), 1);
    assert_eq!(harness.accessor.counts().writes(), 1);
    batch.commit().await.unwrap();
}

#[tokio::test]
async fn remove_during_fire_is_drained_as_deletion() {
    let registry = DatabaseRegistry::new();
    let mut gate = None;
    let harness = TestHarness::open_wrapped(&registry, DatabaseConfig::new("main"), |inner| {
        let gated = Arc::new(GatedAccessor::new(inner));
        gate = Some(Arc::clone(&gated));
        gated
    })
    .unwrap();
    let gate = gate.unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();

    let batch = harness.batch();
    let entity = things.create(&batch, TestItem::new(1, "one")).await.unwrap();

    gate.close_writes();
    let driver = tokio::spawn(async move { batch.commit().await });
    gate.wait_for_parked(1).await;

    let late = harness.batch();
    entity.remove(&late).await.unwrap();
    assert_eq!(entity.snapshot().await.pending, PendingAction::Remove);

    gate.open_writes();
    driver.await.unwrap().unwrap();
    // Insert fired, then the queued removal fired in the same pass.
    assert_eq!(entity.persistence_state(), PersistenceState::Removed);
    assert_eq!(entity.version(), 2);
    assert_eq!(harness.accessor.record_count("things"), 0);
    late.commit().await.unwrap();
}
