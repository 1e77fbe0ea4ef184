//! Batch semantics: independent settlement, retries, timeouts, and
//! teardown diagnostics.

use perdure_core::{
    AccessorError, BatchConfig, CoreError, DatabaseConfig, DatabaseRegistry, LogLevel,
    PersistenceState, Settlement,
};
use perdure_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn recoverable_failures_retry_until_success() {
    let harness = TestHarness::open("main").unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();
    let batch = harness.batch_with(
        BatchConfig::new()
            .retry_interval(Duration::from_millis(100))
            .timeout(Duration::from_secs(5)),
    );
    let entity = things.create(&batch, TestItem::new(1, "one")).await.unwrap();

    harness
        .accessor
        .queue_failure(AccessorError::recoverable("transient"));
    harness
        .accessor
        .queue_failure(AccessorError::recoverable("still transient"));

    let result = batch.commit().await.unwrap();
    assert!(result.is_fully_committed());
    assert_eq!(entity.persistence_state(), PersistenceState::Persistent);
    // Two failed attempts plus the one that stuck.
    assert_eq!(harness.accessor.counts().adds, 3);
}

#[tokio::test]
async fn unrecoverable_failure_settles_without_retry_and_logs() {
    let harness = TestHarness::open("main").unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();
    let batch = harness.batch();
    let entity = things.create(&batch, TestItem::new(1, "one")).await.unwrap();

    harness
        .accessor
        .queue_failure(AccessorError::unrecoverable("constraint violated"));
    let result = batch.commit().await.unwrap();
    assert!(!result.is_fully_committed());
    let report = result.report_for(entity.id()).unwrap();
    assert!(matches!(&report.settlement, Settlement::Unrecoverable(m) if m.contains("constraint")));
    assert_eq!(harness.accessor.counts().adds, 1);

    let errors = harness.sink.records_at(LogLevel::Error);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].context_value("entityId"), Some(entity.id().to_string().as_str()));
    assert_eq!(
        errors[0].context_value("batchId"),
        Some(result.batch_id.to_string().as_str())
    );
}

#[tokio::test(start_paused = true)]
async fn stalled_entity_times_out_while_others_commit() {
    let registry = DatabaseRegistry::new();
    let mut stall = None;
    let harness = TestHarness::open_wrapped(&registry, DatabaseConfig::new("main"), |inner| {
        let stalling = Arc::new(StallingAccessor::new(inner));
        stall = Some(Arc::clone(&stalling));
        stalling
    })
    .unwrap();
    let stall = stall.unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();

    let timeout = Duration::from_secs(5);
    let batch = harness.batch_with(
        BatchConfig::new()
            .retry_interval(Duration::from_millis(100))
            .timeout(timeout),
    );
    let healthy = things.create(&batch, TestItem::new(1, "ok")).await.unwrap();
    let stuck = things.create(&batch, TestItem::new(2, "stuck")).await.unwrap();
    stall.stall_writes_for(stuck.id().as_uuid());

    let started = tokio::time::Instant::now();
    let result = batch.commit().await.unwrap();
    let elapsed = started.elapsed();

    // The batch settles at its deadline, not later.
    assert!(elapsed >= timeout, "settled early: {elapsed:?}");
    assert!(elapsed < timeout + Duration::from_secs(1), "settled late: {elapsed:?}");

    assert_eq!(result.committed_count(), 1);
    assert!(result.report_for(healthy.id()).unwrap().settlement.is_committed());
    assert_eq!(
        result.report_for(stuck.id()).unwrap().settlement,
        Settlement::TimedOut
    );
    assert_eq!(healthy.persistence_state(), PersistenceState::Persistent);
    // The stalled statement was fired and never answered; the caller's
    // wait ended, the operation was not cancelled.
    assert_eq!(stuck.persistence_state(), PersistenceState::Saving);

    let timeouts: Vec<_> = harness
        .sink
        .records_at(LogLevel::Error)
        .into_iter()
        .filter(|r| r.feature == "batchTimeout")
        .collect();
    assert_eq!(timeouts.len(), 1);
    assert_eq!(
        timeouts[0].context_value("entityId"),
        Some(stuck.id().to_string().as_str())
    );
    assert_eq!(timeouts[0].context_value("persistenceState"), Some("saving"));
}

#[tokio::test]
async fn commit_consumes_the_batch() {
    let harness = TestHarness::open("main").unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();
    let batch = harness.batch();
    things.create(&batch, TestItem::new(1, "one")).await.unwrap();

    batch.commit().await.unwrap();
    let err = batch.commit().await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidOperation { .. }));

    // A consumed batch also refuses new registrations.
    let orphan = harness.batch();
    let entity = things.create(&orphan, TestItem::new(2, "two")).await.unwrap();
    let err = entity.update(&batch, |item| item.my_int = 3).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidOperation { .. }));
    orphan.commit().await.unwrap();
}

#[tokio::test]
async fn registration_during_commit_is_rejected() {
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

    let setup = harness.batch();
    let straggler = things.create(&setup, TestItem::new(9, "late")).await.unwrap();
    setup.commit().await.unwrap();

    let batch = Arc::new(harness.batch());
    let entity = things.create(&batch, TestItem::new(1, "one")).await.unwrap();

    gate.close_writes();
    let committer = {
        let batch = Arc::clone(&batch);
        tokio::spawn(async move { batch.commit().await })
    };
    gate.wait_for_parked(1).await;

    // Commit has already taken the entries; a registration arriving now
    // must be refused, not silently accepted and never driven.
    let err = batch.insert(straggler.handle()).unwrap_err();
    assert!(matches!(err, CoreError::InvalidOperation { .. }));

    gate.open_writes();
    let result = committer.await.unwrap().unwrap();
    assert!(result.is_fully_committed());
    assert_eq!(result.reports.len(), 1);
    assert_eq!(entity.persistence_state(), PersistenceState::Persistent);
    assert!(result.report_for(straggler.id()).is_none());
}

#[tokio::test(start_paused = true)]
async fn retry_backoff_settles_at_the_true_deadline() {
    let harness = TestHarness::open("main").unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();
    let timeout = Duration::from_secs(1);
    let batch = harness.batch_with(
        BatchConfig::new()
            .retry_interval(Duration::from_millis(700))
            .timeout(timeout),
    );
    let entity = things.create(&batch, TestItem::new(1, "one")).await.unwrap();

    harness
        .accessor
        .queue_failure(AccessorError::recoverable("transient"));
    harness
        .accessor
        .queue_failure(AccessorError::recoverable("still transient"));

    // Attempts land at t=0 and t=700ms; the second backoff is clamped to
    // the 300ms left, so the report arrives at the deadline itself rather
    // than one retry interval before it.
    let started = tokio::time::Instant::now();
    let result = batch.commit().await.unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= timeout, "settled early: {elapsed:?}");
    assert!(elapsed < timeout + Duration::from_millis(100), "settled late: {elapsed:?}");
    assert_eq!(
        result.report_for(entity.id()).unwrap().settlement,
        Settlement::TimedOut
    );
    assert_eq!(harness.accessor.counts().adds, 2);
}

#[tokio::test]
async fn registration_deduplicates_by_entity() {
    let harness = TestHarness::open("main").unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();
    let batch = harness.batch();
    let entity = things.create(&batch, TestItem::new(1, "one")).await.unwrap();
    entity.update(&batch, |item| item.my_int = 2).await.unwrap();
    entity.update(&batch, |item| item.my_int = 3).await.unwrap();
    assert_eq!(batch.len(), 1);

    let result = batch.commit().await.unwrap();
    assert_eq!(result.reports.len(), 1);
    assert_eq!(harness.accessor.counts().adds, 1);
    assert_eq!(entity.with_item(|item| item.my_int).await, 3);
}

#[tokio::test]
async fn dropping_an_uncommitted_batch_logs_lost_data() {
    let harness = TestHarness::open("main").unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();
    let batch = harness.batch();
    let entity = things.create(&batch, TestItem::new(1, "one")).await.unwrap();
    let batch_id = batch.id();
    drop(batch);

    let errors = harness.sink.records_at(LogLevel::Error);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].feature, "teardown");
    assert_eq!(errors[0].context_value("entityId"), Some(entity.id().to_string().as_str()));
    assert_eq!(errors[0].context_value("persistenceState"), Some("new"));
    assert_eq!(errors[0].context_value("batchId"), Some(batch_id.to_string().as_str()));
}

#[tokio::test]
async fn dropping_a_committed_batch_is_silent() {
    let harness = TestHarness::open("main").unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();
    let batch = harness.batch();
    things.create(&batch, TestItem::new(1, "one")).await.unwrap();
    batch.commit().await.unwrap();
    drop(batch);

    assert_eq!(harness.sink.count_at(LogLevel::Error), 0);
}

#[tokio::test]
async fn insert_with_mutates_and_registers() {
    let harness = TestHarness::open("main").unwrap();
    let things = harness.db.collection::<TestItem>("things").unwrap();
    let setup = harness.batch();
    let entity = things.create(&setup, TestItem::new(1, "one")).await.unwrap();
    setup.commit().await.unwrap();

    let batch = harness.batch();
    batch
        .insert_with(&entity, |item| item.my_string = "renamed".into())
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(entity.persistence_state(), PersistenceState::Dirty);
    batch.commit().await.unwrap();
    assert_eq!(entity.with_item(|item| item.my_string.clone()).await, "renamed");
    assert_eq!(entity.version(), 2);
}
