//! Eventually-consistent batch.

use crate::config::BatchConfig;
use crate::entity::{EntityHandle, EntityId, PersistenceState};
use crate::error::{CommitOutcome, CoreError, CoreResult};
use crate::log::{LogLevel, LogSink};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

/// How one entity's commit settled within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// The entity committed successfully.
    Committed,
    /// The entity failed permanently; no retry was attempted after the
    /// failure.
    Unrecoverable(String),
    /// The entity did not settle before the batch deadline. Any in-flight
    /// storage operation continues in the background.
    TimedOut,
}

impl Settlement {
    /// Returns true if the entity committed.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed)
    }
}

/// Per-entity report within a [`BatchResult`].
#[derive(Debug, Clone)]
pub struct EntityReport {
    /// The entity's identity.
    pub entity_id: EntityId,
    /// The entity's payload type name.
    pub item_type: &'static str,
    /// How the commit settled.
    pub settlement: Settlement,
}

/// Aggregated outcome of a batch commit.
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// The batch's diagnostic id.
    pub batch_id: Uuid,
    /// One report per registered entity.
    pub reports: Vec<EntityReport>,
}

impl BatchResult {
    /// Returns true if every entity committed.
    #[must_use]
    pub fn is_fully_committed(&self) -> bool {
        self.reports.iter().all(|r| r.settlement.is_committed())
    }

    /// Returns the number of entities that committed.
    #[must_use]
    pub fn committed_count(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.settlement.is_committed())
            .count()
    }

    /// Returns the report for `id`, if the entity was registered.
    #[must_use]
    pub fn report_for(&self, id: EntityId) -> Option<&EntityReport> {
        self.reports.iter().find(|r| r.entity_id == id)
    }
}

/// A short-lived aggregator of entities to be persisted together under one
/// retry/timeout policy.
///
/// Callers fill the batch through [`crate::Collection::create`],
/// [`crate::Entity::update`] / [`crate::Entity::remove`], or
/// [`EventuallyConsistentBatch::insert`], then consume it exactly once with
/// [`EventuallyConsistentBatch::commit`]. There is no cross-entity
/// atomicity: each entity succeeds or fails independently.
///
/// Dropping a batch that still holds never-committed entities is a
/// programming error; each such entity is logged as a lost-data ERROR.
pub struct EventuallyConsistentBatch {
    id: Uuid,
    retry_interval: Duration,
    timeout: Duration,
    logger: Arc<dyn LogSink>,
    // One lock guards both the entries and the consumed flag: a late
    // registration either lands before commit takes the entries or is
    // rejected, never silently dropped between the two.
    entries: Mutex<Entries>,
}

#[derive(Default)]
struct Entries {
    handles: Vec<Arc<dyn EntityHandle>>,
    consumed: bool,
}

impl EventuallyConsistentBatch {
    /// Creates a batch reporting through `logger` with the given policy.
    #[must_use]
    pub fn new(logger: Arc<dyn LogSink>, config: BatchConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            retry_interval: config.retry_interval,
            timeout: config.timeout,
            logger,
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Returns the batch's diagnostic id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the number of registered entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().handles.len()
    }

    /// Returns true if no entities are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().handles.is_empty()
    }

    /// Registers a type-erased entity handle, deduplicating by entity id.
    pub(crate) fn register(&self, handle: Arc<dyn EntityHandle>) -> CoreResult<()> {
        let mut entries = self.entries.lock();
        if entries.consumed {
            return Err(CoreError::invalid_operation(
                "batch has already been committed",
            ));
        }
        if !entries
            .handles
            .iter()
            .any(|e| e.entity_id() == handle.entity_id())
        {
            entries.handles.push(handle);
        }
        Ok(())
    }

    /// Registers an entity for persistence without mutating it.
    pub fn insert(&self, handle: Arc<dyn EntityHandle>) -> CoreResult<()> {
        self.register(handle)
    }

    /// Applies a one-shot mutation to `entity` and registers it.
    ///
    /// The mutation is applied synchronously, before registration
    /// completes; equivalent to [`crate::Entity::update`].
    pub async fn insert_with<T: crate::entity::EntityItem>(
        &self,
        entity: &crate::entity::Entity<T>,
        mutate: impl FnOnce(&mut T) + Send,
    ) -> CoreResult<()> {
        entity.update(self, mutate).await
    }

    /// Commits every registered entity under the batch's own timeout.
    pub async fn commit(&self) -> CoreResult<BatchResult> {
        self.commit_with_timeout(self.timeout).await
    }

    /// Commits every registered entity, bounding each by `timeout`.
    ///
    /// One commit driver runs per entity, concurrently; recoverable errors
    /// retry after the batch's retry interval until success, an
    /// unrecoverable error, or the deadline. The returned result is
    /// complete: it is produced only after every driver has settled.
    pub async fn commit_with_timeout(&self, timeout: Duration) -> CoreResult<BatchResult> {
        let entries = {
            let mut entries = self.entries.lock();
            if entries.consumed {
                return Err(CoreError::invalid_operation(
                    "batch has already been committed",
                ));
            }
            entries.consumed = true;
            std::mem::take(&mut entries.handles)
        };
        let mut drivers = JoinSet::new();
        for handle in entries {
            let logger = Arc::clone(&self.logger);
            let retry_interval = self.retry_interval;
            let batch_id = self.id;
            drivers.spawn(async move {
                Self::drive_entity(handle, retry_interval, timeout, batch_id, logger).await
            });
        }
        let mut reports = Vec::new();
        while let Some(joined) = drivers.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => {
                    self.logger.log(
                        LogLevel::Error,
                        "batch",
                        "commit",
                        "entity commit driver failed",
                        &[
                            ("batchId", self.id.to_string()),
                            ("error", e.to_string()),
                        ],
                    );
                }
            }
        }
        Ok(BatchResult {
            batch_id: self.id,
            reports,
        })
    }

    async fn drive_entity(
        handle: Arc<dyn EntityHandle>,
        retry_interval: Duration,
        timeout: Duration,
        batch_id: Uuid,
        logger: Arc<dyn LogSink>,
    ) -> EntityReport {
        let deadline = Instant::now() + timeout;
        let settlement = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Settlement::TimedOut;
            }
            match handle.commit(Some(remaining)).await {
                CommitOutcome::Ok => break Settlement::Committed,
                CommitOutcome::Unrecoverable(message) => {
                    break Settlement::Unrecoverable(message)
                }
                CommitOutcome::TimedOut => break Settlement::TimedOut,
                CommitOutcome::Error(_) => {
                    // Recoverable; retries are deliberately not logged per
                    // attempt. Sleep for the retry interval, clamped so the
                    // loop wakes exactly at the deadline when it is nearer.
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break Settlement::TimedOut;
                    }
                    tokio::time::sleep(retry_interval.min(remaining)).await;
                }
            }
        };
        match &settlement {
            Settlement::Committed => {}
            Settlement::Unrecoverable(message) => {
                logger.log(
                    LogLevel::Error,
                    "batch",
                    "commit",
                    "unrecoverable entity error",
                    &[
                        ("entityType", handle.item_type().to_string()),
                        ("entityId", handle.entity_id().to_string()),
                        ("batchId", batch_id.to_string()),
                        ("error", message.clone()),
                    ],
                );
            }
            Settlement::TimedOut => {
                logger.log(
                    LogLevel::Error,
                    "batch",
                    "batchTimeout",
                    "entity commit did not settle before the batch deadline",
                    &[
                        ("entityType", handle.item_type().to_string()),
                        ("entityId", handle.entity_id().to_string()),
                        ("persistenceState", handle.persistence_state().to_string()),
                        ("batchId", batch_id.to_string()),
                    ],
                );
            }
        }
        EntityReport {
            entity_id: handle.entity_id(),
            item_type: handle.item_type(),
            settlement,
        }
    }
}

impl Drop for EventuallyConsistentBatch {
    fn drop(&mut self) {
        let entries = self.entries.get_mut();
        if entries.consumed {
            return;
        }
        for handle in entries.handles.iter() {
            let state = handle.persistence_state();
            if !state.is_unsynchronized() {
                continue;
            }
            self.logger.log(
                LogLevel::Error,
                "batch",
                "teardown",
                "batch discarded with uncommitted entity; local changes were never persisted",
                &[
                    ("entityType", handle.item_type().to_string()),
                    ("entityId", handle.entity_id().to_string()),
                    ("persistenceState", state.to_string()),
                    ("batchId", self.id.to_string()),
                ],
            );
        }
    }
}
