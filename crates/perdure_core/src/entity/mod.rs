//! Entity: one persistable object with identity, version, and a
//! persistence state machine.

mod handle;
mod id;
mod state;

pub use handle::EntityHandle;
pub use id::EntityId;
pub use state::{PendingAction, PersistenceState};

use crate::batch::EventuallyConsistentBatch;
use crate::codec::{self, RecordOwned, RecordRef};
use crate::collection::Collection;
use crate::database::DatabaseRegistry;
use crate::error::{CommitOutcome, CoreError, CoreResult};
use crate::reference::{ParentData, ReferenceContext};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use perdure_accessor::Accessor;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Payload of an entity.
///
/// Any serde-serializable type can be a payload; the implementation is an
/// explicit opt-in so that items containing [`crate::EntityReference`]s can
/// override [`EntityItem::bind_references`].
pub trait EntityItem: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Invoked by the owning collection after the item is decoded or
    /// created, carrying the side-channel context that identifies the
    /// owning parent entity. Items holding references forward the context
    /// to each of them; items without references ignore it.
    fn bind_references(&mut self, ctx: &ReferenceContext) {
        let _ = ctx;
    }
}

/// Point-in-time view of an entity's metadata.
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    /// Entity identity.
    pub id: EntityId,
    /// Current version.
    pub version: u64,
    /// Schema version stamped by the owning database.
    pub schema_version: i64,
    /// Current persistence state.
    pub persistence: PersistenceState,
    /// Queued pending action, if any.
    pub pending: PendingAction,
    /// Creation timestamp.
    pub created: DateTime<Utc>,
    /// Timestamp of the last successful persist, absent until the first.
    pub saved: Option<DateTime<Utc>>,
}

/// The storage operation a commit pass performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageOp {
    Insert,
    Update,
    Delete,
    /// Deletion of a never-persisted entity; resolves without touching the
    /// accessor.
    Abandon,
}

/// Mutable state guarded by the entity's serialized execution context.
struct EntityState<T> {
    item: T,
    version: u64,
    schema_version: i64,
    created: DateTime<Utc>,
    saved: Option<DateTime<Utc>>,
    persistence: PersistenceState,
    pending: PendingAction,
    in_flight: bool,
    in_flight_removal: bool,
    last_error: Option<String>,
}

pub(crate) struct EntityInner<T: EntityItem> {
    id: EntityId,
    item_type: &'static str,
    collection: RwLock<Weak<Collection<T>>>,
    state: Mutex<EntityState<T>>,
    // Mirrors of persistence/version for synchronous diagnostics.
    state_tag: AtomicU8,
    version_tag: AtomicU64,
    commit_done: Notify,
    self_weak: Weak<EntityInner<T>>,
}

/// One persistable domain object.
///
/// An `Entity<T>` is a cheap-to-clone handle; exactly one underlying
/// instance exists per (collection, id) while any strong handle survives.
/// All mutation, state inspection, and state transition run on the entity's
/// private serialized execution context, one operation at a time, in
/// submission order.
///
/// Mutations go through [`Entity::update`] / [`Entity::remove`], which take
/// the batch that will eventually persist them. Persistence itself is
/// driven by [`Entity::commit`], normally invoked by the batch.
pub struct Entity<T: EntityItem> {
    inner: Arc<EntityInner<T>>,
}

impl<T: EntityItem> std::fmt::Debug for Entity<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl<T: EntityItem> Clone for Entity<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: EntityItem> Entity<T> {
    pub(crate) fn create_new(id: EntityId, item: T, schema_version: i64) -> Self {
        Self::build(
            id,
            item,
            0,
            schema_version,
            Utc::now(),
            None,
            PersistenceState::New,
        )
    }

    pub(crate) fn from_record(record: RecordOwned<T>) -> Self {
        Self::build(
            record.id,
            record.item,
            record.version,
            record.schema_version,
            record.created,
            record.saved,
            record.persistence_state,
        )
    }

    fn build(
        id: EntityId,
        item: T,
        version: u64,
        schema_version: i64,
        created: DateTime<Utc>,
        saved: Option<DateTime<Utc>>,
        persistence: PersistenceState,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak| EntityInner {
            id,
            item_type: std::any::type_name::<T>(),
            collection: RwLock::new(Weak::new()),
            state: Mutex::new(EntityState {
                item,
                version,
                schema_version,
                created,
                saved,
                persistence,
                pending: PendingAction::None,
                in_flight: false,
                in_flight_removal: false,
                last_error: None,
            }),
            state_tag: AtomicU8::new(persistence.to_tag()),
            version_tag: AtomicU64::new(version),
            commit_done: Notify::new(),
            self_weak: weak.clone(),
        });
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<EntityInner<T>>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner_arc(&self) -> &Arc<EntityInner<T>> {
        &self.inner
    }

    pub(crate) fn bound_collection(&self) -> Weak<Collection<T>> {
        self.inner.collection.read().clone()
    }

    /// Binds the entity to `collection`, stamps the database's schema
    /// version, and hands the parent side-channel context to the item's
    /// references.
    pub(crate) async fn bind(
        &self,
        collection: &Arc<Collection<T>>,
        schema_version: i64,
        registry: Weak<DatabaseRegistry>,
    ) {
        *self.inner.collection.write() = Arc::downgrade(collection);
        let handle: Arc<dyn EntityHandle> = self.inner.clone();
        let ctx = ReferenceContext::new(
            ParentData {
                id: self.inner.id,
                version: self.version(),
            },
            Arc::downgrade(&handle),
            registry,
        );
        let mut st = self.inner.state.lock().await;
        st.schema_version = schema_version;
        st.item.bind_references(&ctx);
    }

    /// Returns the entity's identity.
    #[must_use]
    pub fn id(&self) -> EntityId {
        self.inner.id
    }

    /// Returns the payload type name, for diagnostics.
    #[must_use]
    pub fn item_type(&self) -> &'static str {
        self.inner.item_type
    }

    /// Returns a snapshot of the persistence state (atomic mirror).
    #[must_use]
    pub fn persistence_state(&self) -> PersistenceState {
        PersistenceState::from_tag(self.inner.state_tag.load(Ordering::SeqCst))
    }

    /// Returns a snapshot of the version (atomic mirror).
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.version_tag.load(Ordering::SeqCst)
    }

    /// Returns true if both handles refer to the same underlying instance.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns the type-erased capability handle for this entity.
    #[must_use]
    pub fn handle(&self) -> Arc<dyn EntityHandle> {
        self.inner.clone()
    }

    /// Takes a consistent snapshot of the entity's metadata.
    pub async fn snapshot(&self) -> EntitySnapshot {
        let st = self.inner.state.lock().await;
        EntitySnapshot {
            id: self.inner.id,
            version: st.version,
            schema_version: st.schema_version,
            persistence: st.persistence,
            pending: st.pending,
            created: st.created,
            saved: st.saved,
        }
    }

    /// Runs `f` against the item on the entity's execution context.
    pub async fn with_item<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let st = self.inner.state.lock().await;
        f(&st.item)
    }

    /// Applies a mutation to the item and registers the entity on `batch`.
    ///
    /// The mutation is visible in memory immediately. If a commit is in
    /// flight the write-back is queued as a pending action and drained by
    /// that same commit pass; otherwise a persistent entity turns dirty.
    pub async fn update(
        &self,
        batch: &EventuallyConsistentBatch,
        mutate: impl FnOnce(&mut T) + Send,
    ) -> CoreResult<()> {
        {
            let mut st = self.inner.state.lock().await;
            self.inner.ensure_updatable(&st)?;
            mutate(&mut st.item);
            self.inner.note_update(&mut st);
        }
        batch.register(self.handle())
    }

    /// Slates the entity for removal and registers it on `batch`.
    ///
    /// Removal of a never-persisted entity resolves at commit time without
    /// touching the store.
    pub async fn remove(&self, batch: &EventuallyConsistentBatch) -> CoreResult<()> {
        {
            let mut st = self.inner.state.lock().await;
            if st.persistence.is_terminal() {
                return Err(CoreError::invalid_operation(format!(
                    "entity {} is already removed",
                    self.inner.id
                )));
            }
            if st.in_flight {
                st.pending = st.pending.merge(PendingAction::Remove);
            } else if st.persistence != PersistenceState::PendingRemoval {
                st.persistence = PersistenceState::PendingRemoval;
                self.inner.store_state(st.persistence);
            }
        }
        batch.register(self.handle())
    }

    /// Drives the commit protocol for this entity.
    ///
    /// Returns [`CommitOutcome::Ok`] without touching the accessor when the
    /// entity is `Persistent` with no pending action, or already terminal.
    /// If another commit is in flight, this call waits for it (and any
    /// queued pending action) to settle and resolves from the entity's
    /// state at that time; it never starts a second concurrent write.
    ///
    /// A `timeout` bounds only how long this caller waits: on expiry the
    /// caller receives [`CommitOutcome::TimedOut`] while the in-flight
    /// build/fire sequence runs to completion and updates the entity's
    /// true state independently.
    pub async fn commit(&self, timeout: Option<Duration>) -> CommitOutcome {
        EntityInner::commit_with_timeout(Arc::clone(&self.inner), timeout).await
    }
}

impl<T: EntityItem> EntityInner<T> {
    fn store_state(&self, state: PersistenceState) {
        self.state_tag.store(state.to_tag(), Ordering::SeqCst);
    }

    fn store_version(&self, version: u64) {
        self.version_tag.store(version, Ordering::SeqCst);
    }

    fn ensure_updatable(&self, st: &EntityState<T>) -> CoreResult<()> {
        if st.persistence.is_terminal()
            || st.persistence == PersistenceState::PendingRemoval
            || st.pending == PendingAction::Remove
            || st.in_flight_removal
        {
            return Err(CoreError::invalid_operation(format!(
                "entity {} is slated for removal or already removed",
                self.id
            )));
        }
        Ok(())
    }

    fn note_update(&self, st: &mut EntityState<T>) {
        if st.in_flight {
            st.pending = st.pending.merge(PendingAction::Update);
        } else if st.persistence == PersistenceState::Persistent {
            st.persistence = PersistenceState::Dirty;
            self.store_state(st.persistence);
        }
    }

    fn storage_context(&self) -> Result<(String, Arc<dyn Accessor>), String> {
        let collection = self
            .collection
            .read()
            .upgrade()
            .ok_or_else(|| "entity is not bound to a live collection".to_string())?;
        let database = collection
            .database()
            .upgrade()
            .ok_or_else(|| "owning database is closed".to_string())?;
        Ok((collection.name().to_string(), database.accessor()))
    }

    fn settled_outcome(st: &EntityState<T>) -> CommitOutcome {
        if st.persistence.needs_commit() {
            CommitOutcome::Error(
                st.last_error
                    .clone()
                    .unwrap_or_else(|| "commit did not settle".to_string()),
            )
        } else {
            CommitOutcome::Ok
        }
    }

    async fn commit_with_timeout(inner: Arc<Self>, timeout: Option<Duration>) -> CommitOutcome {
        // The commit runs as its own task: a caller abandoning its wait must
        // never cancel an in-progress storage write.
        let task = tokio::spawn(inner.run_commit());
        match timeout {
            None => task
                .await
                .unwrap_or_else(|e| CommitOutcome::Unrecoverable(format!("commit task failed: {e}"))),
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined.unwrap_or_else(|e| {
                    CommitOutcome::Unrecoverable(format!("commit task failed: {e}"))
                }),
                Err(_) => CommitOutcome::TimedOut,
            },
        }
    }

    async fn run_commit(self: Arc<Self>) -> CommitOutcome {
        loop {
            let mut st = self.state.lock().await;
            if st.in_flight {
                // Coalesce: wait for the in-flight operation and any queued
                // pending action, then resolve from the settled state.
                let settled = self.commit_done.notified();
                drop(st);
                settled.await;
                let st = self.state.lock().await;
                if st.in_flight {
                    continue;
                }
                return Self::settled_outcome(&st);
            }
            if !st.persistence.needs_commit() {
                // Persistent with nothing pending, or terminal: guaranteed
                // no-op.
                return CommitOutcome::Ok;
            }
            st.in_flight = true;
            st.last_error = None;
            break;
        }
        let outcome = self.drive().await;
        {
            let mut st = self.state.lock().await;
            st.in_flight = false;
            st.in_flight_removal = false;
            if !outcome.is_ok() {
                st.last_error = outcome.message().map(str::to_string);
            }
        }
        self.commit_done.notify_waiters();
        outcome
    }

    /// The build/fire loop. Runs with `in_flight` set; drains pending
    /// actions accumulated while firing before settling.
    async fn drive(self: &Arc<Self>) -> CommitOutcome {
        loop {
            let mut st = self.state.lock().await;
            let op = match st.persistence {
                PersistenceState::New => StorageOp::Insert,
                PersistenceState::Dirty => StorageOp::Update,
                PersistenceState::PendingRemoval => {
                    if st.saved.is_none() {
                        StorageOp::Abandon
                    } else {
                        StorageOp::Delete
                    }
                }
                PersistenceState::Persistent
                | PersistenceState::Abandoned
                | PersistenceState::Removed => return CommitOutcome::Ok,
                PersistenceState::Saving => {
                    return CommitOutcome::Unrecoverable(
                        "commit invariant violated: concurrent save".to_string(),
                    );
                }
            };

            if op == StorageOp::Abandon {
                st.version += 1;
                self.store_version(st.version);
                st.pending = PendingAction::None;
                st.persistence = PersistenceState::Abandoned;
                self.store_state(st.persistence);
                return CommitOutcome::Ok;
            }

            // Build phase. Failures here precede any I/O and are
            // unrecoverable; the entity keeps its stable state.
            let (collection_name, accessor) = match self.storage_context() {
                Ok(ctx) => ctx,
                Err(msg) => return CommitOutcome::Unrecoverable(msg),
            };
            let prev = st.persistence;
            let next_version = st.version + 1;
            let saved_at = Utc::now();
            let statement = if op == StorageOp::Delete {
                None
            } else {
                match codec::encode_record(&RecordRef {
                    id: self.id,
                    schema_version: st.schema_version,
                    created: st.created,
                    saved: Some(saved_at),
                    item: &st.item,
                    persistence_state: PersistenceState::Persistent,
                    version: next_version,
                }) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        return CommitOutcome::Unrecoverable(format!(
                            "failed to build storage statement: {e}"
                        ));
                    }
                }
            };

            // Fire phase. Release the execution context while the accessor
            // runs so concurrent mutations can queue a pending action.
            st.persistence = PersistenceState::Saving;
            self.store_state(st.persistence);
            st.version = next_version;
            self.store_version(next_version);
            st.in_flight_removal = op == StorageOp::Delete;
            drop(st);

            let fired = match (op, statement) {
                (StorageOp::Insert, Some(bytes)) => {
                    accessor.add(&collection_name, self.id.as_uuid(), bytes).await
                }
                (StorageOp::Update, Some(bytes)) => {
                    accessor
                        .update(&collection_name, self.id.as_uuid(), bytes)
                        .await
                }
                (StorageOp::Delete, _) => {
                    accessor.remove(&collection_name, self.id.as_uuid()).await
                }
                _ => {
                    return CommitOutcome::Unrecoverable(
                        "commit invariant violated: missing storage statement".to_string(),
                    );
                }
            };

            let mut st = self.state.lock().await;
            match fired {
                Err(e) => {
                    // Roll back to the pre-attempt stable state; the pending
                    // action survives for a later retry.
                    st.version -= 1;
                    self.store_version(st.version);
                    st.persistence = prev;
                    self.store_state(prev);
                    st.in_flight_removal = false;
                    return if e.is_recoverable() {
                        CommitOutcome::Error(e.to_string())
                    } else {
                        CommitOutcome::Unrecoverable(e.to_string())
                    };
                }
                Ok(()) => {
                    if op == StorageOp::Delete {
                        st.pending = PendingAction::None;
                        st.persistence = PersistenceState::Removed;
                        self.store_state(st.persistence);
                        return CommitOutcome::Ok;
                    }
                    st.saved = Some(saved_at);
                    match st.pending {
                        PendingAction::None => {
                            st.persistence = PersistenceState::Persistent;
                            self.store_state(st.persistence);
                            return CommitOutcome::Ok;
                        }
                        PendingAction::Update => {
                            st.pending = PendingAction::None;
                            st.persistence = PersistenceState::Dirty;
                            self.store_state(st.persistence);
                        }
                        PendingAction::Remove => {
                            st.pending = PendingAction::None;
                            st.persistence = PersistenceState::PendingRemoval;
                            self.store_state(st.persistence);
                        }
                    }
                    // A pending action arrived while firing; drain it in
                    // this same commit pass.
                }
            }
        }
    }
}

#[async_trait]
impl<T: EntityItem> EntityHandle for EntityInner<T> {
    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn item_type(&self) -> &'static str {
        self.item_type
    }

    fn persistence_state(&self) -> PersistenceState {
        PersistenceState::from_tag(self.state_tag.load(Ordering::SeqCst))
    }

    fn version(&self) -> u64 {
        self.version_tag.load(Ordering::SeqCst)
    }

    async fn commit(&self, timeout: Option<Duration>) -> CommitOutcome {
        match self.self_weak.upgrade() {
            Some(inner) => Self::commit_with_timeout(inner, timeout).await,
            None => CommitOutcome::Unrecoverable("entity was dropped".to_string()),
        }
    }

    async fn mark_dirty(&self) -> CoreResult<()> {
        let mut st = self.state.lock().await;
        self.ensure_updatable(&st)?;
        self.note_update(&mut st);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        value: i64,
    }

    impl EntityItem for Payload {}

    #[tokio::test]
    async fn create_new_defaults() {
        let entity = Entity::create_new(EntityId::new(), Payload { value: 5 }, 2);
        assert_eq!(entity.persistence_state(), PersistenceState::New);
        assert_eq!(entity.version(), 0);
        let snapshot = entity.snapshot().await;
        assert_eq!(snapshot.schema_version, 2);
        assert_eq!(snapshot.pending, PendingAction::None);
        assert!(snapshot.saved.is_none());
        assert_eq!(entity.with_item(|i| i.value).await, 5);
    }

    #[tokio::test]
    async fn commit_of_unbound_entity_is_unrecoverable() {
        let entity = Entity::create_new(EntityId::new(), Payload { value: 1 }, 1);
        let outcome = entity.commit(None).await;
        assert!(outcome.is_unrecoverable());
        // The entity keeps its stable state: build failed before any I/O.
        assert_eq!(entity.persistence_state(), PersistenceState::New);
        assert_eq!(entity.version(), 0);
    }

    #[test]
    fn clones_share_identity() {
        let entity = Entity::create_new(EntityId::new(), Payload { value: 1 }, 1);
        let other = entity.clone();
        assert!(entity.same_instance(&other));
        let unrelated = Entity::create_new(EntityId::new(), Payload { value: 1 }, 1);
        assert!(!entity.same_instance(&unrelated));
    }
}
