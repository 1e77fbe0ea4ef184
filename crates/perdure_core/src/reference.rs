//! Typed cross-entity references.

use crate::batch::EventuallyConsistentBatch;
use crate::database::DatabaseRegistry;
use crate::entity::{Entity, EntityHandle, EntityId, EntityItem};
use crate::error::{CoreError, CoreResult};
use parking_lot::{Mutex, RwLock};
use serde::de::Error as DeError;
use serde::ser::Error as SerError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Default backoff before a failed resolution is attempted again.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Identity and version of a reference's owning entity, captured at
/// reference-construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentData {
    /// The owning entity's id.
    pub id: EntityId,
    /// The owning entity's version when the reference was constructed.
    pub version: u64,
}

/// The decoded target of a populated reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceData {
    /// Identity of the database holding the target.
    pub database_id: String,
    /// Name of the collection holding the target.
    pub collection_name: String,
    /// The target entity's id.
    pub id: EntityId,
    /// The target entity's version when the reference was encoded.
    pub version: u64,
}

/// Side-channel context identifying a reference's owning parent entity.
///
/// Produced by the owning collection when it decodes or creates an entity,
/// and handed to the item through [`EntityItem::bind_references`]. Binding
/// is what allows a reference to resolve (through the database registry)
/// and to mark its parent dirty on [`EntityReference::set`].
pub struct ReferenceContext {
    parent: ParentData,
    parent_handle: Weak<dyn EntityHandle>,
    registry: Weak<DatabaseRegistry>,
}

impl ReferenceContext {
    pub(crate) fn new(
        parent: ParentData,
        parent_handle: Weak<dyn EntityHandle>,
        registry: Weak<DatabaseRegistry>,
    ) -> Self {
        Self {
            parent,
            parent_handle,
            registry,
        }
    }

    /// Returns the owning parent's identity and version.
    #[must_use]
    pub fn parent(&self) -> ParentData {
        self.parent
    }
}

#[derive(Clone)]
struct Binding {
    parent: ParentData,
    parent_handle: Weak<dyn EntityHandle>,
    registry: Weak<DatabaseRegistry>,
}

/// Shared outcome of a single-flight resolution.
enum ResolveOutcome<C: EntityItem> {
    Resolved(Option<Entity<C>>),
    Failed(String),
}

impl<C: EntityItem> Clone for ResolveOutcome<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Resolved(value) => Self::Resolved(value.clone()),
            Self::Failed(message) => Self::Failed(message.clone()),
        }
    }
}

impl<C: EntityItem> ResolveOutcome<C> {
    fn into_result(self) -> CoreResult<Option<Entity<C>>> {
        match self {
            Self::Resolved(value) => Ok(value),
            Self::Failed(message) => Err(CoreError::retrieval(message)),
        }
    }
}

enum RefState<C: EntityItem> {
    /// The target (or nil) is resolved and cached.
    Loaded(Option<Entity<C>>),
    /// Wire data decoded; no resolution attempted yet.
    Decoded(ReferenceData),
    /// A single fetch is in flight; concurrent requesters queue on the
    /// watch channel and are answered exactly once.
    Retrieving {
        data: ReferenceData,
        epoch: u64,
        tx: watch::Sender<Option<ResolveOutcome<C>>>,
    },
    /// Negative cache: resolution attempts short-circuit to the cached
    /// error until `suspend_until`.
    RetrievalError {
        data: ReferenceData,
        suspend_until: Instant,
        message: String,
    },
}

struct RefInner<C: EntityItem> {
    is_eager: bool,
    retry_interval: Duration,
    epoch: AtomicU64,
    binding: RwLock<Option<Binding>>,
    state: Mutex<RefState<C>>,
}

/// A typed pointer from one entity to another, possibly in a different
/// database.
///
/// References live inside an entity's item. They resolve lazily through
/// [`EntityReference::get`] (or eagerly, as soon as non-nil data is bound),
/// deduplicate concurrent resolution requests onto a single fetch, and
/// negative-cache failures for [`DEFAULT_RETRY_INTERVAL`].
///
/// An `EntityReference` is a cheap-to-clone handle onto shared state, so an
/// item's reference can be cloned out of [`crate::Entity::with_item`] and
/// resolved without holding the entity's execution context.
pub struct EntityReference<C: EntityItem> {
    inner: Arc<RefInner<C>>,
}

impl<C: EntityItem> Clone for EntityReference<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

enum Plan<C: EntityItem> {
    Done(Option<Entity<C>>),
    Suspended(String),
    NoParent,
    Wait(watch::Receiver<Option<ResolveOutcome<C>>>),
    Fetch(ReferenceData, u64),
}

impl<C: EntityItem> EntityReference<C> {
    fn build(state: RefState<C>, is_eager: bool) -> Self {
        Self {
            inner: Arc::new(RefInner {
                is_eager,
                retry_interval: DEFAULT_RETRY_INTERVAL,
                epoch: AtomicU64::new(0),
                binding: RwLock::new(None),
                state: Mutex::new(state),
            }),
        }
    }

    /// Creates an empty (nil) reference.
    #[must_use]
    pub fn nil(is_eager: bool) -> Self {
        Self::build(RefState::Loaded(None), is_eager)
    }

    /// Creates a reference already resolved to `entity`.
    #[must_use]
    pub fn to_entity(entity: &Entity<C>, is_eager: bool) -> Self {
        Self::build(RefState::Loaded(Some(entity.clone())), is_eager)
    }

    /// Creates an unresolved reference from decoded wire data.
    #[must_use]
    pub fn from_data(data: ReferenceData, is_eager: bool) -> Self {
        Self::build(RefState::Decoded(data), is_eager)
    }

    /// Returns true if this reference resolves eagerly.
    #[must_use]
    pub fn is_eager(&self) -> bool {
        self.inner.is_eager
    }

    /// Returns true if the reference is resolved (to a target or to nil).
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        matches!(&*self.inner.state.lock(), RefState::Loaded(_))
    }

    /// Returns true if resolution is currently negative-cached.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        matches!(
            &*self.inner.state.lock(),
            RefState::RetrievalError { suspend_until, .. } if Instant::now() < *suspend_until
        )
    }

    /// Returns the decoded target data, if the reference is unresolved.
    #[must_use]
    pub fn reference_data(&self) -> Option<ReferenceData> {
        match &*self.inner.state.lock() {
            RefState::Decoded(data)
            | RefState::Retrieving { data, .. }
            | RefState::RetrievalError { data, .. } => Some(data.clone()),
            RefState::Loaded(_) => None,
        }
    }

    /// Returns the owning parent's data, if the reference is bound.
    #[must_use]
    pub fn parent_data(&self) -> Option<ParentData> {
        self.inner.binding.read().as_ref().map(|b| b.parent)
    }

    /// Binds the reference to its owning parent context.
    ///
    /// Invoked from [`EntityItem::bind_references`]. Eager references with
    /// unresolved data start warming immediately.
    pub fn bind(&self, ctx: &ReferenceContext) {
        *self.inner.binding.write() = Some(Binding {
            parent: ctx.parent,
            parent_handle: ctx.parent_handle.clone(),
            registry: ctx.registry.clone(),
        });
        if self.inner.is_eager && matches!(&*self.inner.state.lock(), RefState::Decoded(_)) {
            self.prefetch();
        }
    }

    /// Starts a background resolution without waiting for the result.
    pub fn prefetch(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let this = self.clone();
        runtime.spawn(async move {
            let _ = this.get().await;
        });
    }

    /// Resolves the reference to the target entity, or `None` for a nil
    /// reference.
    ///
    /// Concurrent calls while a fetch is in flight queue on that fetch and
    /// are answered exactly once. After a failure, calls before the backoff
    /// deadline short-circuit to the cached error without touching the
    /// accessor.
    pub async fn get(&self) -> CoreResult<Option<Entity<C>>> {
        loop {
            let plan = {
                let mut st = self.inner.state.lock();
                match &*st {
                    RefState::Loaded(value) => Plan::Done(value.clone()),
                    RefState::Retrieving { tx, .. } => Plan::Wait(tx.subscribe()),
                    RefState::RetrievalError {
                        suspend_until,
                        message,
                        ..
                    } if Instant::now() < *suspend_until => Plan::Suspended(message.clone()),
                    RefState::Decoded(data) | RefState::RetrievalError { data, .. } => {
                        if self.inner.binding.read().is_none() {
                            Plan::NoParent
                        } else {
                            let data = data.clone();
                            let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                            let (tx, _rx) = watch::channel(None);
                            *st = RefState::Retrieving {
                                data: data.clone(),
                                epoch,
                                tx,
                            };
                            Plan::Fetch(data, epoch)
                        }
                    }
                }
            };
            match plan {
                Plan::Done(value) => return Ok(value),
                Plan::Suspended(message) => {
                    return Err(CoreError::reference_suspended(message));
                }
                Plan::NoParent => return Err(CoreError::NoParentData),
                Plan::Wait(mut rx) => match rx.wait_for(Option::is_some).await {
                    Ok(outcome) => {
                        let outcome = outcome
                            .clone()
                            .unwrap_or(ResolveOutcome::Failed("resolution abandoned".into()));
                        return outcome.into_result();
                    }
                    // The fetch was superseded without an answer; start
                    // over against the current state.
                    Err(_) => continue,
                },
                Plan::Fetch(data, epoch) => {
                    let outcome = self.fetch(&data).await;
                    let mut st = self.inner.state.lock();
                    let current = matches!(
                        &*st,
                        RefState::Retrieving { epoch: e, .. } if *e == epoch
                    );
                    if !current {
                        // Superseded by set(); this fetch's result is
                        // discarded for state purposes.
                        drop(st);
                        continue;
                    }
                    let next = match &outcome {
                        ResolveOutcome::Resolved(value) => RefState::Loaded(value.clone()),
                        ResolveOutcome::Failed(message) => RefState::RetrievalError {
                            data: data.clone(),
                            suspend_until: Instant::now() + self.inner.retry_interval,
                            message: message.clone(),
                        },
                    };
                    let old = std::mem::replace(&mut *st, next);
                    drop(st);
                    if let RefState::Retrieving { tx, .. } = old {
                        let _ = tx.send(Some(outcome.clone()));
                    }
                    return outcome.into_result();
                }
            }
        }
    }

    async fn fetch(&self, data: &ReferenceData) -> ResolveOutcome<C> {
        let binding = self.inner.binding.read().clone();
        let Some(binding) = binding else {
            return ResolveOutcome::Failed("reference has no parent context".into());
        };
        let Some(registry) = binding.registry.upgrade() else {
            return ResolveOutcome::Failed("database registry is closed".into());
        };
        let Some(database) = registry.lookup(&data.database_id) else {
            return ResolveOutcome::Failed(format!("unknown database '{}'", data.database_id));
        };
        let collection = match database.collection::<C>(&data.collection_name) {
            Ok(collection) => collection,
            Err(e) => return ResolveOutcome::Failed(e.to_string()),
        };
        match collection.get(data.id).await {
            Ok(Some(entity)) => ResolveOutcome::Resolved(Some(entity)),
            Ok(None) => ResolveOutcome::Failed(format!(
                "entity {} not found in collection '{}'",
                data.id, data.collection_name
            )),
            Err(e) => ResolveOutcome::Failed(e.to_string()),
        }
    }

    /// Replaces the target with `value` and marks the owning parent dirty
    /// on `batch`, so the new foreign-key value is persisted.
    ///
    /// Short-circuits (without touching the parent) if `value` is the
    /// already-loaded target. If a fetch is in flight, its queued waiters
    /// are answered with the newly set value and the superseded fetch's
    /// eventual arrival is discarded.
    pub async fn set(
        &self,
        batch: &EventuallyConsistentBatch,
        value: Option<Entity<C>>,
    ) -> CoreResult<()> {
        {
            let mut st = self.inner.state.lock();
            if let RefState::Loaded(current) = &*st {
                let unchanged = match (current, &value) {
                    (None, None) => true,
                    (Some(a), Some(b)) => a.same_instance(b),
                    _ => false,
                };
                if unchanged {
                    return Ok(());
                }
            }
            let old = std::mem::replace(&mut *st, RefState::Loaded(value.clone()));
            drop(st);
            if let RefState::Retrieving { tx, .. } = old {
                let _ = tx.send(Some(ResolveOutcome::Resolved(value)));
            }
        }
        self.mark_parent_dirty(batch).await
    }

    /// Replaces the target with unresolved wire data and marks the owning
    /// parent dirty on `batch`.
    ///
    /// Waiters queued on a superseded fetch re-resolve against the new
    /// data. Eager references start warming the new target immediately.
    pub async fn set_data(
        &self,
        batch: &EventuallyConsistentBatch,
        data: ReferenceData,
    ) -> CoreResult<()> {
        {
            let mut st = self.inner.state.lock();
            if matches!(&*st, RefState::Decoded(current) if *current == data) {
                return Ok(());
            }
            // Dropping a superseded Retrieving sender closes its channel;
            // waiters observe the closure and re-resolve.
            *st = RefState::Decoded(data);
        }
        if self.inner.is_eager {
            self.prefetch();
        }
        self.mark_parent_dirty(batch).await
    }

    async fn mark_parent_dirty(&self, batch: &EventuallyConsistentBatch) -> CoreResult<()> {
        let binding = self.inner.binding.read().clone();
        let Some(binding) = binding else {
            return Err(CoreError::NoParentData);
        };
        let Some(parent) = binding.parent_handle.upgrade() else {
            return Err(CoreError::invalid_operation(
                "owning parent entity is no longer alive",
            ));
        };
        parent.mark_dirty().await?;
        batch.register(parent)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireNil {
    is_eager: bool,
    is_nil: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WirePopulated<'a> {
    database_id: &'a str,
    id: EntityId,
    is_eager: bool,
    collection_name: &'a str,
    version: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOwned {
    is_eager: bool,
    #[serde(default)]
    is_nil: bool,
    #[serde(default)]
    database_id: Option<String>,
    #[serde(default)]
    collection_name: Option<String>,
    #[serde(default)]
    id: Option<EntityId>,
    #[serde(default)]
    version: Option<u64>,
}

impl<C: EntityItem> Serialize for EntityReference<C> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let st = self.inner.state.lock();
        match &*st {
            RefState::Loaded(None) => WireNil {
                is_eager: self.inner.is_eager,
                is_nil: true,
            }
            .serialize(serializer),
            RefState::Loaded(Some(entity)) => {
                let collection = entity.bound_collection().upgrade().ok_or_else(|| {
                    S::Error::custom("referenced entity is not bound to a collection")
                })?;
                let database = collection.database().upgrade().ok_or_else(|| {
                    S::Error::custom("referenced entity's database is closed")
                })?;
                WirePopulated {
                    database_id: database.id(),
                    id: entity.id(),
                    is_eager: self.inner.is_eager,
                    collection_name: collection.name(),
                    version: entity.version(),
                }
                .serialize(serializer)
            }
            RefState::Decoded(data)
            | RefState::Retrieving { data, .. }
            | RefState::RetrievalError { data, .. } => WirePopulated {
                database_id: &data.database_id,
                id: data.id,
                is_eager: self.inner.is_eager,
                collection_name: &data.collection_name,
                version: data.version,
            }
            .serialize(serializer),
        }
    }
}

impl<'de, C: EntityItem> Deserialize<'de> for EntityReference<C> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireOwned::deserialize(deserializer)?;
        if wire.is_nil {
            return Ok(Self::nil(wire.is_eager));
        }
        let (Some(database_id), Some(collection_name), Some(id), Some(version)) =
            (wire.database_id, wire.collection_name, wire.id, wire.version)
        else {
            return Err(D::Error::custom(
                "populated reference requires databaseId, collectionName, id, and version",
            ));
        };
        Ok(Self::from_data(
            ReferenceData {
                database_id,
                collection_name,
                id,
                version,
            },
            wire.is_eager,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Child {
        label: String,
    }

    impl EntityItem for Child {}

    #[test]
    fn nil_reference_wire_shape() {
        let reference: EntityReference<Child> = EntityReference::nil(true);
        let value = serde_json::to_value(&reference).unwrap();
        assert_eq!(value["isEager"], true);
        assert_eq!(value["isNil"], true);
        assert!(value.get("databaseId").is_none());
    }

    #[test]
    fn populated_reference_roundtrip() {
        let data = ReferenceData {
            database_id: "main".into(),
            collection_name: "children".into(),
            id: EntityId::new(),
            version: 7,
        };
        let reference: EntityReference<Child> = EntityReference::from_data(data.clone(), false);
        let value = serde_json::to_value(&reference).unwrap();
        assert_eq!(value["databaseId"], "main");
        assert_eq!(value["collectionName"], "children");
        assert_eq!(value["version"], 7);
        assert_eq!(value["isEager"], false);

        let decoded: EntityReference<Child> = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.reference_data(), Some(data));
        assert!(!decoded.is_eager());
        assert!(!decoded.is_loaded());
    }

    #[test]
    fn populated_reference_requires_all_fields() {
        let result: Result<EntityReference<Child>, _> =
            serde_json::from_str(r#"{"isEager": false, "databaseId": "main"}"#);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unbound_reference_resolution_is_no_parent_data() {
        let reference: EntityReference<Child> = EntityReference::from_data(
            ReferenceData {
                database_id: "main".into(),
                collection_name: "children".into(),
                id: EntityId::new(),
                version: 0,
            },
            false,
        );
        let err = reference.get().await.unwrap_err();
        assert!(matches!(err, CoreError::NoParentData));
    }
}
