//! Collection: identity cache and factory for entities of one type.

use crate::batch::EventuallyConsistentBatch;
use crate::codec;
use crate::database::Database;
use crate::entity::{Entity, EntityId, EntityInner, EntityItem};
use crate::error::{CoreError, CoreResult};
use crate::log::LogLevel;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// Shared outcome of a single-flight load, delivered to every coalesced
/// caller.
enum LoadOutcome<T: EntityItem> {
    Found(Entity<T>),
    Missing,
    Failed(String),
}

impl<T: EntityItem> Clone for LoadOutcome<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Found(entity) => Self::Found(entity.clone()),
            Self::Missing => Self::Missing,
            Self::Failed(message) => Self::Failed(message.clone()),
        }
    }
}

impl<T: EntityItem> LoadOutcome<T> {
    fn into_result(self) -> CoreResult<Option<Entity<T>>> {
        match self {
            Self::Found(entity) => Ok(Some(entity)),
            Self::Missing => Ok(None),
            Self::Failed(message) => Err(CoreError::retrieval(message)),
        }
    }
}

struct CacheState<T: EntityItem> {
    live: HashMap<EntityId, Weak<EntityInner<T>>>,
    loading: HashMap<EntityId, watch::Receiver<Option<LoadOutcome<T>>>>,
}

enum Plan<T: EntityItem> {
    Hit(Entity<T>),
    Wait(watch::Receiver<Option<LoadOutcome<T>>>),
    Load(watch::Sender<Option<LoadOutcome<T>>>),
}

/// The identity cache and factory for entities of one type within a
/// [`Database`].
///
/// The collection guarantees that at most one live [`Entity`] instance
/// exists per id: concurrent [`Collection::get`] calls for an uncached id
/// coalesce onto exactly one accessor read, and all callers receive the
/// same instance (or the same error). The cache is authoritative while an
/// instance is alive; it is consulted before the accessor on every read.
pub struct Collection<T: EntityItem> {
    name: String,
    database: Weak<Database>,
    cache: Mutex<CacheState<T>>,
    self_weak: Weak<Collection<T>>,
}

impl<T: EntityItem> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<T: EntityItem> Collection<T> {
    pub(crate) fn new_arc(name: String, database: Weak<Database>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            name,
            database,
            cache: Mutex::new(CacheState {
                live: HashMap::new(),
                loading: HashMap::new(),
            }),
            self_weak: weak.clone(),
        })
    }

    /// Returns the collection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn database(&self) -> Weak<Database> {
        self.database.clone()
    }

    /// Returns the number of live cached entities.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        let mut cache = self.cache.lock();
        cache.live.retain(|_, weak| weak.strong_count() > 0);
        cache.live.len()
    }

    /// Returns the entity with `id`, or `None` if no record exists.
    ///
    /// A cached instance is returned without touching the accessor. For an
    /// uncached id, the first concurrent caller performs the read/decode;
    /// the rest wait for that one read's outcome.
    pub async fn get(&self, id: EntityId) -> CoreResult<Option<Entity<T>>> {
        loop {
            let plan = {
                let mut cache = self.cache.lock();
                if let Some(weak) = cache.live.get(&id) {
                    if let Some(inner) = weak.upgrade() {
                        return Ok(Some(Entity::from_inner(inner)));
                    }
                    cache.live.remove(&id);
                }
                if let Some(rx) = cache.loading.get(&id) {
                    Plan::Wait(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(None);
                    cache.loading.insert(id, rx);
                    Plan::Load(tx)
                }
            };
            match plan {
                Plan::Hit(entity) => return Ok(Some(entity)),
                Plan::Wait(mut rx) => match rx.wait_for(Option::is_some).await {
                    Ok(outcome) => {
                        let outcome = outcome.clone().unwrap_or(LoadOutcome::Missing);
                        return outcome.into_result();
                    }
                    // The loader vanished without answering; start over.
                    Err(_) => continue,
                },
                Plan::Load(tx) => {
                    let outcome = self.load_uncached(id).await;
                    {
                        let mut cache = self.cache.lock();
                        cache.loading.remove(&id);
                        if let LoadOutcome::Found(entity) = &outcome {
                            cache
                                .live
                                .insert(id, Arc::downgrade(entity.inner_arc()));
                        }
                    }
                    let _ = tx.send(Some(outcome.clone()));
                    return outcome.into_result();
                }
            }
        }
    }

    async fn load_uncached(&self, id: EntityId) -> LoadOutcome<T> {
        let Some(db) = self.database.upgrade() else {
            return LoadOutcome::Failed("owning database is closed".to_string());
        };
        match db.accessor().get(&self.name, id.as_uuid()).await {
            Err(e) => LoadOutcome::Failed(e.to_string()),
            Ok(None) => {
                db.logger().log(
                    LogLevel::Warning,
                    "collection",
                    "cacheMiss",
                    "read against unknown id",
                    &[
                        ("collectionName", self.name.clone()),
                        ("entityId", id.to_string()),
                    ],
                );
                LoadOutcome::Missing
            }
            Ok(Some(bytes)) => match codec::decode_entity::<T>(&bytes) {
                Err(e) => LoadOutcome::Failed(format!("failed to decode record {id}: {e}")),
                Ok(entity) => {
                    self.adopt(&entity, &db).await;
                    LoadOutcome::Found(entity)
                }
            },
        }
    }

    async fn adopt(&self, entity: &Entity<T>, db: &Arc<Database>) {
        if let Some(collection) = self.self_weak.upgrade() {
            entity
                .bind(&collection, db.schema_version(), db.registry())
                .await;
        }
    }

    /// Creates a fresh `new`-state entity, caches it, and registers it on
    /// `batch` for persistence.
    pub async fn create(
        &self,
        batch: &EventuallyConsistentBatch,
        item: T,
    ) -> CoreResult<Entity<T>> {
        let db = self
            .database
            .upgrade()
            .ok_or_else(|| CoreError::invalid_operation("owning database is closed"))?;
        let entity = Entity::create_new(EntityId::new(), item, db.schema_version());
        self.adopt(&entity, &db).await;
        self.cache
            .lock()
            .live
            .insert(entity.id(), Arc::downgrade(entity.inner_arc()));
        batch.register(entity.handle())?;
        Ok(entity)
    }

    /// Creates a fresh entity from a closure; see [`Collection::create`].
    pub async fn create_with(
        &self,
        batch: &EventuallyConsistentBatch,
        make: impl FnOnce() -> T,
    ) -> CoreResult<Entity<T>> {
        self.create(batch, make()).await
    }

    /// Reads and decodes every record in the collection.
    pub async fn scan(&self) -> CoreResult<Vec<Entity<T>>> {
        self.scan_filtered(|_| true).await
    }

    /// Reads and decodes every record whose item matches `pred`.
    ///
    /// Each decoded id is reconciled against the cache exactly like
    /// [`Collection::get`]: already-cached instances win over the freshly
    /// decoded copy, and in-flight loads are awaited rather than raced.
    pub async fn scan_filtered(
        &self,
        pred: impl Fn(&T) -> bool,
    ) -> CoreResult<Vec<Entity<T>>> {
        let db = self
            .database
            .upgrade()
            .ok_or_else(|| CoreError::invalid_operation("owning database is closed"))?;
        let payloads = db.accessor().scan(&self.name).await?;
        let mut out = Vec::with_capacity(payloads.len());
        for bytes in payloads {
            let decoded = codec::decode_entity::<T>(&bytes)?;
            if !decoded.with_item(|item| pred(item)).await {
                continue;
            }
            out.push(self.reconcile(decoded, &db).await?);
        }
        Ok(out)
    }

    /// Resolves `fresh` against the cache: a live cached instance wins, an
    /// in-flight load is awaited, otherwise `fresh` is bound and cached.
    async fn reconcile(&self, fresh: Entity<T>, db: &Arc<Database>) -> CoreResult<Entity<T>> {
        let id = fresh.id();
        loop {
            let plan = {
                let mut cache = self.cache.lock();
                if let Some(weak) = cache.live.get(&id) {
                    if let Some(inner) = weak.upgrade() {
                        Plan::Hit(Entity::from_inner(inner))
                    } else {
                        cache.live.remove(&id);
                        continue;
                    }
                } else if let Some(rx) = cache.loading.get(&id) {
                    Plan::Wait(rx.clone())
                } else {
                    cache.live.insert(id, Arc::downgrade(fresh.inner_arc()));
                    // Reuse the Load arm as the "fresh instance adopted"
                    // path; the sender is unused.
                    let (tx, _rx) = watch::channel(None);
                    Plan::Load(tx)
                }
            };
            match plan {
                Plan::Hit(cached) => return Ok(cached),
                Plan::Wait(mut rx) => match rx.wait_for(Option::is_some).await {
                    Ok(outcome) => {
                        if let Some(LoadOutcome::Found(cached)) = &*outcome {
                            return Ok(cached.clone());
                        }
                        // The load found nothing; fall through and retry
                        // with the freshly decoded instance.
                        drop(outcome);
                        continue;
                    }
                    Err(_) => continue,
                },
                Plan::Load(_) => {
                    self.adopt(&fresh, db).await;
                    return Ok(fresh);
                }
            }
        }
    }

    /// Binds previously decoded, collection-less entities to this
    /// collection.
    ///
    /// Returns the retained instance per input entity: an id already cached
    /// (or duplicated earlier in the input) collapses onto the one retained
    /// instance.
    pub async fn initialize(&self, entities: Vec<Entity<T>>) -> CoreResult<Vec<Entity<T>>> {
        let db = self
            .database
            .upgrade()
            .ok_or_else(|| CoreError::invalid_operation("owning database is closed"))?;
        let mut out = Vec::with_capacity(entities.len());
        for entity in entities {
            if let Some(bound) = entity.bound_collection().upgrade() {
                if !std::ptr::eq(Arc::as_ptr(&bound), self as *const Self) {
                    return Err(CoreError::invalid_operation(format!(
                        "entity {} is already bound to collection '{}'",
                        entity.id(),
                        bound.name()
                    )));
                }
            }
            out.push(self.reconcile(entity, &db).await?);
        }
        Ok(out)
    }
}
