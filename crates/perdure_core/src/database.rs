//! Database: owner of collections for one accessor.

use crate::collection::Collection;
use crate::config::DatabaseConfig;
use crate::entity::EntityItem;
use crate::error::{CoreError, CoreResult};
use crate::log::{LogLevel, LogSink};
use crate::registrar::Registrar;
use perdure_accessor::Accessor;
use std::any::Any;
use std::sync::{Arc, Weak};

/// An explicit process-wide registry of open databases.
///
/// Cross-database references resolve their `databaseId` through a registry.
/// Registration is owned by [`Database::open`] and undone by an explicit
/// [`Database::close`]; there is no finalizer magic.
pub struct DatabaseRegistry {
    databases: Registrar<String, Database>,
}

impl DatabaseRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            databases: Registrar::new(),
        })
    }

    /// Returns the open database with `id`, if registered.
    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<Arc<Database>> {
        self.databases.lookup(&id.to_string())
    }

    /// Returns the number of registered live databases.
    #[must_use]
    pub fn count(&self) -> usize {
        self.databases.count()
    }
}

/// The owner of one accessor's collections.
///
/// A `Database` supplies the schema version stamp and the logger, enforces
/// collection-name uniqueness through its registrar, and hands its accessor
/// to collections and entities. Collections are held weakly: callers keep
/// the `Arc<Collection>` alive for as long as they need the identity cache.
pub struct Database {
    id: String,
    schema_version: i64,
    accessor: Arc<dyn Accessor>,
    logger: Arc<dyn LogSink>,
    collections: Registrar<String, dyn Any + Send + Sync>,
    registry: Weak<DatabaseRegistry>,
    self_weak: Weak<Database>,
}

impl Database {
    /// Opens a database and registers its id in `registry`.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error for an empty id and a
    /// `DuplicateRegistration` error (logged EMERGENCY) if another live
    /// database already holds the id.
    pub fn open(
        config: DatabaseConfig,
        accessor: Arc<dyn Accessor>,
        logger: Arc<dyn LogSink>,
        registry: &Arc<DatabaseRegistry>,
    ) -> CoreResult<Arc<Self>> {
        if config.id.is_empty() {
            return Err(CoreError::validation("database id must not be empty"));
        }
        let db = Arc::new_cyclic(|weak| Self {
            id: config.id.clone(),
            schema_version: config.schema_version,
            accessor,
            logger,
            collections: Registrar::new(),
            registry: Arc::downgrade(registry),
            self_weak: weak.clone(),
        });
        if !registry.databases.register(config.id.clone(), &db) {
            db.logger.log(
                LogLevel::Emergency,
                "database",
                "open",
                "database id is already registered",
                &[("databaseId", config.id.clone())],
            );
            return Err(CoreError::duplicate_registration(config.id));
        }
        Ok(db)
    }

    /// Deregisters the database from its registry.
    ///
    /// Entities bound to this database's collections can no longer commit
    /// once the last strong reference is gone; `close` makes the end of the
    /// database's useful lifetime explicit.
    pub fn close(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.databases.deregister(&self.id);
        }
    }

    /// Returns the database id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the schema version stamped onto loaded/created entities.
    #[must_use]
    pub fn schema_version(&self) -> i64 {
        self.schema_version
    }

    /// Returns the storage accessor.
    #[must_use]
    pub fn accessor(&self) -> Arc<dyn Accessor> {
        Arc::clone(&self.accessor)
    }

    /// Returns the logging sink.
    #[must_use]
    pub fn logger(&self) -> &Arc<dyn LogSink> {
        &self.logger
    }

    pub(crate) fn registry(&self) -> Weak<DatabaseRegistry> {
        self.registry.clone()
    }

    /// Returns the collection named `name`, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error for an empty name, and an
    /// `InvalidOperation` error (logged EMERGENCY) if the name is live
    /// under a different item type.
    pub fn collection<T: EntityItem>(&self, name: &str) -> CoreResult<Arc<Collection<T>>> {
        if name.is_empty() {
            return Err(CoreError::validation("collection name must not be empty"));
        }
        let key = name.to_string();
        loop {
            if let Some(existing) = self.collections.lookup(&key) {
                return existing.downcast::<Collection<T>>().map_err(|_| {
                    self.logger.log(
                        LogLevel::Emergency,
                        "database",
                        "collection",
                        "collection name is registered with a different item type",
                        &[
                            ("databaseId", self.id.clone()),
                            ("collectionName", key.clone()),
                        ],
                    );
                    CoreError::invalid_operation(format!(
                        "collection '{key}' is registered with a different item type"
                    ))
                });
            }
            let collection = Collection::<T>::new_arc(key.clone(), self.self_weak.clone());
            let erased: Arc<dyn Any + Send + Sync> = collection.clone();
            if self.collections.register(key.clone(), &erased) {
                return Ok(collection);
            }
            // Lost a registration race; loop and adopt the winner.
        }
    }

    /// Creates the collection named `name`, erroring if it already exists.
    ///
    /// A second registration with the same name is an error, is logged
    /// EMERGENCY, and does not replace the first.
    pub fn create_collection<T: EntityItem>(&self, name: &str) -> CoreResult<Arc<Collection<T>>> {
        if name.is_empty() {
            return Err(CoreError::validation("collection name must not be empty"));
        }
        if self.collections.is_registered(&name.to_string()) {
            self.logger.log(
                LogLevel::Emergency,
                "database",
                "createCollection",
                "collection name is already registered",
                &[
                    ("databaseId", self.id.clone()),
                    ("collectionName", name.to_string()),
                ],
            );
            return Err(CoreError::duplicate_registration(name));
        }
        self.collection(name)
    }

    /// Returns the number of live collections.
    #[must_use]
    pub fn collection_count(&self) -> usize {
        self.collections.count()
    }
}
