//! Item types and a database harness for engine tests.

use perdure_accessor::{Accessor, MemoryAccessor};
use perdure_core::{
    BatchConfig, Database, DatabaseConfig, DatabaseRegistry, EntityItem, EntityReference,
    EventuallyConsistentBatch, MemorySink, ReferenceContext,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A small reference-free item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestItem {
    /// An integer field.
    pub my_int: i64,
    /// A string field.
    pub my_string: String,
}

impl TestItem {
    /// Creates a new item.
    pub fn new(my_int: i64, my_string: impl Into<String>) -> Self {
        Self {
            my_int,
            my_string: my_string.into(),
        }
    }
}

impl EntityItem for TestItem {}

/// An item holding a reference to a [`TestItem`] entity.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedItem {
    /// A name field.
    pub name: String,
    /// The referenced partner entity.
    pub partner: EntityReference<TestItem>,
}

impl LinkedItem {
    /// Creates an item with a nil (lazy) partner reference.
    pub fn unlinked(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partner: EntityReference::nil(false),
        }
    }
}

impl EntityItem for LinkedItem {
    fn bind_references(&mut self, ctx: &ReferenceContext) {
        self.partner.bind(ctx);
    }
}

/// An open in-memory database with capturing diagnostics.
///
/// Bundles the registry, the database, the [`MemoryAccessor`] behind it,
/// and a [`MemorySink`] so tests can assert on both storage traffic and
/// log output.
pub struct TestHarness {
    /// The registry the database is registered in.
    pub registry: Arc<DatabaseRegistry>,
    /// The open database.
    pub db: Arc<Database>,
    /// The in-memory store behind the database.
    pub accessor: Arc<MemoryAccessor>,
    /// The capturing log sink.
    pub sink: Arc<MemorySink>,
}

impl std::fmt::Debug for TestHarness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestHarness").finish_non_exhaustive()
    }
}

impl TestHarness {
    /// Opens a database named `id` in a fresh registry.
    pub fn open(id: &str) -> perdure_core::CoreResult<Self> {
        let registry = DatabaseRegistry::new();
        Self::open_in(&registry, DatabaseConfig::new(id))
    }

    /// Opens a database in `registry`, for multi-database scenarios.
    pub fn open_in(
        registry: &Arc<DatabaseRegistry>,
        config: DatabaseConfig,
    ) -> perdure_core::CoreResult<Self> {
        Self::open_wrapped(registry, config, |accessor| accessor)
    }

    /// Opens a database whose accessor is `wrap` applied to a fresh
    /// [`MemoryAccessor`].
    ///
    /// The harness keeps the inner accessor, so stores wrapped in a
    /// fault-injecting layer remain inspectable.
    pub fn open_wrapped(
        registry: &Arc<DatabaseRegistry>,
        config: DatabaseConfig,
        wrap: impl FnOnce(Arc<MemoryAccessor>) -> Arc<dyn Accessor>,
    ) -> perdure_core::CoreResult<Self> {
        let accessor = Arc::new(MemoryAccessor::new());
        let sink = Arc::new(MemorySink::new());
        let db = Database::open(config, wrap(Arc::clone(&accessor)), sink.clone(), registry)?;
        Ok(Self {
            registry: Arc::clone(registry),
            db,
            accessor,
            sink,
        })
    }

    /// Creates a batch reporting into the harness sink, with default
    /// policy.
    pub fn batch(&self) -> EventuallyConsistentBatch {
        self.batch_with(BatchConfig::default())
    }

    /// Creates a batch reporting into the harness sink.
    pub fn batch_with(&self, config: BatchConfig) -> EventuallyConsistentBatch {
        EventuallyConsistentBatch::new(self.sink.clone(), config)
    }
}
