//! # Perdure Core
//!
//! An in-process object-persistence engine: typed entities with identity,
//! versioning, and a commit state machine, persisted through a pluggable
//! async storage accessor.
//!
//! ## Core pieces
//!
//! - [`Entity`] - one persistable object with a private serialized
//!   execution context and a build/fire commit protocol
//! - [`EventuallyConsistentBatch`] - aggregates entities and commits each
//!   independently under one retry/timeout policy
//! - [`Collection`] - per-type identity cache with single-flight loads;
//!   at most one live instance per id
//! - [`EntityReference`] - typed, lazily resolved cross-entity (and
//!   cross-database) pointers with negative caching
//! - [`Database`] / [`DatabaseRegistry`] - explicit ownership of
//!   collections and database identity
//!
//! Storage is abstracted behind [`Accessor`]; the engine never interprets
//! failures itself, it trusts the accessor's recoverable/unrecoverable
//! classification.
//!
//! ## Example
//!
//! ```rust
//! use perdure_core::{
//!     BatchConfig, Database, DatabaseConfig, DatabaseRegistry, EntityItem,
//!     EventuallyConsistentBatch, MemoryAccessor, TracingSink,
//! };
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Task {
//!     title: String,
//!     done: bool,
//! }
//!
//! impl EntityItem for Task {}
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = DatabaseRegistry::new();
//! let logger = Arc::new(TracingSink);
//! let db = Database::open(
//!     DatabaseConfig::new("main"),
//!     Arc::new(MemoryAccessor::new()),
//!     logger.clone(),
//!     &registry,
//! )?;
//! let tasks = db.collection::<Task>("tasks")?;
//!
//! let batch = EventuallyConsistentBatch::new(logger, BatchConfig::default());
//! let task = tasks
//!     .create(&batch, Task { title: "write docs".into(), done: false })
//!     .await?;
//! let result = batch.commit().await?;
//! assert!(result.is_fully_committed());
//! assert_eq!(task.version(), 1);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod codec;
mod collection;
mod config;
mod database;
mod entity;
mod error;
mod log;
mod reference;
mod registrar;

pub use batch::{BatchResult, EntityReport, EventuallyConsistentBatch, Settlement};
pub use codec::decode_entity;
pub use collection::Collection;
pub use config::{BatchConfig, DatabaseConfig};
pub use database::{Database, DatabaseRegistry};
pub use entity::{
    Entity, EntityHandle, EntityId, EntityItem, EntitySnapshot, PendingAction, PersistenceState,
};
pub use error::{CommitOutcome, CoreError, CoreResult};
pub use log::{LogLevel, LogRecord, LogSink, MemorySink, TracingSink};
pub use reference::{
    EntityReference, ParentData, ReferenceContext, ReferenceData, DEFAULT_RETRY_INTERVAL,
};
pub use registrar::Registrar;

pub use perdure_accessor::{Accessor, AccessorError, AccessorResult, ErrorClass, MemoryAccessor};
