//! Type-erased entity capability interface.

use crate::entity::{EntityId, PersistenceState};
use crate::error::{CommitOutcome, CoreResult};
use async_trait::async_trait;
use std::time::Duration;

/// The narrow capability interface batches and references need from an
/// entity, independent of its payload type.
///
/// Entities of different payload types coexist in one batch or registrar by
/// being stored behind `Arc<dyn EntityHandle>`. [`crate::Entity::handle`]
/// produces the handle for a concrete entity.
#[async_trait]
pub trait EntityHandle: Send + Sync {
    /// The entity's identity.
    fn entity_id(&self) -> EntityId;

    /// The payload type name, for diagnostics.
    fn item_type(&self) -> &'static str;

    /// A snapshot of the current persistence state.
    ///
    /// Read from an atomic mirror, so it is safe to call from synchronous
    /// contexts such as batch teardown logging.
    fn persistence_state(&self) -> PersistenceState;

    /// A snapshot of the current version.
    fn version(&self) -> u64;

    /// Drives the entity's commit protocol.
    ///
    /// A `timeout` bounds only how long the caller waits; the in-flight
    /// build/fire sequence is never cancelled.
    async fn commit(&self, timeout: Option<Duration>) -> CommitOutcome;

    /// Flags the entity as having an unsynchronized local mutation.
    ///
    /// Used by references after rewriting a foreign-key value inside the
    /// parent's item.
    async fn mark_dirty(&self) -> CoreResult<()>;
}
