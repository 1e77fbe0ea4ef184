//! Accessor trait definition.

use crate::error::AccessorResult;
use async_trait::async_trait;
use uuid::Uuid;

/// A durable store of opaque records for Perdure.
///
/// Records are addressed by `(collection, id)`. Accessors provide simple
/// at-least-once operations; the engine retries recoverable failures, so
/// implementations must make `add`/`update`/`remove` idempotent with respect
/// to re-delivery of the same record version.
///
/// # Invariants
///
/// - `get` returns exactly the bytes most recently written for that id,
///   or `None` if the id was never added (or has been removed)
/// - `scan` returns the payloads of every live record in the collection,
///   in no particular order
/// - Failures carry an [`crate::ErrorClass`] chosen by the implementation;
///   the engine never second-guesses the classification
///
/// # Implementors
///
/// - [`crate::MemoryAccessor`] - in-memory, instrumented, for tests
#[async_trait]
pub trait Accessor: Send + Sync {
    /// Reads the record for `id`, returning `None` if absent.
    async fn get(&self, collection: &str, id: Uuid) -> AccessorResult<Option<Vec<u8>>>;

    /// Adds a new record.
    ///
    /// Re-adding the same id with the same payload must succeed (idempotent
    /// retry); adding a conflicting payload under an existing id is an
    /// implementation-classified error.
    async fn add(&self, collection: &str, id: Uuid, bytes: Vec<u8>) -> AccessorResult<()>;

    /// Replaces the record for an existing id.
    async fn update(&self, collection: &str, id: Uuid, bytes: Vec<u8>) -> AccessorResult<()>;

    /// Removes the record for `id`. Removing an absent id succeeds.
    async fn remove(&self, collection: &str, id: Uuid) -> AccessorResult<()>;

    /// Returns the payloads of all records in `collection`.
    async fn scan(&self, collection: &str) -> AccessorResult<Vec<Vec<u8>>>;
}
