//! In-memory accessor for testing and ephemeral databases.

use crate::accessor::Accessor;
use crate::error::{AccessorError, AccessorResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

/// Per-operation call counters for a [`MemoryAccessor`].
///
/// Useful for asserting single-flight and no-op guarantees in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// Number of `get` calls observed.
    pub gets: usize,
    /// Number of `add` calls observed.
    pub adds: usize,
    /// Number of `update` calls observed.
    pub updates: usize,
    /// Number of `remove` calls observed.
    pub removes: usize,
    /// Number of `scan` calls observed.
    pub scans: usize,
}

impl CallCounts {
    /// Total number of write calls (`add` + `update` + `remove`).
    #[must_use]
    pub fn writes(&self) -> usize {
        self.adds + self.updates + self.removes
    }

    /// Total number of calls of any kind.
    #[must_use]
    pub fn total(&self) -> usize {
        self.gets + self.writes() + self.scans
    }
}

/// An in-memory accessor.
///
/// Stores records in a map of `collection -> id -> bytes`. Suitable for
/// unit tests, integration tests, and ephemeral databases.
///
/// Every operation is counted, and failures can be scripted ahead of time
/// to exercise the engine's retry and rollback paths.
///
/// # Example
///
/// ```rust
/// use perdure_accessor::{Accessor, MemoryAccessor};
/// use uuid::Uuid;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let accessor = MemoryAccessor::new();
/// let id = Uuid::new_v4();
/// accessor.add("things", id, b"payload".to_vec()).await.unwrap();
/// assert_eq!(accessor.get("things", id).await.unwrap(), Some(b"payload".to_vec()));
/// assert_eq!(accessor.counts().writes(), 1);
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryAccessor {
    records: Mutex<HashMap<String, HashMap<Uuid, Vec<u8>>>>,
    queued_failures: Mutex<Vec<AccessorError>>,
    gets: AtomicUsize,
    adds: AtomicUsize,
    updates: AtomicUsize,
    removes: AtomicUsize,
    scans: AtomicUsize,
}

impl MemoryAccessor {
    /// Creates a new empty accessor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an error to be returned by the next operation.
    ///
    /// Queued errors are consumed in FIFO order, one per operation, before
    /// the operation touches the store.
    pub fn queue_failure(&self, error: AccessorError) {
        self.queued_failures.lock().push(error);
    }

    /// Returns the call counters observed so far.
    #[must_use]
    pub fn counts(&self) -> CallCounts {
        CallCounts {
            gets: self.gets.load(Ordering::SeqCst),
            adds: self.adds.load(Ordering::SeqCst),
            updates: self.updates.load(Ordering::SeqCst),
            removes: self.removes.load(Ordering::SeqCst),
            scans: self.scans.load(Ordering::SeqCst),
        }
    }

    /// Returns the number of records currently stored in `collection`.
    #[must_use]
    pub fn record_count(&self, collection: &str) -> usize {
        self.records
            .lock()
            .get(collection)
            .map_or(0, HashMap::len)
    }

    /// Returns a copy of the record stored for `id`, if any.
    ///
    /// Does not count as a `get` call. Useful for post-hoc assertions.
    #[must_use]
    pub fn raw_record(&self, collection: &str, id: Uuid) -> Option<Vec<u8>> {
        self.records
            .lock()
            .get(collection)
            .and_then(|c| c.get(&id).cloned())
    }

    fn take_queued_failure(&self) -> Option<AccessorError> {
        let mut queued = self.queued_failures.lock();
        if queued.is_empty() {
            None
        } else {
            Some(queued.remove(0))
        }
    }
}

#[async_trait]
impl Accessor for MemoryAccessor {
    async fn get(&self, collection: &str, id: Uuid) -> AccessorResult<Option<Vec<u8>>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_queued_failure() {
            return Err(err);
        }
        Ok(self
            .records
            .lock()
            .get(collection)
            .and_then(|c| c.get(&id).cloned()))
    }

    async fn add(&self, collection: &str, id: Uuid, bytes: Vec<u8>) -> AccessorResult<()> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_queued_failure() {
            return Err(err);
        }
        let mut records = self.records.lock();
        let entries = records.entry(collection.to_string()).or_default();
        match entries.get(&id) {
            // Idempotent re-delivery of the same record is fine.
            Some(existing) if *existing == bytes => Ok(()),
            Some(_) => Err(AccessorError::unrecoverable(format!(
                "duplicate id {id} in collection '{collection}'"
            ))),
            None => {
                entries.insert(id, bytes);
                Ok(())
            }
        }
    }

    async fn update(&self, collection: &str, id: Uuid, bytes: Vec<u8>) -> AccessorResult<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_queued_failure() {
            return Err(err);
        }
        let mut records = self.records.lock();
        match records.get_mut(collection).and_then(|c| c.get_mut(&id)) {
            Some(slot) => {
                *slot = bytes;
                Ok(())
            }
            None => Err(AccessorError::unrecoverable(format!(
                "update of unknown id {id} in collection '{collection}'"
            ))),
        }
    }

    async fn remove(&self, collection: &str, id: Uuid) -> AccessorResult<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_queued_failure() {
            return Err(err);
        }
        if let Some(entries) = self.records.lock().get_mut(collection) {
            entries.remove(&id);
        }
        Ok(())
    }

    async fn scan(&self, collection: &str) -> AccessorResult<Vec<Vec<u8>>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_queued_failure() {
            return Err(err);
        }
        Ok(self
            .records
            .lock()
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }
}
