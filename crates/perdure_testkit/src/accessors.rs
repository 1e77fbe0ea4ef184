//! Fault-injecting accessor wrappers.

use async_trait::async_trait;
use parking_lot::Mutex;
use perdure_accessor::{Accessor, AccessorResult, MemoryAccessor};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// An accessor wrapper whose writes can be made to never return.
///
/// Reads always pass through. A stalled write parks forever on a pending
/// future, which under `tokio::time::pause` lets timers auto-advance, so
/// timeout paths can be exercised deterministically.
pub struct StallingAccessor {
    inner: Arc<MemoryAccessor>,
    stalled_ids: Mutex<HashSet<Uuid>>,
    stall_all_writes: AtomicBool,
}

impl StallingAccessor {
    /// Wraps `inner`, stalling nothing yet.
    #[must_use]
    pub fn new(inner: Arc<MemoryAccessor>) -> Self {
        Self {
            inner,
            stalled_ids: Mutex::new(HashSet::new()),
            stall_all_writes: AtomicBool::new(false),
        }
    }

    /// Stalls every write touching `id`.
    pub fn stall_writes_for(&self, id: Uuid) {
        self.stalled_ids.lock().insert(id);
    }

    /// Stalls every write, regardless of id.
    pub fn stall_all_writes(&self) {
        self.stall_all_writes.store(true, Ordering::SeqCst);
    }

    /// Lifts every stall for writes submitted from now on.
    ///
    /// Writes already parked stay parked.
    pub fn clear_stalls(&self) {
        self.stall_all_writes.store(false, Ordering::SeqCst);
        self.stalled_ids.lock().clear();
    }

    /// Returns the wrapped in-memory store.
    #[must_use]
    pub fn inner(&self) -> &Arc<MemoryAccessor> {
        &self.inner
    }

    async fn gate(&self, id: Uuid) {
        let stalled =
            self.stall_all_writes.load(Ordering::SeqCst) || self.stalled_ids.lock().contains(&id);
        if stalled {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl Accessor for StallingAccessor {
    async fn get(&self, collection: &str, id: Uuid) -> AccessorResult<Option<Vec<u8>>> {
        self.inner.get(collection, id).await
    }

    async fn add(&self, collection: &str, id: Uuid, bytes: Vec<u8>) -> AccessorResult<()> {
        self.gate(id).await;
        self.inner.add(collection, id, bytes).await
    }

    async fn update(&self, collection: &str, id: Uuid, bytes: Vec<u8>) -> AccessorResult<()> {
        self.gate(id).await;
        self.inner.update(collection, id, bytes).await
    }

    async fn remove(&self, collection: &str, id: Uuid) -> AccessorResult<()> {
        self.gate(id).await;
        self.inner.remove(collection, id).await
    }

    async fn scan(&self, collection: &str) -> AccessorResult<Vec<Vec<u8>>> {
        self.inner.scan(collection).await
    }
}

struct Gate {
    closed: AtomicBool,
    permits: tokio::sync::Semaphore,
    waiting: AtomicUsize,
}

impl Gate {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            permits: tokio::sync::Semaphore::new(0),
            waiting: AtomicUsize::new(0),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Drain permits left over from an earlier open so the gate actually
        // holds again on the next cycle.
        self.permits.forget_permits(usize::MAX);
    }

    fn open(&self) {
        // The swap makes repeated opens a no-op, so the permit pool cannot
        // overflow however many close/open cycles a test runs.
        if self.closed.swap(false, Ordering::SeqCst) {
            self.permits
                .add_permits(tokio::sync::Semaphore::MAX_PERMITS / 4);
        }
    }

    async fn pass(&self) {
        if !self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.waiting.fetch_add(1, Ordering::SeqCst);
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An accessor wrapper whose reads and writes can be held at a gate and
/// released one at a time.
///
/// Unlike [`StallingAccessor`], held operations eventually complete: the
/// test controls exactly when. This is how overlap windows are created
/// deterministically, e.g. mutating an entity while its write is in
/// flight, or issuing a second read while the first has not answered.
pub struct GatedAccessor {
    inner: Arc<MemoryAccessor>,
    reads: Gate,
    writes: Gate,
}

impl GatedAccessor {
    /// Wraps `inner` with both gates open.
    #[must_use]
    pub fn new(inner: Arc<MemoryAccessor>) -> Self {
        Self {
            inner,
            reads: Gate::new(),
            writes: Gate::new(),
        }
    }

    /// Closes the write gate; writes park until released.
    pub fn close_writes(&self) {
        self.writes.close();
    }

    /// Closes the read gate; `get` calls park until released.
    pub fn close_reads(&self) {
        self.reads.close();
    }

    /// Releases `n` parked or future writes through the gate.
    pub fn release_writes(&self, n: usize) {
        self.writes.permits.add_permits(n);
    }

    /// Releases `n` parked or future reads through the gate.
    pub fn release_reads(&self, n: usize) {
        self.reads.permits.add_permits(n);
    }

    /// Reopens the write gate and releases everything parked at it.
    ///
    /// Calling this on an already-open gate is a no-op.
    pub fn open_writes(&self) {
        self.writes.open();
    }

    /// Reopens the read gate and releases everything parked at it.
    ///
    /// Calling this on an already-open gate is a no-op.
    pub fn open_reads(&self) {
        self.reads.open();
    }

    /// Returns the number of writes currently parked at the gate.
    #[must_use]
    pub fn parked_writes(&self) -> usize {
        self.writes.waiting.load(Ordering::SeqCst)
    }

    /// Returns the number of reads currently parked at the gate.
    #[must_use]
    pub fn parked_reads(&self) -> usize {
        self.reads.waiting.load(Ordering::SeqCst)
    }

    /// Yields until `parked` operations are parked at the gates combined.
    pub async fn wait_for_parked(&self, parked: usize) {
        while self.parked_writes() + self.parked_reads() < parked {
            tokio::task::yield_now().await;
        }
    }

    /// Returns the wrapped in-memory store.
    #[must_use]
    pub fn inner(&self) -> &Arc<MemoryAccessor> {
        &self.inner
    }
}

#[async_trait]
impl Accessor for GatedAccessor {
    async fn get(&self, collection: &str, id: Uuid) -> AccessorResult<Option<Vec<u8>>> {
        self.reads.pass().await;
        self.inner.get(collection, id).await
    }

    async fn add(&self, collection: &str, id: Uuid, bytes: Vec<u8>) -> AccessorResult<()> {
        self.writes.pass().await;
        self.inner.add(collection, id, bytes).await
    }

    async fn update(&self, collection: &str, id: Uuid, bytes: Vec<u8>) -> AccessorResult<()> {
        self.writes.pass().await;
        self.inner.update(collection, id, bytes).await
    }

    async fn remove(&self, collection: &str, id: Uuid) -> AccessorResult<()> {
        self.writes.pass().await;
        self.inner.remove(collection, id).await
    }

    async fn scan(&self, collection: &str) -> AccessorResult<Vec<Vec<u8>>> {
        self.inner.scan(collection).await
    }
}
