//! Capacity-bounded frame heap with absent-on-evict handles.
//!
//! Large buffers (frame images, aligned faces, masks) are stored once and
//! travel through the pipeline as small [`HeapHandle`]s inside envelopes.
//! The heap is shared by every stage; cloning a [`WeakHeap`] clones the
//! handle to the same arena.
//!
//! "Weak" means a handle may stop resolving: when an `add` would exceed the
//! capacity, the least-recently-resolved entries are evicted. A consumer that
//! resolves an evicted handle gets `None` and must treat the feature as
//! unavailable for that frame.
//!
//! # Concurrency
//!
//! Every operation takes the arena lock once, so `add`, `get` and `remove`
//! are individually atomic. No caller holds the lock across calls: each
//! handle has exactly one writer (the stage that produced it).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Bytes per megabyte used for the capacity setting.
pub const BYTES_PER_MB: usize = 1024 * 1024;

/// Opaque reference to a buffer stored in a [`WeakHeap`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct HeapHandle(u64);

impl HeapHandle {
    /// Raw handle value (for logging and diagnostics).
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for HeapHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HeapHandle({})", self.0)
    }
}

/// Point-in-time statistics about the heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub entries: usize,
    pub used_bytes: usize,
    pub capacity_bytes: usize,
    pub total_added: u64,
    pub evictions: u64,
    /// Buffers that were larger than the whole heap and never stored.
    pub rejected: u64,
}

struct HeapEntry {
    data: Arc<[u8]>,
    /// Recency stamp; key into `HeapState::recency`.
    stamp: u64,
}

struct HeapState {
    entries: HashMap<u64, HeapEntry>,
    /// stamp → handle, oldest first.
    recency: BTreeMap<u64, u64>,
    clock: u64,
    next_handle: u64,
    used_bytes: usize,
    total_added: u64,
    evictions: u64,
    rejected: u64,
}

impl HeapState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, handle)) = self.recency.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&handle) {
            self.used_bytes -= entry.data.len();
            self.evictions += 1;
            tracing::debug!(
                "Heap evicted handle {} ({} bytes, {} used)",
                handle,
                entry.data.len(),
                self.used_bytes
            );
        }
        true
    }
}

struct HeapInner {
    capacity_bytes: usize,
    state: Mutex<HeapState>,
}

/// Shared arena of immutable byte buffers with LRU eviction.
#[derive(Clone)]
pub struct WeakHeap {
    inner: Arc<HeapInner>,
}

impl WeakHeap {
    /// Create a heap bounded to `capacity_mb` megabytes.
    pub fn new(capacity_mb: usize) -> Self {
        Self::with_capacity_bytes(capacity_mb.saturating_mul(BYTES_PER_MB))
    }

    /// Create a heap bounded to an exact byte count.
    pub fn with_capacity_bytes(capacity_bytes: usize) -> Self {
        Self {
            inner: Arc::new(HeapInner {
                capacity_bytes,
                state: Mutex::new(HeapState {
                    entries: HashMap::new(),
                    recency: BTreeMap::new(),
                    clock: 0,
                    next_handle: 1,
                    used_bytes: 0,
                    total_added: 0,
                    evictions: 0,
                    rejected: 0,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeapState> {
        // A panicking stage must not take the shared arena down with it.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store a buffer and return its handle.
    ///
    /// Never blocks on consumers and never fails: if room is needed the
    /// least-recently-resolved entries are evicted first. A buffer larger
    /// than the whole capacity is not stored and its handle resolves absent.
    pub fn add(&self, data: impl Into<Arc<[u8]>>) -> HeapHandle {
        let data: Arc<[u8]> = data.into();
        let len = data.len();
        let mut state = self.lock();

        let handle = state.next_handle;
        state.next_handle += 1;
        state.total_added += 1;

        if len > self.inner.capacity_bytes {
            state.rejected += 1;
            tracing::debug!(
                "Heap rejected {} byte buffer (capacity {})",
                len,
                self.inner.capacity_bytes
            );
            return HeapHandle(handle);
        }

        while state.used_bytes + len > self.inner.capacity_bytes {
            if !state.evict_oldest() {
                break;
            }
        }

        let stamp = state.tick();
        state.recency.insert(stamp, handle);
        state.entries.insert(handle, HeapEntry { data, stamp });
        state.used_bytes += len;

        HeapHandle(handle)
    }

    /// Resolve a handle. Returns `None` once the entry has been evicted or removed.
    ///
    /// Resolving counts as a use for eviction ordering.
    pub fn get(&self, handle: HeapHandle) -> Option<Arc<[u8]>> {
        let mut state = self.lock();
        let stamp = state.tick();
        let entry = state.entries.get_mut(&handle.0)?;
        let old_stamp = std::mem::replace(&mut entry.stamp, stamp);
        let data = entry.data.clone();
        state.recency.remove(&old_stamp);
        state.recency.insert(stamp, handle.0);
        Some(data)
    }

    /// Whether the handle still resolves, without touching recency.
    pub fn contains(&self, handle: HeapHandle) -> bool {
        self.lock().entries.contains_key(&handle.0)
    }

    /// Drop an entry early. Returns whether it was present.
    pub fn remove(&self, handle: HeapHandle) -> bool {
        let mut state = self.lock();
        match state.entries.remove(&handle.0) {
            Some(entry) => {
                state.recency.remove(&entry.stamp);
                state.used_bytes -= entry.data.len();
                true
            }
            None => false,
        }
    }

    pub fn capacity_bytes(&self) -> usize {
        self.inner.capacity_bytes
    }

    pub fn used_bytes(&self) -> usize {
        self.lock().used_bytes
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> HeapStats {
        let state = self.lock();
        HeapStats {
            entries: state.entries.len(),
            used_bytes: state.used_bytes,
            capacity_bytes: self.inner.capacity_bytes,
            total_added: state.total_added,
            evictions: state.evictions,
            rejected: state.rejected,
        }
    }

    /// Whether two values refer to the same arena.
    pub fn same_heap(&self, other: &WeakHeap) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for WeakHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("WeakHeap")
            .field("entries", &stats.entries)
            .field("used_bytes", &stats.used_bytes)
            .field("capacity_bytes", &stats.capacity_bytes)
            .finish()
    }
}
