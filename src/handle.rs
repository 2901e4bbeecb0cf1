//! `FileHandle`: a ref-counted object bound to a `Location`, carrying a
//! heterogeneous per-layer side-table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{DmResult, OsError};
use crate::location::Location;

/// One layer's private per-file state. Tagged by variant; a reader that
/// expects a particular variant asserts the tag.
#[derive(Debug, Clone)]
pub enum SideTableEntry {
    /// The clustered-filesystem adapter's native fd.
    NativeFd(i32),
    /// The fd-cache's slot index for this uuid.
    CacheSlot(usize),
    /// A backend-assigned GUID (backup-service `creat`).
    BackendGuid(crate::location::Uuid),
    /// The backup-service stream handle bound to this file for its
    /// lifetime (one item in flight at a time).
    StreamId(u64),
    /// Bookkeeping for a pending async restore callback: sequence number
    /// plus bytes copied so far.
    PendingRestore { seq: u64, bytes_copied: u64 },
    /// A generic per-layer stats counter (perf layer).
    StatsSlot(u64),
}

impl SideTableEntry {
    pub fn as_native_fd(&self) -> DmResult<i32> {
        match self {
            SideTableEntry::NativeFd(fd) => Ok(*fd),
            other => Err(OsError::new(
                libc::EBADF,
                format!("side-table entry tag mismatch: expected NativeFd, got {:?}", other),
            )),
        }
    }

    pub fn as_cache_slot(&self) -> DmResult<usize> {
        match self {
            SideTableEntry::CacheSlot(idx) => Ok(*idx),
            other => Err(OsError::new(
                libc::EBADF,
                format!("side-table entry tag mismatch: expected CacheSlot, got {:?}", other),
            )),
        }
    }

    pub fn as_stream_id(&self) -> DmResult<u64> {
        match self {
            SideTableEntry::StreamId(id) => Ok(*id),
            other => Err(OsError::new(
                libc::EBADF,
                format!("side-table entry tag mismatch: expected StreamId, got {:?}", other),
            )),
        }
    }
}

#[derive(Debug)]
struct FileHandleInner {
    location: Location,
    size_hint: AtomicU64,
    failed: AtomicBool,
    /// One-shot latch: guards against a duplicate async completion callback.
    callback_fired: AtomicBool,
    /// Installed in pre-order during open; a layer's `close` walks this in
    /// reverse. Insertion order is the install order.
    side_table: Mutex<Vec<(&'static str, SideTableEntry)>>,
}

/// A ref-counted file handle. Cloning increments the refcount; the last
/// clone to drop does not auto-close — callers must route through
/// `Iopx::close` so that close can propagate errors per layer.
#[derive(Clone, Debug)]
pub struct FileHandle(Arc<FileHandleInner>);

impl FileHandle {
    pub fn new(location: Location) -> Self {
        Self(Arc::new(FileHandleInner {
            location,
            size_hint: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            callback_fired: AtomicBool::new(false),
            side_table: Mutex::new(Vec::new()),
        }))
    }

    pub fn location(&self) -> &Location {
        &self.0.location
    }

    pub fn size_hint(&self) -> u64 {
        self.0.size_hint.load(Ordering::Acquire)
    }

    pub fn set_size_hint(&self, size: u64) {
        self.0.size_hint.store(size, Ordering::Release);
    }

    pub fn mark_failed(&self) {
        self.0.failed.store(true, Ordering::Release);
    }

    pub fn failed(&self) -> bool {
        self.0.failed.load(Ordering::Acquire)
    }

    /// Returns `true` exactly once across all clones of this handle; every
    /// subsequent call returns `false`. Backs the async-restore one-shot
    /// completion latch.
    pub fn take_callback_once(&self) -> bool {
        self.0
            .callback_fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Records a layer's side-table entry. Called in pre-order during open.
    pub fn install_side_table(&self, layer: &'static str, entry: SideTableEntry) {
        self.0.side_table.lock().push((layer, entry));
    }

    pub fn side_table(&self, layer: &'static str) -> Option<SideTableEntry> {
        self.0
            .side_table
            .lock()
            .iter()
            .rev()
            .find(|(name, _)| *name == layer)
            .map(|(_, entry)| entry.clone())
    }

    /// Layers installed for this handle, in install (pre-)order.
    pub fn installed_layers(&self) -> Vec<&'static str> {
        self.0.side_table.lock().iter().map(|(name, _)| *name).collect()
    }

    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

/// Generic key/value correlation map used by the perf layer (request-id ->
/// start time) and the fd-cache (uuid -> in-flight read-ahead state).
pub struct CorrelationMap<K, V> {
    inner: Mutex<HashMap<K, V>>,
}

impl<K: std::hash::Hash + Eq, V> CorrelationMap<K, V> {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.inner.lock().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains_key(key)
    }
}

impl<K: std::hash::Hash + Eq, V> Default for CorrelationMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
