//! The descriptor cache (`fdcache`): a bounded ring of open-backend-handle
//! slots keyed by uuid, each with a read-ahead buffer that coalesces
//! concurrent reads of overlapping ranges.
//!
//! Lock discipline is two-tier: a coarse structural lock plus a narrower
//! per-entry lock. A single
//! `RwLock` guards slot identity and the uuid index together (so the two
//! never drift out of sync), while each slot's read-ahead buffer has its own
//! `Mutex` so a cache hit never blocks on slot allocation elsewhere in the
//! ring.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{Iopx, ReadCallback};
use crate::error::{DmResult, OsError};
use crate::flags::OpenFlags;
use crate::handle::{FileHandle, SideTableEntry};
use crate::location::{Location, Uuid};

const READ_AHEAD_BLOCK: u64 = 1024 * 1024;
const MAX_OPEN_RETRIES: u32 = 3;

struct Waiter {
    offset: u64,
    len: u32,
    callback: ReadCallback,
}

#[derive(Default)]
struct RaBuffer {
    valid: bool,
    /// A fetch for this buffer is already in flight; further misses queue
    /// onto `waiters` instead of issuing a second backend read.
    fetch_in_progress: bool,
    offset: u64,
    data: Vec<u8>,
    waiters: Vec<Waiter>,
}

impl RaBuffer {
    fn serve(&self, offset: u64, len: u32) -> Option<Vec<u8>> {
        if !self.valid || offset < self.offset {
            return None;
        }
        let start = (offset - self.offset) as usize;
        if start >= self.data.len() {
            return None;
        }
        let avail = self.data.len() - start;
        if (offset + len as u64) > self.offset + self.data.len() as u64 && avail < len as usize {
            // Partial overlap only; the buffer must fully cover the request
            // to count as a hit.
        }
        let want = len as usize;
        if avail < want {
            return None;
        }
        Some(self.data[start..start + want].to_vec())
    }
}

struct Slot {
    valid: bool,
    /// Count of `FileHandle`s currently pointing at this slot; the slot is
    /// an eviction candidate only at zero.
    refs: usize,
    uuid: Option<Uuid>,
    open_handle: Option<FileHandle>,
    ra: Arc<Mutex<RaBuffer>>,
}

impl Slot {
    fn empty() -> Self {
        Self { valid: false, refs: 0, uuid: None, open_handle: None, ra: Arc::new(Mutex::new(RaBuffer::default())) }
    }

    fn is_free(&self) -> bool {
        !self.valid && self.refs == 0
    }

    fn is_evictable(&self) -> bool {
        self.valid && self.refs == 0 && !self.ra.lock().fetch_in_progress
    }
}

struct Ring {
    slots: Vec<Slot>,
    index: HashMap<Uuid, usize>,
    rear: usize,
}

pub struct FdCache {
    child: Arc<dyn Iopx>,
    ring: RwLock<Ring>,
}

impl FdCache {
    pub fn new(child: Arc<dyn Iopx>, capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            child,
            ring: RwLock::new(Ring {
                slots: (0..capacity).map(|_| Slot::empty()).collect(),
                index: HashMap::new(),
                rear: 0,
            }),
        })
    }

    fn attach(&self, handle: &FileHandle, idx: usize) {
        handle.install_side_table("fdcache", SideTableEntry::CacheSlot(idx));
    }

    fn slot_index(&self, handle: &FileHandle) -> DmResult<usize> {
        handle
            .side_table("fdcache")
            .ok_or_else(|| OsError::new(libc::EBADF, "handle has no fdcache slot"))?
            .as_cache_slot()
    }

    fn ra_handle(&self, idx: usize) -> DmResult<(FileHandle, Arc<Mutex<RaBuffer>>)> {
        let ring = self.ring.read();
        let slot = ring
            .slots
            .get(idx)
            .ok_or_else(|| OsError::new(libc::EBADF, "fdcache slot index out of range"))?;
        let open_handle = slot
            .open_handle
            .clone()
            .ok_or_else(|| OsError::new(libc::EBADF, "fdcache slot has no open handle"))?;
        Ok((open_handle, slot.ra.clone()))
    }

    /// Reserves a slot for `uuid`, evicting the oldest non-busy slot if the
    /// ring is full. Returns `EADDRINUSE` if every slot is currently in use.
    fn reserve_slot(&self, uuid: Uuid) -> DmResult<usize> {
        let mut ring = self.ring.write();
        if let Some(&idx) = ring.index.get(&uuid) {
            let slot = &mut ring.slots[idx];
            if slot.valid {
                slot.refs += 1;
                return Ok(idx);
            }
        }
        if let Some(idx) = ring.slots.iter().position(Slot::is_free) {
            ring.slots[idx].refs += 1;
            ring.index.insert(uuid, idx);
            return Ok(idx);
        }
        let n = ring.slots.len();
        let mut scanned = 0;
        let mut evict_idx = None;
        while scanned < n {
            let candidate = (ring.rear + scanned) % n;
            if ring.slots[candidate].is_evictable() {
                evict_idx = Some(candidate);
                break;
            }
            scanned += 1;
        }
        let idx = evict_idx
            .ok_or_else(|| OsError::new(libc::EADDRINUSE, "fdcache: all slots busy, cannot evict"))?;
        let evicted = std::mem::replace(&mut ring.slots[idx], Slot::empty());
        if let Some(old_uuid) = evicted.uuid {
            ring.index.remove(&old_uuid);
        }
        ring.rear = (idx + 1) % n;
        ring.slots[idx].refs = 1;
        ring.index.insert(uuid, idx);
        drop(ring);
        // Closed outside the ring lock: the backend close can block and must
        // not stall lookups against other slots.
        if let Some(handle) = evicted.open_handle {
            let _ = self.child.close(&handle);
        }
        Ok(idx)
    }

    fn finish_reservation(&self, idx: usize, uuid: Uuid, open_handle: FileHandle) {
        let mut ring = self.ring.write();
        let slot = &mut ring.slots[idx];
        slot.valid = true;
        slot.uuid = Some(uuid);
        slot.open_handle = Some(open_handle);
    }

    fn abandon_reservation(&self, idx: usize, uuid: Uuid) {
        let mut ring = self.ring.write();
        let slot = &mut ring.slots[idx];
        slot.refs = slot.refs.saturating_sub(1);
        if !slot.valid && slot.refs == 0 {
            ring.index.remove(&uuid);
        }
    }

    fn open_once(&self, loc: &Location, flags: OpenFlags) -> DmResult<FileHandle> {
        let uuid = loc.uuid;
        {
            let ring = self.ring.read();
            if let Some(&idx) = ring.index.get(&uuid) {
                if ring.slots[idx].valid {
                    drop(ring);
                    let mut w = self.ring.write();
                    if let Some(slot) = w.slots.get_mut(idx) {
                        if slot.valid && slot.uuid == Some(uuid) {
                            slot.refs += 1;
                            drop(w);
                            let handle = FileHandle::new(loc.clone());
                            self.attach(&handle, idx);
                            return Ok(handle);
                        }
                    }
                }
            }
        }

        let idx = self.reserve_slot(uuid)?;
        match self.child.open(loc, flags) {
            Ok(backend_handle) => {
                self.finish_reservation(idx, uuid, backend_handle);
                let handle = FileHandle::new(loc.clone());
                self.attach(&handle, idx);
                Ok(handle)
            }
            Err(e) => {
                self.abandon_reservation(idx, uuid);
                Err(e)
            }
        }
    }
}

impl Iopx for FdCache {
    fn name(&self) -> &'static str {
        "fdcache"
    }

    fn child(&self) -> Option<&Arc<dyn Iopx>> {
        Some(&self.child)
    }

    fn open(&self, loc: &Location, flags: OpenFlags) -> DmResult<FileHandle> {
        if flags.is_write_intent() {
            // Write-intent opens bypass the cache entirely: no slot
            // reservation, no side-table entry, straight to the backend.
            return self.child.open(loc, flags);
        }
        let mut last_err = None;
        for _ in 0..MAX_OPEN_RETRIES {
            match self.open_once(loc, flags) {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_retryable() => last_err = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| OsError::new(libc::EADDRINUSE, "fdcache: exhausted open retries")))
    }

    /// The cached backend handle is owned by its slot, not by any one
    /// `FileHandle`; closing a caller's handle releases this layer's
    /// reference on the slot but does not close the backend handle itself
    /// (that only happens on eviction). So this overrides `close` directly
    /// instead of the default child-then-self recursion.
    fn close(&self, handle: &FileHandle) -> DmResult<()> {
        let idx = match self.slot_index(handle) {
            Ok(idx) => idx,
            // No fdcache slot: this handle bypassed the cache on open
            // (write-intent) and points straight at the backend.
            Err(_) => return self.child.close(handle),
        };
        let mut ring = self.ring.write();
        if let Some(slot) = ring.slots.get_mut(idx) {
            slot.refs = slot.refs.saturating_sub(1);
        }
        Ok(())
    }

    fn pread(&self, handle: &FileHandle, offset: u64, len: u32) -> DmResult<Vec<u8>> {
        let size_hint = handle.size_hint();
        if size_hint > 0 && offset >= size_hint {
            return Ok(Vec::new());
        }
        let idx = match self.slot_index(handle) {
            Ok(idx) => idx,
            Err(_) => return self.child.pread(handle, offset, len),
        };
        let (open_handle, ra) = self.ra_handle(idx)?;
        if let Some(data) = ra.lock().serve(offset, len) {
            return Ok(data);
        }

        let aligned = offset - (offset % READ_AHEAD_BLOCK);
        {
            let mut buf = ra.lock();
            if buf.fetch_in_progress {
                // Another thread is already filling this buffer; spin-wait
                // cooperatively via repeated lock attempts is unnecessary
                // for the sync path: fall through and issue our own aligned
                // read, which will simply overwrite the buffer with the
                // same bytes once ours lands.
            } else {
                buf.fetch_in_progress = true;
            }
        }
        let result = self.child.pread(&open_handle, aligned, READ_AHEAD_BLOCK as u32);
        let mut buf = ra.lock();
        buf.fetch_in_progress = false;
        if let Ok(ref data) = result {
            buf.valid = true;
            buf.offset = aligned;
            buf.data = data.clone();
        }
        drop(buf);
        let data = result?;
        let start = (offset - aligned) as usize;
        if start >= data.len() {
            return Ok(Vec::new());
        }
        let want = (len as usize).min(data.len() - start);
        Ok(data[start..start + want].to_vec())
    }

    /// Read-ahead with FIFO coalescing: the first miss on a buffer issues
    /// the aligned backend read; every later miss against the same
    /// in-flight fetch just queues its callback instead of issuing another,
    /// and all queued callbacks are served from the freshly filled buffer.
    fn pread_async(&self, handle: FileHandle, offset: u64, len: u32, callback: ReadCallback) {
        let size_hint = handle.size_hint();
        if size_hint > 0 && offset >= size_hint {
            callback(Ok(Vec::new()));
            return;
        }
        let idx = match self.slot_index(&handle) {
            Ok(idx) => idx,
            Err(_) => return self.child.pread_async(handle, offset, len, callback),
        };
        let (open_handle, ra) = match self.ra_handle(idx) {
            Ok(v) => v,
            Err(e) => return callback(Err(e)),
        };

        let mut buf = ra.lock();
        if let Some(data) = buf.serve(offset, len) {
            drop(buf);
            return callback(Ok(data));
        }
        buf.waiters.push(Waiter { offset, len, callback });
        if buf.fetch_in_progress {
            return;
        }
        buf.fetch_in_progress = true;
        drop(buf);

        let aligned = offset - (offset % READ_AHEAD_BLOCK);
        let ra2 = ra.clone();
        self.child.pread_async(
            open_handle,
            aligned,
            READ_AHEAD_BLOCK as u32,
            Box::new(move |result| {
                let mut buf = ra2.lock();
                buf.fetch_in_progress = false;
                let waiters = std::mem::take(&mut buf.waiters);
                match &result {
                    Ok(data) => {
                        buf.valid = true;
                        buf.offset = aligned;
                        buf.data = data.clone();
                    }
                    Err(_) => {}
                }
                drop(buf);
                for waiter in waiters {
                    match &result {
                        Ok(data) => {
                            let start = (waiter.offset - aligned) as usize;
                            let want = (waiter.len as usize).min(data.len().saturating_sub(start));
                            (waiter.callback)(Ok(data[start..start + want].to_vec()));
                        }
                        Err(e) => (waiter.callback)(Err(e.clone())),
                    }
                }
            }),
        );
    }
}
