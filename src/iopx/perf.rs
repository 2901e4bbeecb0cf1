//! The perf translator (`perf`): top-of-stack timer/counter that correlates
//! async callbacks back to their submission time by request-id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::{Iopx, ReadCallback};
use crate::error::DmResult;
use crate::filestat::FileStat;
use crate::flags::{OpenFlags, Whence, XAttrFlags};
use crate::handle::{CorrelationMap, FileHandle};
use crate::location::{Location, Uuid};
use crate::request::{OpKind, SequenceCounter};

/// `{count, total_microseconds}`, plus total bytes for reads/writes.
#[derive(Default)]
pub struct OpStats {
    count: AtomicU64,
    total_micros: AtomicU64,
    total_bytes: AtomicU64,
}

impl OpStats {
    fn record(&self, elapsed_micros: u64, bytes: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(elapsed_micros, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn total_micros(&self) -> u64 {
        self.total_micros.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}

pub struct Perf {
    child: Arc<dyn Iopx>,
    stats: Mutex<HashMap<OpKind, Arc<OpStats>>>,
    /// Submission time per in-flight async request, keyed by the sequence
    /// number this layer assigns on dispatch.
    inflight: Arc<CorrelationMap<u64, Instant>>,
    seq: SequenceCounter,
}

impl Perf {
    pub fn new(child: Arc<dyn Iopx>) -> Arc<Self> {
        Arc::new(Self {
            child,
            stats: Mutex::new(HashMap::new()),
            inflight: Arc::new(CorrelationMap::new()),
            seq: SequenceCounter::new(),
        })
    }

    pub fn stats_for(&self, op: OpKind) -> Arc<OpStats> {
        self.stats
            .lock()
            .entry(op)
            .or_insert_with(|| Arc::new(OpStats::default()))
            .clone()
    }

    fn timed<T>(&self, op: OpKind, bytes: impl Fn(&T) -> u64, f: impl FnOnce() -> DmResult<T>) -> DmResult<T> {
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed().as_micros() as u64;
        let byte_count = result.as_ref().map(&bytes).unwrap_or(0);
        self.stats_for(op).record(elapsed, byte_count);
        result
    }
}

impl Iopx for Perf {
    fn name(&self) -> &'static str {
        "perf"
    }

    fn child(&self) -> Option<&Arc<dyn Iopx>> {
        Some(&self.child)
    }

    fn pread(&self, handle: &FileHandle, offset: u64, len: u32) -> DmResult<Vec<u8>> {
        self.timed(OpKind::Pread, |buf: &Vec<u8>| buf.len() as u64, || {
            self.child.pread(handle, offset, len)
        })
    }

    /// Allocates a sequence number, stores the submission time keyed by it,
    /// delegates down, and on completion looks the sequence number back up
    /// to compute elapsed time before invoking the caller's callback exactly
    /// once.
    fn pread_async(&self, handle: FileHandle, offset: u64, len: u32, callback: ReadCallback) {
        let seq = self.seq.next();
        self.inflight.insert(seq, Instant::now());
        let stats = self.stats_for(OpKind::Pread);
        let inflight = self.inflight.clone();
        let wrapped: ReadCallback = Box::new(move |result| {
            let start = inflight.remove(&seq);
            if let Some(start) = start {
                let elapsed = start.elapsed().as_micros() as u64;
                let bytes = result.as_ref().map(|b| b.len() as u64).unwrap_or(0);
                stats.record(elapsed, bytes);
            }
            callback(result);
        });
        self.child.pread_async(handle, offset, len, wrapped);
    }

    fn pwrite(&self, handle: &FileHandle, offset: u64, data: &[u8]) -> DmResult<u32> {
        self.timed(OpKind::Pwrite, |n: &u32| *n as u64, || self.child.pwrite(handle, offset, data))
    }

    fn open(&self, loc: &Location, flags: OpenFlags) -> DmResult<FileHandle> {
        self.timed(OpKind::Open, |_| 0, || self.child.open(loc, flags))
    }

    fn creat(&self, loc: &Location, flags: OpenFlags, mode: u32, len_hint: u64) -> DmResult<FileHandle> {
        self.timed(OpKind::Creat, |_| 0, || self.child.creat(loc, flags, mode, len_hint))
    }

    fn fstat(&self, handle: &FileHandle) -> DmResult<FileStat> {
        self.timed(OpKind::Fstat, |_| 0, || self.child.fstat(handle))
    }

    fn stat(&self, loc: &Location) -> DmResult<FileStat> {
        self.timed(OpKind::Stat, |_| 0, || self.child.stat(loc))
    }

    fn getuuid(&self, loc: &Location) -> DmResult<Uuid> {
        self.child.getuuid(loc)
    }

    fn resolve(&self, loc: &Location) -> DmResult<Vec<Location>> {
        self.child.resolve(loc)
    }

    fn gethosts(&self) -> DmResult<Vec<String>> {
        self.child.gethosts()
    }

    fn scan(&self, loc: &Location, mode: super::ScanMode) -> DmResult<String> {
        self.child.scan(loc, mode)
    }

    fn fsetxattr(&self, handle: &FileHandle, name: &str, value: &[u8], flags: XAttrFlags) -> DmResult<()> {
        self.child.fsetxattr(handle, name, value, flags)
    }

    fn getxattr(&self, loc: &Location, name: &str) -> DmResult<Vec<u8>> {
        self.child.getxattr(loc, name)
    }

    fn lseek(&self, handle: &FileHandle, offset: i64, whence: Whence) -> DmResult<i64> {
        self.child.lseek(handle, offset, whence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Product;
    use std::sync::atomic::AtomicBool;

    struct FakeBackend { fail: AtomicBool }
    impl Iopx for FakeBackend {
        fn name(&self) -> &'static str { "fake-backend" }
        fn child(&self) -> Option<&Arc<dyn Iopx>> { None }
        fn pread(&self, _handle: &FileHandle, _offset: u64, len: u32) -> DmResult<Vec<u8>> {
            Ok(vec![0u8; len as usize])
        }
    }

    #[test]
    fn sync_read_updates_stats() {
        let backend: Arc<dyn Iopx> = Arc::new(FakeBackend { fail: AtomicBool::new(false) });
        let perf = Perf::new(backend);
        let handle = FileHandle::new(Location::new(Product::ClusteredFs, "vol1", "/a"));
        let data = perf.pread(&handle, 0, 128).unwrap();
        assert_eq!(data.len(), 128);
        let stats = perf.stats_for(OpKind::Pread);
        assert_eq!(stats.count(), 1);
        assert_eq!(stats.total_bytes(), 128);
    }

    #[test]
    fn async_read_fires_callback_exactly_once_with_correct_bytes() {
        let backend: Arc<dyn Iopx> = Arc::new(FakeBackend { fail: AtomicBool::new(false) });
        let perf = Perf::new(backend);
        let handle = FileHandle::new(Location::new(Product::ClusteredFs, "vol1", "/a"));
        let fired = Arc::new(Mutex::new(0u32));
        let fired2 = fired.clone();
        perf.pread_async(handle, 0, 64, Box::new(move |result| {
            *fired2.lock() += 1;
            assert_eq!(result.unwrap().len(), 64);
        }));
        assert_eq!(*fired.lock(), 1);
        assert_eq!(perf.stats_for(OpKind::Pread).count(), 1);
    }
}
