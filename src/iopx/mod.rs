//! The `Iopx` translator stack: composable layers of file operations.
//!
//! Every layer implements [`Iopx`] and overrides only the operations it
//! changes; every other operation falls through to [`Iopx::child`] via the
//! trait's default methods: each layer holds an inner layer and every
//! unimplemented method calls through to it, forming an arbitrary-depth
//! per-store pipeline: `perf -> [meta] -> [fdcache] -> backend`.
//!
//! A node's parent pointer is not part of
//! this trait: ownership flows parent -> children only, so a tree is a plain
//! `Arc<dyn Iopx>` chain and there is nothing to break a cycle on. Holding no
//! back-edge at all replaces the C original's intrusive back-edge outright:
//! nothing below the engine's tree cache ever needs to walk upward.

mod fdcache;
mod meta;
mod perf;

pub use fdcache::FdCache;
pub use meta::{Meta, MetaCacheClient, MetaTtl};
pub use perf::{OpStats, Perf};

use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{DmResult, OsError};
use crate::filestat::FileStat;
use crate::flags::{OpenFlags, Whence, XAttrFlags};
use crate::handle::FileHandle;
use crate::location::{Location, Uuid};
use crate::request::OpKind;

pub type ReadCallback = Box<dyn FnOnce(DmResult<Vec<u8>>) + Send>;

/// Full-scan mode passed to `scan`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Full,
    Incremental,
}

/// One layer of the composable file-op pipeline.
pub trait Iopx: Send + Sync {
    fn name(&self) -> &'static str;

    /// This layer's single child, or `None` at a leaf (a backend adapter).
    fn child(&self) -> Option<&Arc<dyn Iopx>>;

    /// Should this op be reposted onto a worker pool before running? None of
    /// the layers specified here override the default; the engine still
    /// consults this before dispatching so a future layer can opt in.
    fn schedule_op(&self, _op: OpKind) -> bool {
        false
    }

    fn open(&self, loc: &Location, flags: OpenFlags) -> DmResult<FileHandle> {
        match self.child() {
            Some(child) => child.open(loc, flags),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    fn creat(&self, loc: &Location, flags: OpenFlags, mode: u32, len_hint: u64) -> DmResult<FileHandle> {
        match self.child() {
            Some(child) => child.creat(loc, flags, mode, len_hint),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    /// Closes this layer's own side-table state for `handle` first via
    /// [`Iopx::close_self`], then recurses into the child. Layers install
    /// side-table state in pre-order during open (root first); closing the
    /// child before `close_self` therefore tears down in reverse order.
    /// Errors from either step are reported, but the other step still runs:
    /// a close propagates even on error.
    fn close(&self, handle: &FileHandle) -> DmResult<()> {
        let child_result = match self.child() {
            Some(child) => child.close(handle),
            None => Ok(()),
        };
        let own_result = self.close_self(handle);
        own_result.and(child_result)
    }

    /// Override to release this layer's own side-table state. Default: no
    /// state was installed, nothing to release.
    fn close_self(&self, _handle: &FileHandle) -> DmResult<()> {
        Ok(())
    }

    fn pread(&self, handle: &FileHandle, offset: u64, len: u32) -> DmResult<Vec<u8>> {
        match self.child() {
            Some(child) => child.pread(handle, offset, len),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    /// Async read path. Default implementation is synchronous-in-disguise:
    /// it calls [`Iopx::pread`] and invokes the callback inline. Layers that
    /// genuinely go async (the fd-cache's read-ahead coalescing, the
    /// backup-service adapter's `restore_object` callback chain, the perf
    /// layer's correlation map) override this instead.
    fn pread_async(&self, handle: FileHandle, offset: u64, len: u32, callback: ReadCallback) {
        callback(self.pread(&handle, offset, len));
    }

    fn pwrite(&self, handle: &FileHandle, offset: u64, data: &[u8]) -> DmResult<u32> {
        match self.child() {
            Some(child) => child.pwrite(handle, offset, data),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    fn fstat(&self, handle: &FileHandle) -> DmResult<FileStat> {
        match self.child() {
            Some(child) => child.fstat(handle),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    fn stat(&self, loc: &Location) -> DmResult<FileStat> {
        match self.child() {
            Some(child) => child.stat(loc),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    fn ftruncate(&self, handle: &FileHandle, len: u64) -> DmResult<()> {
        match self.child() {
            Some(child) => child.ftruncate(handle, len),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    fn truncate(&self, loc: &Location, len: u64) -> DmResult<()> {
        match self.child() {
            Some(child) => child.truncate(loc, len),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    fn lseek(&self, handle: &FileHandle, offset: i64, whence: Whence) -> DmResult<i64> {
        match self.child() {
            Some(child) => child.lseek(handle, offset, whence),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    fn fsetxattr(&self, handle: &FileHandle, name: &str, value: &[u8], flags: XAttrFlags) -> DmResult<()> {
        match self.child() {
            Some(child) => child.fsetxattr(handle, name, value, flags),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    fn setxattr(&self, loc: &Location, name: &str, value: &[u8], flags: XAttrFlags) -> DmResult<()> {
        match self.child() {
            Some(child) => child.setxattr(loc, name, value, flags),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    fn fgetxattr(&self, handle: &FileHandle, name: &str) -> DmResult<Vec<u8>> {
        match self.child() {
            Some(child) => child.fgetxattr(handle, name),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    fn getxattr(&self, loc: &Location, name: &str) -> DmResult<Vec<u8>> {
        match self.child() {
            Some(child) => child.getxattr(loc, name),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    fn fremovexattr(&self, handle: &FileHandle, name: &str) -> DmResult<()> {
        match self.child() {
            Some(child) => child.fremovexattr(handle, name),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    fn removexattr(&self, loc: &Location, name: &str) -> DmResult<()> {
        match self.child() {
            Some(child) => child.removexattr(loc, name),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    fn getuuid(&self, loc: &Location) -> DmResult<Uuid> {
        match self.child() {
            Some(child) => child.getuuid(loc),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    fn resolve(&self, loc: &Location) -> DmResult<Vec<Location>> {
        match self.child() {
            Some(child) => child.resolve(loc),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    fn gethosts(&self) -> DmResult<Vec<String>> {
        match self.child() {
            Some(child) => child.gethosts(),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    fn scan(&self, loc: &Location, mode: ScanMode) -> DmResult<String> {
        match self.child() {
            Some(child) => child.scan(loc, mode),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }

    fn mkdir(&self, loc: &Location, mode: u32) -> DmResult<()> {
        match self.child() {
            Some(child) => child.mkdir(loc, mode),
            None => Err(OsError::new(libc::ENOSYS, format!("{} has no child", self.name()))),
        }
    }
}

pub(crate) fn now() -> SystemTime {
    SystemTime::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Product;

    struct Leaf;
    impl Iopx for Leaf {
        fn name(&self) -> &'static str {
            "leaf"
        }
        fn child(&self) -> Option<&Arc<dyn Iopx>> {
            None
        }
        fn getuuid(&self, _loc: &Location) -> DmResult<Uuid> {
            Ok(Uuid([9; 16]))
        }
    }

    struct PassThrough(Arc<dyn Iopx>);
    impl Iopx for PassThrough {
        fn name(&self) -> &'static str {
            "passthrough"
        }
        fn child(&self) -> Option<&Arc<dyn Iopx>> {
            Some(&self.0)
        }
    }

    #[test]
    fn default_methods_delegate_to_child() {
        let leaf: Arc<dyn Iopx> = Arc::new(Leaf);
        let stack = PassThrough(leaf);
        let loc = Location::new(Product::ClusteredFs, "vol1", "/a");
        assert_eq!(stack.getuuid(&loc).unwrap(), Uuid([9; 16]));
    }

    #[test]
    fn leaf_with_no_child_returns_enosys() {
        let leaf = Leaf;
        let loc = Location::new(Product::ClusteredFs, "vol1", "/a");
        let err = leaf.stat(&loc).unwrap_err();
        assert_eq!(err.raw_error(), libc::ENOSYS);
    }

    #[test]
    fn close_visits_child_before_self() {
        use std::sync::Mutex;
        struct Recording {
            child: Option<Arc<dyn Iopx>>,
            name: &'static str,
            order: Arc<Mutex<Vec<&'static str>>>,
        }
        impl Iopx for Recording {
            fn name(&self) -> &'static str {
                self.name
            }
            fn child(&self) -> Option<&Arc<dyn Iopx>> {
                self.child.as_ref()
            }
            fn close_self(&self, _handle: &FileHandle) -> DmResult<()> {
                self.order.lock().unwrap().push(self.name);
                Ok(())
            }
        }
        let order = Arc::new(Mutex::new(Vec::new()));
        let backend: Arc<dyn Iopx> = Arc::new(Recording { child: None, name: "backend", order: order.clone() });
        let fdcache: Arc<dyn Iopx> = Arc::new(Recording { child: Some(backend), name: "fdcache", order: order.clone() });
        let perf: Arc<dyn Iopx> = Arc::new(Recording { child: Some(fdcache), name: "perf", order: order.clone() });

        let handle = FileHandle::new(Location::new(Product::ClusteredFs, "vol1", "/a"));
        perf.close(&handle).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["backend", "fdcache", "perf"]);
    }
}
