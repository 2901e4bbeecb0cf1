//! Pluggable I/O translator stack and data-management engine for moving
//! file content between a clustered filesystem and a backup-service archive.
//!
//! A chain of [`iopx::Iopx`] layers (`perf -> [meta] -> [fdcache] ->
//! backend`) translates a small set of file operations down to one of two
//! backend adapters; the [`engine::Engine`] builds and caches those chains,
//! and [`dispatch`] drives the scan/backup/archive/restore workflows over
//! them.

#[cfg(all(not(feature = "serial"), not(feature = "parallel")))]
compile_error!("At least one of the features 'serial' or 'parallel' must be enabled");

#[cfg(all(feature = "serial", feature = "parallel"))]
compile_error!("Feature 'serial' cannot be used with feature 'parallel'");

pub mod abi;
pub mod backends;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod filestat;
pub mod flags;
pub mod handle;
pub mod iopx;
pub mod location;
pub mod pool;
pub mod request;
pub mod xattr;

pub mod prelude {
    //! Re-exports the types most callers need to build and drive a tree.
    pub use crate::engine::{BackendConfig, Engine, Role, TreeConfig};
    pub use crate::error::{DmResult, ErrorKind, OsError};
    pub use crate::filestat::{FileKind, FileStat};
    pub use crate::flags::{OpenFlags, Whence, XAttrFlags};
    pub use crate::handle::FileHandle;
    pub use crate::iopx::{Iopx, ScanMode};
    pub use crate::location::{Location, Product, Uuid};
}
