//! Backend adapters: the leaf translators of an iopx chain. Each turns
//! abstract file-ops into calls against one concrete store.
//!
//! The real driver libraries (the clustered filesystem's handle library and
//! the backup service's session library) are opaque external collaborators
//! whose wire protocols are out of scope; these adapters talk to a local
//! stand-in for each — a real POSIX directory tree for the clustered
//! filesystem, direct-libc style, and an on-disk item store for the backup
//! service.

pub mod backup_service;
pub mod clustered_fs;

pub use backup_service::{BackupServiceAdapter, JobType, StoreId};
pub use clustered_fs::ClusteredFsAdapter;
