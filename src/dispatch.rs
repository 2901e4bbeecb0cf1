//! Workflows: scan, backup, archive, restore, and the async read path.
//!
//! These are the engine's per-operation drivers. Each one walks
//! a collect file (or a single path, for restore/read) against a pair of
//! already-built iopx trees; batching, failure tracking, and completion
//! counting live here rather than in the trees themselves, keeping the
//! translator stack itself free of per-workflow driver logic.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{DmResult, OsError};
use crate::flags::OpenFlags;
use crate::handle::FileHandle;
use crate::iopx::{Iopx, ReadCallback, ScanMode};
use crate::location::{Location, Product, Uuid};
use crate::pool::plb_pool;
use crate::xattr::{
    self, OPAR_XATTR_ARCHIVE_BLOCKS, OPAR_XATTR_ARCHIVE_BLOCKSIZE, OPAR_XATTR_ARCHIVE_SIZE,
    OPAR_XATTR_ARCHIVE_UUID, OPAR_XATTR_PRODUCT_ID, OPAR_XATTR_STORE_ID,
};

fn product_label(product: Product) -> &'static str {
    match product {
        Product::ClusteredFs => "clustered-fs",
        Product::BackupService => "backup-service",
    }
}

/// Files a backup or archive pass couldn't process, kept alongside the
/// error so a caller can decide whether to retry.
#[derive(Default)]
pub struct FailedFiles {
    entries: Mutex<Vec<(String, OsError)>>,
}

impl FailedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, path: impl Into<String>, err: OsError) {
        self.entries.lock().push((path.into(), err));
    }

    pub fn list(&self) -> Vec<(String, OsError)> {
        self.entries.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Job-level progress counters a caller polls or waits on: how many files
/// were queued, how many have finished, and the last non-zero return code.
#[derive(Default)]
pub struct DmStats {
    pending: AtomicU64,
    done: AtomicU64,
    ret: AtomicI32,
}

impl DmStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_pending(&self, n: u64) {
        self.pending.fetch_add(n, Ordering::SeqCst);
    }

    pub fn ack(&self, ret: i32) {
        self.done.fetch_add(1, Ordering::SeqCst);
        if ret != 0 {
            self.ret.store(ret, Ordering::SeqCst);
        }
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::SeqCst) >= self.pending.load(Ordering::SeqCst)
    }

    pub fn last_error_code(&self) -> i32 {
        self.ret.load(Ordering::SeqCst)
    }
}

/// Splits a collect file's lines into `work_items` batches of
/// `⌈N / work_items⌉` lines each, renames the original to `<name>.save`,
/// and writes `<name>.1`, `<name>.2`, ... alongside it.
pub fn split_collect_file(path: &Path, work_items: usize) -> DmResult<Vec<PathBuf>> {
    let contents = fs::read_to_string(path).map_err(OsError::from)?;
    let lines: Vec<&str> = contents.lines().filter(|l| !l.is_empty()).collect();
    if lines.is_empty() {
        return Ok(Vec::new());
    }
    let work_items = work_items.max(1);
    let batch_size = (lines.len() + work_items - 1) / work_items;

    let file_name = path
        .file_name()
        .ok_or_else(|| OsError::new(libc::EINVAL, "collect file path has no file name"))?
        .to_string_lossy()
        .into_owned();

    let mut batches = Vec::new();
    for (i, chunk) in lines.chunks(batch_size.max(1)).enumerate() {
        let batch_path = path.with_file_name(format!("{file_name}.{}", i + 1));
        fs::write(&batch_path, chunk.join("\n")).map_err(OsError::from)?;
        batches.push(batch_path);
    }
    let saved_path = path.with_file_name(format!("{file_name}.save"));
    fs::rename(path, &saved_path).map_err(OsError::from)?;
    Ok(batches)
}

fn read_batch_paths(batch_path: &Path) -> DmResult<Vec<String>> {
    let contents = fs::read_to_string(batch_path).map_err(OsError::from)?;
    Ok(contents.lines().filter(|l| !l.is_empty()).map(String::from).collect())
}

/// Runs `scan` against an already-built source tree.
pub fn scan(tree: &Arc<dyn Iopx>, root: &Location, mode: ScanMode) -> DmResult<String> {
    tree.scan(root, mode)
}

/// Copies one file from `source` to `sink`, then marks the source with the
/// three backup-completion xattrs.
///
/// `extent_based` gates the store's first-extent policy: when set, only the
/// leading `min(actual_size, extent_size)` bytes are transferred instead of
/// the whole file.
fn backup_one(
    source: &Arc<dyn Iopx>,
    sink: &Arc<dyn Iopx>,
    product_source: Product,
    product_sink: Product,
    store_source: &str,
    store_sink: &str,
    path: &str,
    extent_size: usize,
    extent_based: bool,
) -> DmResult<()> {
    let src_loc = Location::new(product_source, store_source, path);
    let stat = source.stat(&src_loc)?;
    if !stat.is_regular_file() {
        return Ok(());
    }
    let uuid = source.getuuid(&src_loc)?;
    let src_loc = src_loc.with_uuid(uuid);

    let transfer_len = if extent_based { stat.size.min(extent_size as u64) } else { stat.size };

    let src_handle = source.open(&src_loc, OpenFlags::RDONLY)?;
    let dest_loc = Location::new(product_sink, store_sink, path);
    let dest_handle = sink.creat(&dest_loc, OpenFlags::WRONLY, 0o640, transfer_len)?;

    let result = copy_loop(source, &src_handle, sink, &dest_handle, transfer_len, extent_size);

    let close_src = source.close(&src_handle);
    let close_dest = sink.close(&dest_handle);
    result?;
    close_src?;
    close_dest?;

    let assigned_uuid = dest_handle.location().uuid;
    xattr::set_create_or_replace(|flags| source.setxattr(&src_loc, OPAR_XATTR_ARCHIVE_UUID, &assigned_uuid.0, flags))?;
    xattr::set_create_or_replace(|flags| {
        source.setxattr(&src_loc, OPAR_XATTR_PRODUCT_ID, product_label(product_sink).as_bytes(), flags)
    })?;
    xattr::set_create_or_replace(|flags| source.setxattr(&src_loc, OPAR_XATTR_STORE_ID, store_sink.as_bytes(), flags))?;
    Ok(())
}

fn copy_loop(
    source: &Arc<dyn Iopx>,
    src_handle: &FileHandle,
    sink: &Arc<dyn Iopx>,
    dest_handle: &FileHandle,
    total: u64,
    extent_size: usize,
) -> DmResult<()> {
    let pool = plb_pool(extent_size);
    let mut buf = pool.acquire();
    let mut offset = 0u64;
    while offset < total {
        let want = total.saturating_sub(offset).min(extent_size as u64) as u32;
        let data = source.pread(src_handle, offset, want)?;
        if data.is_empty() {
            break;
        }
        buf[..data.len()].copy_from_slice(&data);
        sink.pwrite(dest_handle, offset, &buf[..data.len()])?;
        offset += data.len() as u64;
    }
    Ok(())
}

/// Drives one backup batch file: reads its paths, copies each to `sink`,
/// and records per-file outcomes in `stats`/`failed`.
pub fn run_backup_batch(
    source: &Arc<dyn Iopx>,
    sink: &Arc<dyn Iopx>,
    product_source: Product,
    product_sink: Product,
    store_source: &str,
    store_sink: &str,
    batch_path: &Path,
    extent_size: usize,
    extent_based: bool,
    stats: &DmStats,
    failed: &FailedFiles,
) -> DmResult<()> {
    let paths = read_batch_paths(batch_path)?;
    stats.add_pending(paths.len() as u64);
    for path in paths {
        match backup_one(
            source,
            sink,
            product_source,
            product_sink,
            store_source,
            store_sink,
            &path,
            extent_size,
            extent_based,
        ) {
            Ok(()) => stats.ack(0),
            Err(e) => {
                stats.ack(e.raw_error());
                failed.push(path, e);
            }
        }
    }
    Ok(())
}

/// Stubs one file's fragments in-place: records size/blocks/block-size on
/// each fragment, then truncates it to zero.
/// Idempotent: a fragment that already carries `OPAR_XATTR_ARCHIVE_SIZE` is
/// left untouched, since that xattr's presence means the archive worker
/// already completed it.
fn archive_one(tree: &Arc<dyn Iopx>, product: Product, store: &str, path: &str) -> DmResult<()> {
    let loc = Location::new(product, store, path);
    let stat = tree.stat(&loc)?;
    if !stat.is_regular_file() {
        return Ok(());
    }
    let uuid = tree.getuuid(&loc)?;
    let loc = loc.with_uuid(uuid);

    for fragment in tree.resolve(&loc)? {
        let handle = tree.open(&fragment, OpenFlags::RDWR)?;
        let already_archived = tree.fgetxattr(&handle, OPAR_XATTR_ARCHIVE_SIZE).is_ok();
        let result = (|| -> DmResult<()> {
            if already_archived {
                return Ok(());
            }
            let frag_stat = tree.fstat(&handle)?;
            xattr::set_create_or_replace(|flags| {
                tree.fsetxattr(&handle, OPAR_XATTR_ARCHIVE_SIZE, &frag_stat.size.to_le_bytes(), flags)
            })?;
            xattr::set_create_or_replace(|flags| {
                tree.fsetxattr(&handle, OPAR_XATTR_ARCHIVE_BLOCKS, &frag_stat.blocks.to_le_bytes(), flags)
            })?;
            xattr::set_create_or_replace(|flags| {
                tree.fsetxattr(&handle, OPAR_XATTR_ARCHIVE_BLOCKSIZE, &(frag_stat.block_size as u64).to_le_bytes(), flags)
            })?;
            tree.ftruncate(&handle, 0)
        })();
        let close = tree.close(&handle);
        result?;
        close?;
    }
    Ok(())
}

pub fn run_archive_batch(
    tree: &Arc<dyn Iopx>,
    product: Product,
    store: &str,
    batch_path: &Path,
    stats: &DmStats,
    failed: &FailedFiles,
) -> DmResult<()> {
    let paths = read_batch_paths(batch_path)?;
    stats.add_pending(paths.len() as u64);
    for path in paths {
        match archive_one(tree, product, store, &path) {
            Ok(()) => stats.ack(0),
            Err(e) => {
                stats.ack(e.raw_error());
                failed.push(path, e);
            }
        }
    }
    Ok(())
}

/// Copies one item back from the backup-service `source` tree (fdcache +
/// meta enabled) to the clustered-filesystem `sink`.
pub fn restore_one(
    source: &Arc<dyn Iopx>,
    sink: &Arc<dyn Iopx>,
    product_source: Product,
    product_sink: Product,
    store_source: &str,
    store_sink: &str,
    path: &str,
    uuid: Uuid,
    extent_size: usize,
) -> DmResult<()> {
    let src_loc = Location::new(product_source, store_source, path).with_uuid(uuid);
    let src_handle = source.open(&src_loc, OpenFlags::RDONLY)?;
    let dest_loc = Location::new(product_sink, store_sink, path);
    let dest_handle = sink.creat(&dest_loc, OpenFlags::WRONLY | OpenFlags::CREAT, 0o640, 0)?;

    let result = (|| -> DmResult<()> {
        let pool = plb_pool(extent_size);
        let mut buf = pool.acquire();
        let mut offset = 0u64;
        loop {
            let data = source.pread(&src_handle, offset, extent_size as u32)?;
            if data.is_empty() {
                break;
            }
            buf[..data.len()].copy_from_slice(&data);
            sink.pwrite(&dest_handle, offset, &buf[..data.len()])?;
            offset += data.len() as u64;
        }
        Ok(())
    })();

    let close_src = source.close(&src_handle);
    let close_dest = sink.close(&dest_handle);
    result?;
    close_src?;
    close_dest?;
    Ok(())
}

/// Posts one async read to the engine's fast pool.
pub fn read_async(
    engine: &crate::engine::Engine,
    tree: Arc<dyn Iopx>,
    handle: FileHandle,
    offset: u64,
    len: u32,
    callback: ReadCallback,
) {
    engine.post(true, move || {
        tree.pread_async(handle, offset, len, callback);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackupServiceAdapter, ClusteredFsAdapter};
    use crate::xattr::OPAR_XATTR_ARCHIVE_UUID as ARCHIVE_UUID_NAME;
    use std::io::Write;

    fn clustered(dir: &Path) -> Arc<dyn Iopx> {
        ClusteredFsAdapter::new(dir, false).unwrap() as Arc<dyn Iopx>
    }

    #[test]
    fn split_collect_file_batches_and_archives_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol1-openarchive-iopx.5");
        fs::write(&path, "/a\n/b\n/c\n/d\n/e").unwrap();
        let batches = split_collect_file(&path, 2).unwrap();
        assert_eq!(batches.len(), 2);
        assert!(!path.exists());
        assert!(dir.path().join("vol1-openarchive-iopx.5.save").exists());
        let first = fs::read_to_string(&batches[0]).unwrap();
        assert_eq!(first.lines().count(), 3);
    }

    #[test]
    fn backup_one_copies_content_and_marks_source() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let source = clustered(src_dir.path());
        let sink = clustered(dst_dir.path());

        let mut f = fs::File::create(src_dir.path().join("a.txt")).unwrap();
        f.write_all(b"hello world").unwrap();
        drop(f);

        backup_one(&source, &sink, Product::ClusteredFs, Product::ClusteredFs, "src", "dst", "/a.txt", 4096, false)
            .unwrap();

        let dest_contents = fs::read(dst_dir.path().join("a.txt")).unwrap();
        assert_eq!(dest_contents, b"hello world");

        let loc = Location::new(Product::ClusteredFs, "src", "/a.txt");
        let marked = source.getxattr(&loc, ARCHIVE_UUID_NAME).unwrap();
        assert_eq!(marked.len(), 16);
    }

    #[test]
    fn backup_one_caps_transfer_at_extent_size_when_extent_based() {
        let src_dir = tempfile::tempdir().unwrap();
        let dst_dir = tempfile::tempdir().unwrap();
        let source = clustered(src_dir.path());
        let sink = clustered(dst_dir.path());

        let payload = vec![0x7Bu8; 4096];
        let mut f = fs::File::create(src_dir.path().join("a.txt")).unwrap();
        f.write_all(&payload).unwrap();
        drop(f);

        backup_one(&source, &sink, Product::ClusteredFs, Product::ClusteredFs, "src", "dst", "/a.txt", 1024, true)
            .unwrap();

        let dest_contents = fs::read(dst_dir.path().join("a.txt")).unwrap();
        assert_eq!(dest_contents.len(), 1024);
        assert_eq!(dest_contents, payload[..1024]);
    }

    #[test]
    fn archive_one_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let tree = clustered(dir.path());
        let mut f = fs::File::create(dir.path().join("a.txt")).unwrap();
        f.write_all(b"12345678").unwrap();
        drop(f);

        archive_one(&tree, Product::ClusteredFs, "vol1", "/a.txt").unwrap();
        let meta = fs::metadata(dir.path().join("a.txt")).unwrap();
        assert_eq!(meta.len(), 0);

        // second pass must not error and must not re-truncate an already-zero file.
        archive_one(&tree, Product::ClusteredFs, "vol1", "/a.txt").unwrap();
    }

    #[test]
    fn restore_one_round_trips_through_backup_service() {
        let backup_dir = tempfile::tempdir().unwrap();
        let sink_dir = tempfile::tempdir().unwrap();

        let backup_args = "cc=1:cn=n:ph=p:pp=1:at=1:in=i:bs=b:sc=s:jt=full-backup:ns=1";
        let backup = BackupServiceAdapter::new(backup_args, backup_dir.path()).unwrap() as Arc<dyn Iopx>;
        let dest_loc = Location::new(Product::BackupService, "store", "/x.txt");
        let handle = backup.creat(&dest_loc, OpenFlags::WRONLY, 0o640, 4).unwrap();
        backup.pwrite(&handle, 0, b"data").unwrap();
        let uuid = handle.location().uuid;
        backup.close(&handle).unwrap();
        drop(backup);

        let restore_args = "cc=1:cn=n:ph=p:pp=1:at=1:in=i:bs=b:sc=s:jt=restore:ns=1";
        let restore_source = BackupServiceAdapter::new(restore_args, backup_dir.path()).unwrap() as Arc<dyn Iopx>;
        let sink = clustered(sink_dir.path());

        restore_one(
            &restore_source,
            &sink,
            Product::BackupService,
            Product::ClusteredFs,
            "store",
            "vol1",
            "/x.txt",
            uuid,
            4096,
        )
        .unwrap();

        let contents = fs::read(sink_dir.path().join("x.txt")).unwrap();
        assert_eq!(contents, b"data");
    }

    #[test]
    fn dm_stats_tracks_pending_and_done() {
        let stats = DmStats::new();
        stats.add_pending(2);
        stats.ack(0);
        assert!(!stats.is_complete());
        stats.ack(libc::EIO);
        assert!(stats.is_complete());
        assert_eq!(stats.last_error_code(), libc::EIO);
    }
}
