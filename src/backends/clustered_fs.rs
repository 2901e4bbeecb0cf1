//! Clustered-filesystem adapter: the primary-store leaf translator.
//!
//! The real clustered filesystem is reached through a vendor handle library
//! (out of scope); this adapter instead talks to a real POSIX directory
//! tree rooted at the volume's mount point, direct-libc style: syscalls
//! first, `OsError::last_os_error` on failure.

use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{info, warn};

use crate::error::{DmResult, OsError};
use crate::filestat::{FileKind, FileStat};
use crate::flags::{OpenFlags, Whence, XAttrFlags};
use crate::handle::{FileHandle, SideTableEntry};
use crate::iopx::{Iopx, ScanMode};
use crate::location::{Location, Uuid};

const SHARD_SIZE: u64 = 4 * 1024 * 1024;
const CONNECT_RETRIES: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_secs(1);

pub struct ClusteredFsAdapter {
    root: PathBuf,
    sharding_enabled: bool,
}

impl ClusteredFsAdapter {
    /// Binds to a volume rooted at `root`, retrying session setup up to
    /// three times with a one-second back-off. Here "session setup" is just
    /// confirming the root directory is reachable, since the real
    /// control-socket handshake is vendor-specific and out of scope.
    pub fn new(root: impl Into<PathBuf>, sharding_enabled: bool) -> DmResult<std::sync::Arc<Self>> {
        let root = root.into();
        let mut last_err = None;
        for attempt in 0..CONNECT_RETRIES {
            match fs::metadata(&root) {
                Ok(meta) if meta.is_dir() => {
                    info!("clustered_fs: bound to volume at {:?}", root);
                    return Ok(std::sync::Arc::new(Self { root, sharding_enabled }));
                }
                Ok(_) => return Err(OsError::new(libc::ENOTDIR, format!("{:?} is not a directory", root))),
                Err(e) => {
                    last_err = Some(OsError::from(e));
                    if attempt + 1 < CONNECT_RETRIES {
                        thread::sleep(CONNECT_BACKOFF);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| OsError::new(libc::EIO, "clustered_fs: volume bind failed")))
    }

    fn full_path(&self, loc: &Location) -> PathBuf {
        self.root.join(loc.path.trim_start_matches('/'))
    }

    fn cpath(path: &Path) -> DmResult<CString> {
        CString::new(path.as_os_str().as_bytes())
            .map_err(|e| OsError::new(libc::EINVAL, format!("path contains NUL: {e}")))
    }

    fn native_fd(handle: &FileHandle) -> DmResult<i32> {
        handle
            .side_table("backend")
            .ok_or_else(|| OsError::new(libc::EBADF, "handle has no backend fd"))?
            .as_native_fd()
    }

    fn open_native(path: &Path, flags: OpenFlags, mode: u32) -> DmResult<i32> {
        let c_path = Self::cpath(path)?;
        let mut native_flags = 0;
        if flags.contains(OpenFlags::WRONLY) {
            native_flags |= libc::O_WRONLY;
        } else if flags.contains(OpenFlags::RDWR) {
            native_flags |= libc::O_RDWR;
        } else {
            native_flags |= libc::O_RDONLY;
        }
        if flags.contains(OpenFlags::CREAT) {
            native_flags |= libc::O_CREAT;
        }
        if flags.contains(OpenFlags::TRUNC) {
            native_flags |= libc::O_TRUNC;
        }
        #[cfg(target_os = "linux")]
        if flags.contains(OpenFlags::NOATIME) {
            native_flags |= libc::O_NOATIME;
        }
        let fd = unsafe { libc::open(c_path.as_ptr(), native_flags, mode as libc::mode_t) };
        if fd < 0 {
            return Err(unsafe { OsError::last_os_error(format!("open({:?})", path)) });
        }
        Ok(fd)
    }

    fn stat_path(path: &Path) -> DmResult<FileStat> {
        let c_path = Self::cpath(path)?;
        let mut buf: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::stat(c_path.as_ptr(), &mut buf) };
        if rc < 0 {
            return Err(unsafe { OsError::last_os_error(format!("stat({:?})", path)) });
        }
        Ok(stat_to_filestat(buf))
    }
}

fn stat_to_filestat(buf: libc::stat) -> FileStat {
    let kind = match buf.st_mode & libc::S_IFMT {
        libc::S_IFREG => FileKind::RegularFile,
        libc::S_IFDIR => FileKind::Directory,
        libc::S_IFLNK => FileKind::Symlink,
        _ => FileKind::Other,
    };
    FileStat {
        kind,
        size: buf.st_size as u64,
        blocks: buf.st_blocks as u64,
        block_size: buf.st_blksize as u32,
        mode: buf.st_mode,
        mtime: UNIX_EPOCH + Duration::new(buf.st_mtime as u64, 0),
    }
}

fn uuid_from_dev_ino(dev: u64, ino: u64) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&dev.to_le_bytes());
    bytes[8..].copy_from_slice(&ino.to_le_bytes());
    Uuid(bytes)
}

impl Iopx for ClusteredFsAdapter {
    fn name(&self) -> &'static str {
        "clustered-fs"
    }

    fn child(&self) -> Option<&std::sync::Arc<dyn Iopx>> {
        None
    }

    fn open(&self, loc: &Location, flags: OpenFlags) -> DmResult<FileHandle> {
        let path = self.full_path(loc);
        let fd = Self::open_native(&path, flags, 0)?;
        let handle = FileHandle::new(loc.clone());
        handle.install_side_table("backend", SideTableEntry::NativeFd(fd));
        Ok(handle)
    }

    fn creat(&self, loc: &Location, flags: OpenFlags, mode: u32, len_hint: u64) -> DmResult<FileHandle> {
        let path = self.full_path(loc);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(OsError::from)?;
        }
        let fd = Self::open_native(&path, flags | OpenFlags::CREAT, mode)?;
        let handle = FileHandle::new(loc.clone());
        handle.install_side_table("backend", SideTableEntry::NativeFd(fd));
        handle.set_size_hint(len_hint);
        Ok(handle)
    }

    fn close_self(&self, handle: &FileHandle) -> DmResult<()> {
        let fd = match Self::native_fd(handle) {
            Ok(fd) => fd,
            Err(_) => return Ok(()),
        };
        if unsafe { libc::close(fd) } < 0 {
            return Err(unsafe { OsError::last_os_error("close") });
        }
        Ok(())
    }

    fn pread(&self, handle: &FileHandle, offset: u64, len: u32) -> DmResult<Vec<u8>> {
        let fd = Self::native_fd(handle)?;
        let mut buf = vec![0u8; len as usize];
        let n = unsafe { libc::pread(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), offset as i64) };
        if n < 0 {
            return Err(unsafe { OsError::last_os_error("pread") });
        }
        buf.truncate(n as usize);
        Ok(buf)
    }

    fn pwrite(&self, handle: &FileHandle, offset: u64, data: &[u8]) -> DmResult<u32> {
        let fd = Self::native_fd(handle)?;
        let n = unsafe { libc::pwrite(fd, data.as_ptr() as *const libc::c_void, data.len(), offset as i64) };
        if n < 0 {
            return Err(unsafe { OsError::last_os_error("pwrite") });
        }
        Ok(n as u32)
    }

    fn fstat(&self, handle: &FileHandle) -> DmResult<FileStat> {
        let fd = Self::native_fd(handle)?;
        let mut buf: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut buf) } < 0 {
            return Err(unsafe { OsError::last_os_error("fstat") });
        }
        Ok(stat_to_filestat(buf))
    }

    fn stat(&self, loc: &Location) -> DmResult<FileStat> {
        Self::stat_path(&self.full_path(loc))
    }

    fn ftruncate(&self, handle: &FileHandle, len: u64) -> DmResult<()> {
        let fd = Self::native_fd(handle)?;
        if unsafe { libc::ftruncate(fd, len as i64) } < 0 {
            return Err(unsafe { OsError::last_os_error("ftruncate") });
        }
        Ok(())
    }

    fn truncate(&self, loc: &Location, len: u64) -> DmResult<()> {
        let c_path = Self::cpath(&self.full_path(loc))?;
        if unsafe { libc::truncate(c_path.as_ptr(), len as i64) } < 0 {
            return Err(unsafe { OsError::last_os_error("truncate") });
        }
        Ok(())
    }

    fn lseek(&self, handle: &FileHandle, offset: i64, whence: Whence) -> DmResult<i64> {
        let fd = Self::native_fd(handle)?;
        let native_whence = match whence {
            Whence::Set => libc::SEEK_SET,
            Whence::Current => libc::SEEK_CUR,
            Whence::End => libc::SEEK_END,
        };
        let pos = unsafe { libc::lseek(fd, offset, native_whence) };
        if pos < 0 {
            return Err(unsafe { OsError::last_os_error("lseek") });
        }
        Ok(pos)
    }

    fn fsetxattr(&self, handle: &FileHandle, name: &str, value: &[u8], flags: XAttrFlags) -> DmResult<()> {
        let fd = Self::native_fd(handle)?;
        let c_name = Self::cpath(Path::new(name))?;
        let native_flags = if flags.contains(XAttrFlags::REPLACE) { libc::XATTR_REPLACE } else { 0 };
        #[cfg(target_os = "linux")]
        let rc = unsafe {
            libc::fsetxattr(fd, c_name.as_ptr(), value.as_ptr() as *const libc::c_void, value.len(), native_flags)
        };
        #[cfg(not(target_os = "linux"))]
        let rc = {
            let _ = (fd, native_flags);
            return Err(OsError::new(libc::ENOSYS, "xattr unsupported on this platform"));
        };
        if rc < 0 {
            return Err(unsafe { OsError::last_os_error("fsetxattr") });
        }
        Ok(())
    }

    fn setxattr(&self, loc: &Location, name: &str, value: &[u8], flags: XAttrFlags) -> DmResult<()> {
        let c_path = Self::cpath(&self.full_path(loc))?;
        let c_name = Self::cpath(Path::new(name))?;
        let native_flags = if flags.contains(XAttrFlags::REPLACE) { libc::XATTR_REPLACE } else { 0 };
        #[cfg(target_os = "linux")]
        let rc = unsafe {
            libc::setxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                native_flags,
            )
        };
        #[cfg(not(target_os = "linux"))]
        let rc = {
            let _ = native_flags;
            return Err(OsError::new(libc::ENOSYS, "xattr unsupported on this platform"));
        };
        if rc < 0 {
            return Err(unsafe { OsError::last_os_error("setxattr") });
        }
        Ok(())
    }

    fn fgetxattr(&self, handle: &FileHandle, name: &str) -> DmResult<Vec<u8>> {
        let fd = Self::native_fd(handle)?;
        let c_name = Self::cpath(Path::new(name))?;
        #[cfg(target_os = "linux")]
        {
            let needed = unsafe { libc::fgetxattr(fd, c_name.as_ptr(), std::ptr::null_mut(), 0) };
            if needed < 0 {
                return Err(unsafe { OsError::last_os_error("fgetxattr(size)") });
            }
            let mut buf = vec![0u8; needed as usize];
            let n = unsafe { libc::fgetxattr(fd, c_name.as_ptr(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                return Err(unsafe { OsError::last_os_error("fgetxattr") });
            }
            buf.truncate(n as usize);
            Ok(buf)
        }
        #[cfg(not(target_os = "linux"))]
        Err(OsError::new(libc::ENOSYS, "xattr unsupported on this platform"))
    }

    fn getxattr(&self, loc: &Location, name: &str) -> DmResult<Vec<u8>> {
        let c_path = Self::cpath(&self.full_path(loc))?;
        let c_name = Self::cpath(Path::new(name))?;
        #[cfg(target_os = "linux")]
        {
            let needed = unsafe { libc::getxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0) };
            if needed < 0 {
                return Err(unsafe { OsError::last_os_error("getxattr(size)") });
            }
            let mut buf = vec![0u8; needed as usize];
            let n =
                unsafe { libc::getxattr(c_path.as_ptr(), c_name.as_ptr(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                return Err(unsafe { OsError::last_os_error("getxattr") });
            }
            buf.truncate(n as usize);
            Ok(buf)
        }
        #[cfg(not(target_os = "linux"))]
        Err(OsError::new(libc::ENOSYS, "xattr unsupported on this platform"))
    }

    fn fremovexattr(&self, handle: &FileHandle, name: &str) -> DmResult<()> {
        let fd = Self::native_fd(handle)?;
        let c_name = Self::cpath(Path::new(name))?;
        #[cfg(target_os = "linux")]
        let rc = unsafe { libc::fremovexattr(fd, c_name.as_ptr()) };
        #[cfg(not(target_os = "linux"))]
        let rc = return Err(OsError::new(libc::ENOSYS, "xattr unsupported on this platform"));
        if rc < 0 {
            return Err(unsafe { OsError::last_os_error("fremovexattr") });
        }
        Ok(())
    }

    fn removexattr(&self, loc: &Location, name: &str) -> DmResult<()> {
        let c_path = Self::cpath(&self.full_path(loc))?;
        let c_name = Self::cpath(Path::new(name))?;
        #[cfg(target_os = "linux")]
        let rc = unsafe { libc::removexattr(c_path.as_ptr(), c_name.as_ptr()) };
        #[cfg(not(target_os = "linux"))]
        let rc = return Err(OsError::new(libc::ENOSYS, "xattr unsupported on this platform"));
        if rc < 0 {
            return Err(unsafe { OsError::last_os_error("removexattr") });
        }
        Ok(())
    }

    fn getuuid(&self, loc: &Location) -> DmResult<Uuid> {
        let meta = fs::symlink_metadata(self.full_path(loc)).map_err(OsError::from)?;
        Ok(uuid_from_dev_ino(meta.dev(), meta.ino()))
    }

    fn resolve(&self, loc: &Location) -> DmResult<Vec<Location>> {
        if !self.sharding_enabled {
            return Ok(vec![loc.clone()]);
        }
        let size = Self::stat_path(&self.full_path(loc))?.size;
        if size == 0 {
            return Ok(vec![loc.clone()]);
        }
        let fragments = (size + SHARD_SIZE - 1) / SHARD_SIZE;
        let mut out = Vec::with_capacity(fragments as usize);
        for k in 1..=fragments {
            let frag_path = format!(".shard/{}.{}", loc.uuid.to_hex_string(), k);
            let frag_loc = Location::new(loc.product, loc.store.clone(), frag_path);
            let uuid_k = self.getuuid(&frag_loc)?;
            out.push(frag_loc.with_uuid(uuid_k));
        }
        Ok(out)
    }

    fn gethosts(&self) -> DmResult<Vec<String>> {
        let info_path = self.root.join(".hosts");
        match fs::read_to_string(&info_path) {
            Ok(contents) => {
                let mut hosts: Vec<String> =
                    contents.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect();
                hosts.sort();
                hosts.dedup();
                Ok(hosts)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec!["localhost".to_string()]),
            Err(e) => Err(OsError::from(e)),
        }
    }

    fn scan(&self, loc: &Location, mode: ScanMode) -> DmResult<String> {
        let lock_path = self.root.join(format!("{}.lock.openarchive", loc.store));
        let _lock = ScanLock::acquire(&lock_path)?;

        let marker_path = self.root.join(format!("{}.last_scan", loc.store));
        let since = match mode {
            ScanMode::Full => None,
            ScanMode::Incremental => fs::read_to_string(&marker_path)
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(|secs| UNIX_EPOCH + Duration::from_secs(secs)),
        };

        let mut paths = Vec::new();
        collect_changed(&self.root, &self.root, since, &mut paths)?;
        paths.sort();

        let collect_name = format!("{}-openarchive-iopx.{}", loc.store, paths.len());
        let collect_path = self.root.join(&collect_name);
        fs::write(&collect_path, paths.join("\n")).map_err(OsError::from)?;

        let now_secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        fs::write(&marker_path, now_secs.to_string()).map_err(OsError::from)?;

        Ok(collect_path.to_string_lossy().into_owned())
    }

    fn mkdir(&self, loc: &Location, mode: u32) -> DmResult<()> {
        let path = self.full_path(loc);
        let c_path = Self::cpath(&path)?;
        if unsafe { libc::mkdir(c_path.as_ptr(), mode as libc::mode_t) } < 0 {
            return Err(unsafe { OsError::last_os_error("mkdir") });
        }
        Ok(())
    }
}

/// Cross-process lock via exclusive-create of the lock file; release always
/// attempts unlink even if the lock was never fully acquired.
struct ScanLock {
    path: PathBuf,
}

impl ScanLock {
    fn acquire(path: &Path) -> DmResult<Self> {
        fs::OpenOptions::new().create_new(true).write(true).open(path).map_err(OsError::from)?;
        Ok(Self { path: path.to_path_buf() })
    }
}

impl Drop for ScanLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("scan lock {:?} failed to release: {e}", self.path);
        }
    }
}

fn collect_changed(
    root: &Path,
    dir: &Path,
    since: Option<SystemTime>,
    out: &mut Vec<String>,
) -> DmResult<()> {
    for entry in fs::read_dir(dir).map_err(OsError::from)? {
        let entry = entry.map_err(OsError::from)?;
        let path = entry.path();
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        if name.starts_with('.') || name.ends_with(".lock.openarchive") || name.contains("-openarchive-iopx.") {
            continue;
        }
        let meta = entry.metadata().map_err(OsError::from)?;
        if meta.is_dir() {
            collect_changed(root, &path, since, out)?;
            continue;
        }
        if !meta.is_file() {
            continue;
        }
        let changed = match since {
            None => true,
            Some(cutoff) => meta.modified().map(|m| m >= cutoff).unwrap_or(true),
        };
        if changed {
            if let Ok(rel) = path.strip_prefix(root) {
                out.push(format!("/{}", rel.to_string_lossy()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Product;
    use std::io::Write;

    fn adapter() -> (tempfile::TempDir, std::sync::Arc<ClusteredFsAdapter>) {
        let dir = tempfile::tempdir().unwrap();
        let adapter = ClusteredFsAdapter::new(dir.path(), false).unwrap();
        (dir, adapter)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, adapter) = adapter();
        let loc = Location::new(Product::ClusteredFs, "vol1", "/a.txt");
        let handle = adapter.creat(&loc, OpenFlags::WRONLY, 0o640, 0).unwrap();
        adapter.pwrite(&handle, 0, b"hello world").unwrap();
        adapter.close_self(&handle).unwrap();

        let handle = adapter.open(&loc, OpenFlags::RDONLY).unwrap();
        let data = adapter.pread(&handle, 0, 11).unwrap();
        assert_eq!(&data, b"hello world");
    }

    #[test]
    fn getuuid_is_stable_for_same_path() {
        let (_dir, adapter) = adapter();
        let loc = Location::new(Product::ClusteredFs, "vol1", "/a.txt");
        let handle = adapter.creat(&loc, OpenFlags::WRONLY, 0o640, 0).unwrap();
        adapter.close_self(&handle).unwrap();
        let u1 = adapter.getuuid(&loc).unwrap();
        let u2 = adapter.getuuid(&loc).unwrap();
        assert_eq!(u1, u2);
    }

    #[test]
    fn resolve_without_sharding_returns_input_unchanged() {
        let (_dir, adapter) = adapter();
        let loc = Location::new(Product::ClusteredFs, "vol1", "/a.txt").with_uuid(Uuid([7; 16]));
        let resolved = adapter.resolve(&loc).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].uuid, loc.uuid);
    }

    #[test]
    fn scan_full_lists_existing_files_and_releases_lock() {
        let (dir, adapter) = adapter();
        let mut f = fs::File::create(dir.path().join("x")).unwrap();
        f.write_all(b"data").unwrap();
        let loc = Location::new(Product::ClusteredFs, "vol1", "/");
        let collect_path = adapter.scan(&loc, ScanMode::Full).unwrap();
        let contents = fs::read_to_string(&collect_path).unwrap();
        assert!(contents.contains("/x"));
        assert!(!dir.path().join("vol1.lock.openarchive").exists());
    }
}
