//! Flag types shared by every layer of the translator stack.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    /// Flags passed to `open`/`creat`. Mirrors the POSIX open(2) flag space;
    /// only the subset the adapters and the fd-cache inspect is named.
    pub struct OpenFlags: i32 {
        const RDONLY = libc::O_RDONLY;
        const WRONLY = libc::O_WRONLY;
        const RDWR = libc::O_RDWR;
        const CREAT = libc::O_CREAT;
        const TRUNC = libc::O_TRUNC;
        #[cfg(target_os = "linux")]
        const NOATIME = libc::O_NOATIME;
        const _ = !0;
    }
}

impl OpenFlags {
    /// Write-intent opens bypass the fd-cache.
    pub fn is_write_intent(&self) -> bool {
        self.contains(OpenFlags::WRONLY) || self.contains(OpenFlags::RDWR)
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    /// Flags for `setxattr`/`fsetxattr`.
    pub struct XAttrFlags: i32 {
        const CREATE = libc::XATTR_CREATE;
        const REPLACE = libc::XATTR_REPLACE;
        const _ = !0;
    }
}

/// `lseek` whence values.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Whence {
    Set,
    Current,
    End,
}
