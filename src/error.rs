//! Error handling for data-management operations.
//!
//! Errors are reported as `(category, code)` pairs where `category` is the
//! OS-error namespace (`ErrorKind`) and `code` is the raw errno value. This
//! mirrors the POSIX-error-first design used throughout the translator
//! stack: every layer hands back an errno-shaped error rather than a
//! library-specific one, so adapters that only know `errno` (the clustered
//! filesystem handle library, the backup-service session library) can be
//! wrapped without lossy translation.

use std::fmt::{Debug, Display};

pub type DmResult<T> = Result<T, OsError>;

/// An OS-style error: an errno-shaped code plus a free-form message.
#[derive(Clone, PartialEq, Eq)]
pub struct OsError {
    code: i32,
    pub msg: String,
}

impl OsError {
    pub fn new<T, U>(code: T, msg: U) -> Self
    where
        T: Into<i32>,
        U: ToString,
    {
        Self {
            code: code.into(),
            msg: msg.to_string(),
        }
    }

    /// Builds an `OsError` from the current thread's `errno`.
    ///
    /// # Safety
    /// Must be called immediately after the failing libc call, before any
    /// other call that could clobber `errno`.
    pub unsafe fn last_os_error<U: ToString>(msg: U) -> Self {
        Self::new(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO), msg)
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from(self.code)
    }

    pub fn raw_error(&self) -> i32 {
        self.code
    }

    /// True for the retry-class codes the fd-cache and stream manager loop on
    /// (ENOMEM, ENOSR, EADDRINUSE, EALREADY): resource exhaustion a retry
    /// can plausibly clear.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            libc::ENOMEM | libc::ENOSR | libc::EADDRINUSE | libc::EALREADY
        )
    }
}

impl From<std::io::Error> for OsError {
    fn from(e: std::io::Error) -> Self {
        OsError::new(e.raw_os_error().unwrap_or(libc::EIO), e.to_string())
    }
}

impl Debug for OsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsError")
            .field("code", &self.code)
            .field("kind", &ErrorKind::from(self.code))
            .field("msg", &self.msg)
            .finish()
    }
}

impl Display for OsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = ErrorKind::from(self.code);
        match self.msg.as_str() {
            "" => write!(f, "{:?} (code {})", kind, self.code),
            _ => write!(f, "{:?} (code {}): {}", kind, self.code, self.msg),
        }
    }
}

/// The error-category taxonomy: invariant violation, resource exhaustion,
/// not-applicable, backend I/O, lookup miss, protocol.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ErrorKind {
    /// EPERM/EPIPE class: assertion failures, surfaced without retry.
    InvariantViolation,
    /// ENOMEM/ENOSR/EADDRINUSE/EALREADY: retried up to three times at the
    /// fd-cache entry point, surfaced otherwise.
    ResourceExhaustion,
    /// ENOSYS: adapter doesn't implement this op.
    NotApplicable,
    /// EIO/EFAULT/EBADFD: surfaced, file goes to the failed-files tracker.
    BackendIo,
    /// ENOENT/ENOKEY/ENXIO: expected control-flow signal for cache misses.
    LookupMiss,
    /// EILSEQ/ENOBUFS: restore callback metadata/data decoding failures.
    Protocol,
    Unknown(i32),
}

impl ErrorKind {
    pub fn to_error<T: ToString>(self, msg: T) -> OsError {
        OsError::new(i32::from(self), msg)
    }
}

impl From<i32> for ErrorKind {
    fn from(code: i32) -> Self {
        match code {
            libc::EPERM | libc::EPIPE => Self::InvariantViolation,
            libc::ENOMEM | libc::ENOSR | libc::EADDRINUSE | libc::EALREADY => {
                Self::ResourceExhaustion
            }
            libc::ENOSYS => Self::NotApplicable,
            libc::EIO | libc::EFAULT | libc::EBADFD => Self::BackendIo,
            libc::ENOENT | libc::ENOKEY | libc::ENXIO => Self::LookupMiss,
            libc::EILSEQ | libc::ENOBUFS => Self::Protocol,
            other => Self::Unknown(other),
        }
    }
}

impl From<ErrorKind> for i32 {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            // Representative code per category; exact code is preserved by
            // OsError::code for variants constructed via `new`/`From<i32>`.
            ErrorKind::InvariantViolation => libc::EPERM,
            ErrorKind::ResourceExhaustion => libc::ENOMEM,
            ErrorKind::NotApplicable => libc::ENOSYS,
            ErrorKind::BackendIo => libc::EIO,
            ErrorKind::LookupMiss => libc::ENOENT,
            ErrorKind::Protocol => libc::EILSEQ,
            ErrorKind::Unknown(code) => code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_exhaustion_codes_are_retryable() {
        for code in [libc::ENOMEM, libc::ENOSR, libc::EADDRINUSE, libc::EALREADY] {
            let err = OsError::new(code, "test");
            assert!(err.is_retryable(), "{:?} should be retryable", err);
            assert_eq!(err.kind(), ErrorKind::ResourceExhaustion);
        }
    }

    #[test]
    fn not_applicable_is_not_retryable() {
        let err = OsError::new(libc::ENOSYS, "unsupported");
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::NotApplicable);
    }

    #[test]
    fn display_includes_message() {
        let err = OsError::new(libc::EIO, "backend failure");
        assert!(format!("{}", err).contains("backend failure"));
    }
}
