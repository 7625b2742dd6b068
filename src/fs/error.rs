//! The error taxonomy shared by every layer between the kernel and the name
//! node.
//!
//! A single adapter translates host-OS and remote errors into this enum; the
//! FUSE boundary turns it into an errno via `From<FsError> for i32`, and the
//! fault-tolerant client consults [`FsError::is_retriable`] to decide whether
//! an operation is worth another attempt.

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("operation not permitted")]
    NotPermitted,

    #[error("access denied")]
    AccessDenied,

    #[error("already exists")]
    AlreadyExists,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("no space left on staging device")]
    NoSpace,

    #[error("read-only file system")]
    ReadOnly,

    #[error("operation not supported")]
    NotSupported,

    #[error("bad file handle")]
    BadHandle,

    #[error("directory not empty")]
    NotEmpty,

    #[error("disk quota exceeded")]
    QuotaExceeded,

    #[error("link has been severed")]
    LinkSevered,

    /// End of stream. Interpreted by read paths; never surfaced to the kernel
    /// when a read returned at least one byte.
    #[error("end of file")]
    Eof,

    /// Anything unrecognised. The only retriable kind.
    #[error("i/o error: {0}")]
    Io(String),
}

impl FsError {
    /// Whether the fault-tolerant client may retry after this error.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::NotPermitted => libc::EPERM,
            Self::AccessDenied => libc::EACCES,
            Self::AlreadyExists => libc::EEXIST,
            Self::InvalidArgument => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::ReadOnly => libc::EROFS,
            Self::NotSupported => libc::ENOTSUP,
            Self::BadHandle => libc::EBADF,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::QuotaExceeded => libc::EDQUOT,
            Self::LinkSevered => libc::ENOLINK,
            // EOF reaching the kernel means a read path failed to interpret
            // it; report a plain I/O failure.
            Self::Eof | Self::Io(_) => libc::EIO,
        }
    }
}

impl From<FsError> for i32 {
    fn from(e: FsError) -> Self {
        e.errno()
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::PermissionDenied => Self::NotPermitted,
            ErrorKind::AlreadyExists => Self::AlreadyExists,
            ErrorKind::InvalidInput => Self::InvalidArgument,
            ErrorKind::UnexpectedEof => Self::Eof,
            ErrorKind::StorageFull => Self::NoSpace,
            ErrorKind::ReadOnlyFilesystem => Self::ReadOnly,
            ErrorKind::DirectoryNotEmpty => Self::NotEmpty,
            _ => {
                warn!(error = %e, "unrecognized os error, mapping to EIO");
                Self::Io(e.to_string())
            }
        }
    }
}

impl From<webhdfs::WebHdfsError> for FsError {
    fn from(e: webhdfs::WebHdfsError) -> Self {
        use webhdfs::WebHdfsError;
        match &e {
            WebHdfsError::Remote { exception, .. } => {
                match exception.exception.as_str() {
                    "FileNotFoundException" | "PathNotFoundException" => Self::NotFound,
                    "FileAlreadyExistsException" => Self::AlreadyExists,
                    "AccessControlException" | "SecurityException" => Self::AccessDenied,
                    "PathIsNotEmptyDirectoryException" => Self::NotEmpty,
                    "DSQuotaExceededException"
                    | "NSQuotaExceededException"
                    | "QuotaExceededException" => Self::QuotaExceeded,
                    "IllegalArgumentException" | "InvalidPathException" => Self::InvalidArgument,
                    "SafeModeException" | "RetriableException" | "StandbyException" => {
                        // Name-node transitional states clear up on their own.
                        Self::Io(e.to_string())
                    }
                    other => {
                        warn!(exception = other, "unrecognized remote exception, mapping to EIO");
                        Self::Io(e.to_string())
                    }
                }
            }
            // A false boolean result from DELETE means the path was missing;
            // from MKDIRS it is an unspecified refusal.
            WebHdfsError::NotPerformed(op) if *op == "DELETE" => Self::NotFound,
            WebHdfsError::NotPerformed(_) => Self::Io(e.to_string()),
            WebHdfsError::Tls(_) => Self::NotPermitted,
            _ => Self::Io(e.to_string()),
        }
    }
}
