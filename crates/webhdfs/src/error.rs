//! Error type for WebHDFS requests.

use thiserror::Error;

use crate::models::RemoteException;

#[derive(Debug, Error)]
pub enum WebHdfsError {
    /// Transport-level failure (connect, TLS, timeout, broken stream).
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The name node rejected the operation with a serialized Java exception.
    #[error("remote exception {}: {}", .exception.exception, .exception.message)]
    Remote {
        status: u16,
        exception: RemoteException,
    },

    /// The server answered with a status we cannot interpret.
    #[error("unexpected http status {status} for {op}")]
    UnexpectedStatus { op: &'static str, status: u16 },

    /// A redirect-based operation did not return a `Location` header.
    #[error("missing redirect location for {0}")]
    MissingRedirect(&'static str),

    /// A boolean-result operation (rename, delete) reported `false`.
    #[error("{0} was not performed by the name node")]
    NotPerformed(&'static str),

    /// TLS material could not be loaded.
    #[error("tls configuration error: {0}")]
    Tls(String),

    /// The upload stream was torn down before `close()`.
    #[error("upload stream closed prematurely")]
    UploadAborted,
}

impl WebHdfsError {
    /// Name of the Java exception class, if this is a remote error.
    pub fn remote_exception(&self) -> Option<&str> {
        match self {
            Self::Remote { exception, .. } => Some(exception.exception.as_str()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.remote_exception(), Some("FileNotFoundException"))
            || matches!(self, Self::Remote { status: 404, .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.remote_exception(), Some("FileAlreadyExistsException"))
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self.remote_exception(), Some("AccessControlException"))
            || matches!(self, Self::Remote { status: 403, .. })
    }
}
