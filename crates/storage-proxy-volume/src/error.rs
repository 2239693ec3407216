//! Volume error types.

use std::io;

use storage_proxy_types::Capability;
use thiserror::Error;

/// Volume error type.
///
/// Every failure of a volume operation maps to one of these kinds. The
/// transport layer is expected to translate them into wire errors.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// Resolved target lies outside the vfolder (security violation).
    #[error("path escapes vfolder: {0}")]
    PathEscape(String),

    /// Vfolder, path or upload session not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Create/clone/mkdir target already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Operation needs a capability the backend does not advertise.
    #[error("capability not supported: {0}")]
    CapabilityUnsupported(Capability),

    /// Write would exceed the vfolder quota.
    #[error("quota exceeded: {attempted} bytes over a limit of {limit} bytes")]
    QuotaExceeded { limit: u64, attempted: u64 },

    /// Upload payload exceeded the configured maximum upload size.
    #[error("payload too large: limit is {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    /// Request is well-formed but not applicable (e.g. reading a directory).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No volume registered under this name.
    #[error("unknown volume: {0}")]
    UnknownVolume(String),

    /// No backend implementation with this name.
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// Underlying storage failure.
    #[error("backend I/O error: {0}")]
    BackendIo(#[source] io::Error),
}

impl VolumeError {
    /// Create a PathEscape error.
    pub fn path_escape(path: impl Into<String>) -> Self {
        Self::PathEscape(path.into())
    }

    /// Create a NotFound error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists(what.into())
    }

    /// Create an InvalidArgument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a BackendIo error from a message.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::BackendIo(io::Error::other(msg.into()))
    }

    /// Whether a caller may reasonably retry.
    ///
    /// Only opaque storage failures qualify; the core has no information
    /// about transience, so the decision stays with the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendIo(_))
    }

    /// Map an I/O error, attaching the path it concerned.
    pub fn from_io(err: io::Error, path: &std::path::Path) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.display().to_string()),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.display().to_string()),
            _ => Self::BackendIo(err),
        }
    }
}

impl From<io::Error> for VolumeError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(err.to_string()),
            _ => Self::BackendIo(err),
        }
    }
}

impl From<tokio::task::JoinError> for VolumeError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::BackendIo(io::Error::other(format!("blocking task failed: {err}")))
    }
}

/// Convert VolumeError to std::io::Error for transport compatibility.
impl From<VolumeError> for io::Error {
    fn from(e: VolumeError) -> Self {
        match e {
            VolumeError::PathEscape(msg) => io::Error::new(io::ErrorKind::PermissionDenied, msg),
            VolumeError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            VolumeError::AlreadyExists(msg) => io::Error::new(io::ErrorKind::AlreadyExists, msg),
            VolumeError::CapabilityUnsupported(cap) => io::Error::new(
                io::ErrorKind::Unsupported,
                format!("capability not supported: {cap}"),
            ),
            e @ VolumeError::QuotaExceeded { .. } => {
                io::Error::new(io::ErrorKind::QuotaExceeded, e.to_string())
            }
            e @ VolumeError::PayloadTooLarge { .. } => {
                io::Error::new(io::ErrorKind::FileTooLarge, e.to_string())
            }
            VolumeError::InvalidArgument(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            VolumeError::UnknownVolume(name) => io::Error::new(
                io::ErrorKind::NotFound,
                format!("unknown volume: {name}"),
            ),
            VolumeError::UnknownBackend(name) => io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unknown backend: {name}"),
            ),
            VolumeError::BackendIo(e) => e,
        }
    }
}

/// Volume result type.
pub type VolumeResult<T> = Result<T, VolumeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_io_kind_mapping() {
        let err: VolumeError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, VolumeError::NotFound(_)));

        let err: VolumeError = io::Error::new(io::ErrorKind::AlreadyExists, "dup").into();
        assert!(matches!(err, VolumeError::AlreadyExists(_)));

        let err: VolumeError = io::Error::new(io::ErrorKind::PermissionDenied, "eacces").into();
        assert!(matches!(err, VolumeError::BackendIo(_)));
    }

    #[test]
    fn test_from_io_keeps_path() {
        let err = VolumeError::from_io(
            io::Error::new(io::ErrorKind::NotFound, "gone"),
            Path::new("/vol/ab/cd/rest/file.txt"),
        );
        match err {
            VolumeError::NotFound(p) => assert_eq!(p, "/vol/ab/cd/rest/file.txt"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_only_backend_io_is_retryable() {
        assert!(VolumeError::backend("disk on fire").is_retryable());
        assert!(!VolumeError::path_escape("../x").is_retryable());
        assert!(!VolumeError::CapabilityUnsupported(Capability::Quota).is_retryable());
    }

    #[test]
    fn test_into_io_error() {
        let io_err: io::Error = VolumeError::path_escape("../../etc/passwd").into();
        assert_eq!(io_err.kind(), io::ErrorKind::PermissionDenied);

        let io_err: io::Error = VolumeError::CapabilityUnsupported(Capability::Quota).into();
        assert_eq!(io_err.kind(), io::ErrorKind::Unsupported);
        assert!(io_err.to_string().contains("quota"));
    }
}
