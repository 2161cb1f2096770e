//! Error types for composeapp

use composeapp_oci::OciError;
use thiserror::Error;

/// Result type alias using composeapp Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], used by the update runner to
/// decide the post-operation state and by the CLI to pick an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Integrity,
    Transport,
    ResourceExhausted,
    StateConflict,
    InstallCheck,
    Cancelled,
    Internal,
}

/// Errors that can occur in composeapp operations
#[derive(Error, Debug)]
pub enum Error {
    /// Bad reference, missing digest, out-of-range setting
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Blob, app or update not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Content does not match what its descriptor promises
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Registry or daemon communication failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Not enough storage left under the usage watermark
    #[error("insufficient storage: {0}")]
    ResourceExhausted(String),

    /// Operation not allowed in the current state
    #[error("{0}")]
    StateConflict(String),

    /// Apps are not fully installed
    #[error("install check failed: {0}")]
    InstallCheck(String),

    /// Operation was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Invariant violation
    #[error("internal error: {0}")]
    Internal(String),

    /// OCI layer errors
    #[error(transparent)]
    Oci(#[from] OciError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Update store errors
    #[error("update store error: {0}")]
    Store(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Integrity(_) => ErrorKind::Integrity,
            Error::Transport(_) => ErrorKind::Transport,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::StateConflict(_) => ErrorKind::StateConflict,
            Error::InstallCheck(_) => ErrorKind::InstallCheck,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Internal(_) => ErrorKind::Internal,
            Error::Oci(e) => match e {
                OciError::InvalidReference(_) | OciError::DigestRequired(_) => {
                    ErrorKind::InvalidInput
                }
                OciError::NotFound(_) => ErrorKind::NotFound,
                OciError::Unauthorized(_) | OciError::Registry(_) | OciError::Http(_) => {
                    ErrorKind::Transport
                }
                OciError::AlreadyExists(_) => ErrorKind::StateConflict,
                OciError::Io(_) => ErrorKind::Internal,
                OciError::Json(_) => ErrorKind::Integrity,
                other if other.is_integrity() => ErrorKind::Integrity,
                _ => ErrorKind::Internal,
            },
            Error::Io(_) | Error::Store(_) => ErrorKind::Internal,
            Error::Json(_) | Error::Yaml(_) => ErrorKind::Integrity,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<redb::Error> for Error {
    fn from(e: redb::Error) -> Self {
        Error::Store(e.to_string())
    }
}

macro_rules! redb_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(e: $ty) -> Self {
                    Error::Store(e.to_string())
                }
            }
        )*
    };
}

redb_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oci_errors_are_classified() {
        let e: Error = OciError::DigestMismatch {
            expected: "a".into(),
            calculated: "b".into(),
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::Integrity);
        let e: Error = OciError::NotFound("x".into()).into();
        assert!(e.is_not_found());
        let e: Error = OciError::Unauthorized("x".into()).into();
        assert_eq!(e.kind(), ErrorKind::Transport);
        let e: Error = OciError::DigestRequired("x".into()).into();
        assert_eq!(e.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn cancelled_is_distinct() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Internal("x".into()).is_cancelled());
    }
}
