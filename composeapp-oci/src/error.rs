/// Errors produced by the OCI layer: providers, readers, the registry client
/// and the content store.
#[derive(Debug, thiserror::Error)]
pub enum OciError {
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    #[error("digest is required to read {0}")]
    DigestRequired(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("digest mismatch: expected {expected}, calculated {calculated}")]
    DigestMismatch { expected: String, calculated: String },

    #[error("size mismatch: expected {expected} bytes, got {got}")]
    SizeMismatch { expected: u64, got: u64 },

    #[error("blob exceeds read limit of {limit} bytes")]
    SizeLimitExceeded { limit: u64 },

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("blob already exists: {0}")]
    AlreadyExists(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OciError {
    /// Recover a typed error that travelled through an `AsyncRead` as an
    /// `io::Error`.
    pub fn from_io(err: std::io::Error) -> Self {
        if !err.get_ref().is_some_and(|e| e.is::<OciError>()) {
            return OciError::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<OciError>()) {
            Some(Ok(oci)) => *oci,
            _ => OciError::Registry("unrecognised reader error".to_string()),
        }
    }

    /// Wrap this error so it can be returned from `AsyncRead::poll_read`.
    pub fn into_io(self) -> std::io::Error {
        match self {
            OciError::Io(e) => e,
            other => std::io::Error::other(other),
        }
    }

    /// True for failures that prove the bytes on hand are not the expected
    /// blob.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            OciError::DigestMismatch { .. }
                | OciError::SizeMismatch { .. }
                | OciError::SizeLimitExceeded { .. }
                | OciError::UnsupportedMediaType(_)
                | OciError::Manifest(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OciError>;
