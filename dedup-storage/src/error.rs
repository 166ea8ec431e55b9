use std::io;

/// Errors raised by the metadata store backends.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// The backing key-value engine reported a failure
    #[error("metadata backend error: {0}")]
    Backend(String),
    /// A record could not be serialized
    #[error("failed to encode {what}: {reason}")]
    Encode { what: &'static str, reason: String },
    /// A stored record could not be deserialized
    #[error("failed to decode {what}: {reason}")]
    Decode { what: &'static str, reason: String },
    /// A key in an index tree does not have the expected layout
    #[error("malformed key in tree {0}")]
    MalformedKey(&'static str),
}

impl From<fjall::Error> for MetaError {
    fn from(err: fjall::Error) -> Self {
        MetaError::Backend(err.to_string())
    }
}

/// Errors surfaced by the deduplicating store.
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    /// Digest or file is absent
    #[error("not found: {0}")]
    NotFound(String),
    /// A release without a matching acquire, or a reference count that cannot
    /// be represented. Always a bug in a caller.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// Transient storage failure, retryable at the caller's discretion
    #[error("storage I/O error: {0}")]
    StorageIo(#[from] io::Error),
    /// Input rejected because it is larger than the configured upload limit
    #[error("upload of {actual} bytes exceeds the limit of {limit} bytes")]
    SizeLimitExceeded { limit: u64, actual: u64 },
    /// A concurrent operation removed the target while this one was running
    #[error("conflict: {0}")]
    Conflict(String),
    /// Malformed identifiers, empty names and similar caller errors
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Meta(#[from] MetaError),
}

impl DedupError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DedupError::StorageIo(_))
    }

    /// Collapses [`DedupError::Conflict`] into [`DedupError::NotFound`], the form
    /// callers see when a delete raced their read.
    pub fn conflict_as_not_found(self) -> Self {
        match self {
            DedupError::Conflict(what) => DedupError::NotFound(what),
            other => other,
        }
    }
}

pub type Result<T, E = DedupError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_io_is_retryable() {
        let io_err = DedupError::StorageIo(io::Error::new(io::ErrorKind::Other, "disk"));
        assert!(io_err.is_retryable());
        assert!(!DedupError::NotFound("x".into()).is_retryable());
        assert!(!DedupError::InvariantViolation("x".into()).is_retryable());
    }

    #[test]
    fn test_conflict_maps_to_not_found() {
        let err = DedupError::Conflict("file 1".into()).conflict_as_not_found();
        assert!(matches!(err, DedupError::NotFound(ref what) if what == "file 1"));

        let err = DedupError::InvalidInput("bad".into()).conflict_as_not_found();
        assert!(matches!(err, DedupError::InvalidInput(_)));
    }

    #[test]
    fn test_size_limit_message() {
        let err = DedupError::SizeLimitExceeded {
            limit: 10,
            actual: 11,
        };
        assert_eq!(
            err.to_string(),
            "upload of 11 bytes exceeds the limit of 10 bytes"
        );
    }
}
