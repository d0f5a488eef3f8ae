//! Common error types for content storage.

use thiserror::Error;

/// Top-level error type for content storage operations.
///
/// Provider errors travel unchanged through the registry, router and
/// factory, so callers can always match on the original kind.
#[derive(Debug, Error)]
pub enum Error {
    /// Resource does not exist at the addressed provider.
    #[error("Not found: {0}")]
    NotFound(String),

    /// No configured provider owns the URI or accepts the content.
    #[error("No provider: {0}")]
    NoProvider(String),

    /// A provider capacity limit would be exceeded.
    #[error("Quota exceeded: {0}")]
    Quota(String),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// The factory was used before it was configured.
    #[error("Content provider factory is not configured")]
    NotConfigured,

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),
}

impl Error {
    /// Whether the failure is an I/O fault that may succeed on retry.
    ///
    /// Only idempotent operations should be retried blindly.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Io(_))
    }

    /// Whether the failure means the resource is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Unwraps an `Error` that was carried through an I/O layer, so the original
/// kind survives adapters like `StreamReader`.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if !err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            return Error::Io(err);
        }
        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(inner)) => *inner,
            _ => Error::Io(kind.into()),
        }
    }
}

/// Wraps the error for I/O adapters. The kind is mapped where one exists and
/// the original error rides along as the inner error.
impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::NotFound(_) => std::io::ErrorKind::NotFound,
            Error::InvalidInput(_) => std::io::ErrorKind::InvalidInput,
            Error::AlreadyExists(_) => std::io::ErrorKind::AlreadyExists,
            _ => std::io::ErrorKind::Other,
        };
        match err {
            Error::Io(io) => io,
            other => std::io::Error::new(kind, other),
        }
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Storage("disk hiccup".into()).is_transient());
        assert!(Error::Io(std::io::Error::other("reset")).is_transient());
        assert!(!Error::NotFound("x".into()).is_transient());
        assert!(!Error::NoProvider("x".into()).is_transient());
        assert!(!Error::NotConfigured.is_transient());
    }

    #[test]
    fn test_io_conversion_keeps_not_found_kind() {
        let io: std::io::Error = Error::NotFound("mem://a/b".into()).into();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);

        let io: std::io::Error = Error::Quota("full".into()).into();
        assert_eq!(io.kind(), std::io::ErrorKind::Other);
        assert!(io.to_string().contains("full"));
    }

    #[test]
    fn test_error_survives_io_round_trip() {
        let io: std::io::Error = Error::Quota("full".into()).into();
        assert!(matches!(Error::from(io), Error::Quota(msg) if msg == "full"));

        let io: std::io::Error = Error::NotFound("mem://a/b".into()).into();
        assert!(Error::from(io).is_not_found());

        let plain = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        match Error::from(plain) {
            Error::Io(io) => assert_eq!(io.kind(), std::io::ErrorKind::BrokenPipe),
            other => panic!("unexpected {:?}", other),
        }
    }
}
