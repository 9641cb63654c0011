//! Error types for stratadb.

use std::io;
use thiserror::Error;

/// Result type alias for stratadb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for storage-engine operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Key (or resource) not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Persisted bytes violate a format invariant.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Requested operation is not supported.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Caller passed an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O error from file operations.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Create a not-found error with the given message.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a corruption error with the given message.
    pub fn corruption<S: Into<String>>(msg: S) -> Self {
        Error::Corruption(msg.into())
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Check if this error is a missing-key report.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check if this error indicates corruption.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::corruption("bad block");
        assert_eq!(format!("{}", err), "corruption: bad block");

        let err = Error::not_found("key");
        assert_eq!(format!("{}", err), "not found: key");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_predicates() {
        assert!(Error::corruption("x").is_corruption());
        assert!(!Error::corruption("x").is_not_found());
        assert!(Error::not_found("x").is_not_found());
        assert!(!Error::Io("x".into()).is_corruption());
    }
}
