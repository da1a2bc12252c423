//! Error types for the change feed.

use crate::handlers::HandlerId;
use crate::types::ConflictKey;
use std::fmt;
use thiserror::Error;

/// Main error type for change feed operations.
#[derive(Debug, Error)]
pub enum ChangeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Change not found: {0}")]
    ChangeNotFound(String),

    #[error("Registration not found: {0}")]
    RegistrationNotFound(String),

    #[error("Handler not found: {0}")]
    HandlerNotFound(HandlerId),

    #[error("Not written: {0}")]
    NotWritten(String),

    #[error("Conflict: a change already exists for {0}")]
    Conflict(ConflictKey),

    #[error("Change not deleted, conflict: {0} is still pending for a registration")]
    ChangeReferenced(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Change feed has been shut down")]
    ShutDown,
}

/// Coarse error taxonomy that transports map onto their own status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A change, registration or handler does not exist.
    NotFound,
    /// A write was rejected or affected nothing.
    NotWritten,
    /// Duplicate state transition, or deletion of a referenced change.
    Conflict,
    /// Storage, I/O, serialization or lifecycle failure.
    Backend,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::NotWritten => "not_written",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Backend => "backend",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ChangeError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChangeError::ChangeNotFound(_)
            | ChangeError::RegistrationNotFound(_)
            | ChangeError::HandlerNotFound(_) => ErrorKind::NotFound,
            ChangeError::NotWritten(_) => ErrorKind::NotWritten,
            ChangeError::Conflict(_) | ChangeError::ChangeReferenced(_) => ErrorKind::Conflict,
            _ => ErrorKind::Backend,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }
}

impl From<serde_json::Error> for ChangeError {
    fn from(e: serde_json::Error) -> Self {
        ChangeError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for ChangeError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ChangeError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ChangeError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ChangeError::Deserialization(e.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for ChangeError {
    fn from(e: rusqlite::Error) -> Self {
        ChangeError::Database(e.to_string())
    }
}

/// Result type for change feed operations.
pub type Result<T> = std::result::Result<T, ChangeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(ChangeError::ChangeNotFound("c".into()).kind(), ErrorKind::NotFound);
        assert_eq!(ChangeError::RegistrationNotFound("r".into()).kind(), ErrorKind::NotFound);
        assert_eq!(ChangeError::NotWritten("x".into()).kind(), ErrorKind::NotWritten);
        assert_eq!(ChangeError::ChangeReferenced("c".into()).kind(), ErrorKind::Conflict);
        assert_eq!(ChangeError::Locked.kind(), ErrorKind::Backend);
        assert!(ChangeError::HandlerNotFound(HandlerId(3)).is_not_found());
    }

    #[test]
    fn test_conflict_message_names_tuple() {
        let key = ConflictKey {
            data_id: "d1".into(),
            data_service_name: "timers".into(),
            data_type: "timer".into(),
            data_action: "start".into(),
            data_version: 2,
        };
        let err = ChangeError::Conflict(key);
        assert!(err.is_conflict());
        assert!(err.to_string().contains("d1"));
    }
}
