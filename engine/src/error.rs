//! Error types for the Tandem engine.

use crate::{ConflictId, RecordId};
use thiserror::Error;

/// All possible errors from the Tandem engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Lookup errors
    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    #[error("conflict already resolved: {0}")]
    ConflictAlreadyResolved(ConflictId),

    #[error("version '{version}' not found in conflict {conflict}")]
    VersionNotFound {
        conflict: ConflictId,
        version: String,
    },

    // Write errors
    #[error("record already exists: {0}")]
    RecordAlreadyExists(RecordId),

    #[error("clock conflict on record {0}: stored value changed since it was read")]
    ClockConflict(RecordId),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("snapshot format mismatch: expected {expected}, got {actual}")]
    SnapshotVersionMismatch { expected: u32, actual: u32 },
}

impl Error {
    /// True for the lookup family: the referenced record, conflict or
    /// version is absent (or the conflict is no longer open).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::RecordNotFound(_)
                | Error::ConflictNotFound(_)
                | Error::ConflictAlreadyResolved(_)
                | Error::VersionNotFound { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::RecordNotFound("todo-1".into());
        assert_eq!(err.to_string(), "record not found: todo-1");

        let err = Error::VersionNotFound {
            conflict: "todo-1".into(),
            version: "dev-a@3".into(),
        };
        assert_eq!(
            err.to_string(),
            "version 'dev-a@3' not found in conflict todo-1"
        );

        let err = Error::SnapshotVersionMismatch {
            expected: 1,
            actual: 2,
        };
        assert_eq!(err.to_string(), "snapshot format mismatch: expected 1, got 2");
    }

    #[test]
    fn not_found_family() {
        assert!(Error::ConflictNotFound("x".into()).is_not_found());
        assert!(Error::ConflictAlreadyResolved("x".into()).is_not_found());
        assert!(!Error::ClockConflict("x".into()).is_not_found());
        assert!(!Error::InvalidPayload("x".into()).is_not_found());
    }
}
