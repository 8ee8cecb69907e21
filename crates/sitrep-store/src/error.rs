//! Error types for sitrep-store

use thiserror::Error;

use crate::record::EntityKind;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Another row already holds the unique key and the caller asked to fail
    #[error("unique constraint violated on {kind:?}: {detail}")]
    UniqueViolation { kind: EntityKind, detail: String },

    /// A referenced parent row does not exist
    #[error("{kind:?} references missing {parent:?} #{id}")]
    MissingParent {
        kind: EntityKind,
        parent: EntityKind,
        id: i64,
    },

    /// Explicit id does not exist
    #[error("{kind:?} #{id} not found")]
    NotFound { kind: EntityKind, id: i64 },

    /// Store returned a different entity kind than requested
    #[error("expected {expected:?}, store returned {actual:?}")]
    KindMismatch {
        expected: EntityKind,
        actual: EntityKind,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Stored row could not be decoded
    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },

    /// Invalid store configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// Check if the error is a key conflict
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;
