//! Error types for the overlay engine
//!
//! Identity- and name-level errors (`NotFound`, `AlreadyExists`,
//! `TypeMismatch`) are returned to the caller for local handling; the
//! kernel-facing adapter translates them to OS error codes. Fatal
//! errors (`StoreUnavailable`, `SchemaIncompatible`) are escalated to
//! the mount lifecycle and never retried internally.

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Overlay engine errors
#[derive(Debug, Error)]
pub enum Error {
    /// Referenced inode identity has no entry in the store
    #[error("inode {0} not found")]
    NotFound(u64),

    /// Name not present under the given parent tree
    #[error("name '{name}' not found under inode {parent}")]
    NameNotFound { parent: u64, name: String },

    /// Name already present under the given parent tree
    #[error("name '{name}' already exists under inode {parent}")]
    AlreadyExists { parent: u64, name: String },

    /// Operation applied to the wrong entry kind
    #[error("inode {ino} is not a {expected}")]
    TypeMismatch { ino: u64, expected: &'static str },

    /// Underlying durability layer failed; no further correctness guarantees
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// On-disk schema version does not match this build
    #[error("schema version {found} is incompatible (expected {expected})")]
    SchemaIncompatible { found: u32, expected: u32 },

    /// Structural violation detected in the stored tree
    #[error("overlay corruption: {0}")]
    Corruption(String),

    /// Failed to encode a value for storage
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to decode a stored value
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Filesystem-level I/O error (config files, paths)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error requires failing the mount (or dropping to
    /// read-only) rather than being handled by the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::StoreUnavailable(_) | Error::SchemaIncompatible { .. }
        )
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}

impl From<sled::transaction::TransactionError<Error>> for Error {
    fn from(e: sled::transaction::TransactionError<Error>) -> Self {
        match e {
            sled::transaction::TransactionError::Abort(err) => err,
            sled::transaction::TransactionError::Storage(err) => err.into(),
        }
    }
}
