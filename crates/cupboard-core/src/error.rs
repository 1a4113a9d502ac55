//! Error types for the cupboard core library.

use std::path::PathBuf;
use thiserror::Error;

/// Error taxonomy shared by every cupboard layer.
///
/// The domain variants (`NotFound` through `UnknownTable`) are recoverable
/// conditions reported back to the caller. `Io`, `Json`, `Corrupt` and
/// `Database` are storage failures; see [`Error::is_storage`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("{table}: no row with id {id}")]
    NotFound { table: String, id: String },

    #[error("{table}: id must not be empty")]
    InvalidId { table: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("operation {operation} is not valid on a {stash_type} stash")]
    InvalidStashType {
        operation: &'static str,
        stash_type: String,
    },

    #[error("lock holder must not be empty")]
    InvalidHolder,

    #[error("lock is held by {holder}")]
    LockHeld { holder: String },

    #[error("{holder} does not hold the lock")]
    NotLockHolder { holder: String },

    #[error("property not found: {0}")]
    PropertyNotFound(String),

    #[error("{table}: name {name:?} already exists")]
    DuplicateName { table: String, name: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{}:{line}: corrupt JSONL record: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("database error: {0}")]
    Database(String),
}

impl Error {
    pub fn not_found(table: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            table: table.into(),
            id: id.into(),
        }
    }

    pub fn invalid_id(table: impl Into<String>) -> Self {
        Error::InvalidId {
            table: table.into(),
        }
    }

    pub fn duplicate_name(table: impl Into<String>, name: impl Into<String>) -> Self {
        Error::DuplicateName {
            table: table.into(),
            name: name.into(),
        }
    }

    /// True for the fatal class: the underlying storage failed, as opposed
    /// to the request being rejected.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Json(_) | Error::Corrupt { .. } | Error::Database(_)
        )
    }
}

/// Result type alias using the cupboard Error type.
pub type Result<T> = std::result::Result<T, Error>;
