//! Store errors

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors from store operations
///
/// A corrupt record is never an error: it reads as absent and is logged.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Record {category}/{id} already exists")]
    AlreadyExists { category: String, id: String },

    #[error("Failed to serialize {category} record: {source}")]
    Serialize {
        category: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// True when an exclusive create lost to an existing record
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
