//! Storage error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested object is not in the store.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// The requested reference does not exist.
    #[error("reference not found: {0}")]
    RefNotFound(String),

    /// A reference name failed validation.
    #[error("invalid reference name {name:?}: {reason}")]
    InvalidRefName {
        /// The rejected name.
        name: String,
        /// Which rule it broke.
        reason: &'static str,
    },

    /// An object could not be parsed or has an invalid id.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// On-disk data is damaged.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// A repository already exists at the path.
    #[error("repository already exists: {}", .0.display())]
    RepoExists(PathBuf),

    /// No valid repository exists at the path.
    #[error("repository not found: {}", .0.display())]
    RepoNotFound(PathBuf),

    /// Another process holds the lock for a reference.
    #[error("reference is locked: {0}")]
    Locked(String),
}
