//! Git object storage for githost.
//!
//! This crate provides the on-disk half of a bare git repository:
//! content-addressed objects (loose and packed), the parsed object model,
//! and references with compare-and-swap updates.

pub mod cache;
pub mod compression;
mod config;
mod error;
pub mod hash;
pub mod loose;
mod model;
mod object;
pub mod pack;
pub mod pack_index;
pub mod packed;
mod refs;
mod repository;
mod store;

pub use cache::{CacheConfig, CacheStats};
pub use compression::CompressionLevel;
pub use config::StorageConfig;
pub use error::StorageError;
pub use hash::{HashAlgorithm, Hasher};
pub use model::{Commit, EntryMode, Object, Tag, Tree, TreeEntry};
pub use object::{GitObject, ObjectId, ObjectType};
pub use refs::{validate_ref_name, RefEntry, RefName, RefStore, RefUpdate, Reference};
pub use repository::Repository;
pub use store::{ObjectIter, ObjectStore, PackSummary};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
