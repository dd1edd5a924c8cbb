//! Storage configuration.

use crate::cache::CacheConfig;
use crate::compression::CompressionLevel;
use crate::hash::HashAlgorithm;
use serde::{Deserialize, Serialize};

/// Settings for object and reference storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Object format for newly created repositories. Existing repositories
    /// keep the format recorded in their `config` file.
    pub hash_algorithm: HashAlgorithm,
    /// zlib level for loose objects and written packs.
    pub compression: CompressionLevel,
    /// Sync files and directories before reporting a write as done.
    pub fsync: bool,
    /// Entry cap for the decoded object cache.
    pub cache_max_objects: usize,
    /// Byte cap for the decoded object cache.
    pub cache_max_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            hash_algorithm: HashAlgorithm::Sha1,
            compression: CompressionLevel::Default,
            fsync: true,
            cache_max_objects: 10_000,
            cache_max_bytes: 64 * 1024 * 1024,
        }
    }
}

impl StorageConfig {
    /// Cache bounds derived from this configuration.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_objects: self.cache_max_objects,
            max_size_bytes: self.cache_max_bytes,
        }
    }
}
