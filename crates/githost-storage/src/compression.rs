//! zlib helpers and compression accounting for object storage.

use crate::{Result, StorageError};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

/// Compression level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    /// No compression (still zlib framed).
    None,
    /// Fast compression (lower ratio)
    Fast,
    /// Default compression (balanced)
    #[default]
    Default,
    /// Best compression (slower, higher ratio)
    Best,
}

impl CompressionLevel {
    /// Converts to flate2 compression level.
    pub fn to_flate2(self) -> flate2::Compression {
        match self {
            CompressionLevel::None => flate2::Compression::none(),
            CompressionLevel::Fast => flate2::Compression::fast(),
            CompressionLevel::Default => flate2::Compression::default(),
            CompressionLevel::Best => flate2::Compression::best(),
        }
    }
}

/// Compresses a buffer with zlib.
pub fn deflate(data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), level.to_flate2());
    encoder
        .write_all(data)
        .map_err(|e| StorageError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| StorageError::Compression(e.to_string()))
}

/// Decompresses a complete zlib stream.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| StorageError::Compression(e.to_string()))?;
    Ok(out)
}

/// Compression statistics for monitoring.
#[derive(Debug, Default)]
pub struct CompressionStats {
    input_bytes: AtomicU64,
    output_bytes: AtomicU64,
    compress_count: AtomicU64,
    decompress_count: AtomicU64,
}

impl CompressionStats {
    /// Creates new compression stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a compression operation.
    pub fn record_compress(&self, input_size: u64, output_size: u64) {
        self.input_bytes.fetch_add(input_size, Ordering::Relaxed);
        self.output_bytes.fetch_add(output_size, Ordering::Relaxed);
        self.compress_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a decompression operation.
    pub fn record_decompress(&self) {
        self.decompress_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of the stats.
    pub fn snapshot(&self) -> CompressionStatsSnapshot {
        CompressionStatsSnapshot {
            input_bytes: self.input_bytes.load(Ordering::Relaxed),
            output_bytes: self.output_bytes.load(Ordering::Relaxed),
            compress_count: self.compress_count.load(Ordering::Relaxed),
            decompress_count: self.decompress_count.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of compression statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompressionStatsSnapshot {
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub compress_count: u64,
    pub decompress_count: u64,
}

impl CompressionStatsSnapshot {
    /// Returns the compression ratio (output/input).
    pub fn compression_ratio(&self) -> f64 {
        if self.input_bytes == 0 {
            1.0
        } else {
            self.output_bytes as f64 / self.input_bytes as f64
        }
    }

    /// Returns the space savings fraction.
    pub fn space_savings(&self) -> f64 {
        1.0 - self.compression_ratio()
    }
}
