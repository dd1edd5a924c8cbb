//! Fuzz target for pack decoding.
//!
//! Tests that the pack decoder handles arbitrary input without panicking.

#![no_main]

use githost_git::{PackDecoder, PackLimits};
use githost_storage::{ObjectStore, StorageConfig};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let Ok(dir) = tempfile::TempDir::new() else {
        return;
    };
    let config = StorageConfig {
        fsync: false,
        ..StorageConfig::default()
    };
    let Ok(store) = ObjectStore::open(dir.path(), &config) else {
        return;
    };

    let limits = PackLimits {
        max_object_size: 1 << 20,
        max_pack_bytes: 4 << 20,
    };
    let _ = PackDecoder::new(&store, limits).decode(Cursor::new(data));
});
