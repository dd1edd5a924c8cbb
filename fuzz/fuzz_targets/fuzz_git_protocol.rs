//! Fuzz target for the receive-pack and upload-pack request handlers.
//!
//! Runs arbitrary request bodies against a small repository. Whatever the
//! input, the handlers must not panic, and a protocol error must leave the
//! response empty.

#![no_main]

use arbitrary::Arbitrary;
use githost_git::{receive_pack, upload_pack};
use githost_storage::{ObjectType, Repository, StorageConfig};
use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

#[derive(Debug, Arbitrary)]
enum Request {
    Receive(Vec<u8>),
    Upload(Vec<u8>),
}

fuzz_target!(|request: Request| {
    let Ok(dir) = tempfile::TempDir::new() else {
        return;
    };
    let config = StorageConfig {
        fsync: false,
        ..StorageConfig::default()
    };
    let Ok(repo) = Repository::init(dir.path().join("fuzz.git"), "fuzz/repo", &config) else {
        return;
    };
    let Ok(tree) = repo.objects.put(ObjectType::Tree, Vec::<u8>::new()) else {
        return;
    };
    let sig = "Fuzz <fuzz@example.com> 0 +0000";
    if repo.commit(&tree, "seed\n", sig, sig).is_err() {
        return;
    }

    let mut out = Vec::new();
    let err = match request {
        Request::Receive(body) => receive_pack(Cursor::new(body), &mut out, &repo).err(),
        Request::Upload(body) => upload_pack(Cursor::new(body), &mut out, &repo).err(),
    };
    if let Some(err) = err {
        if err.is_protocol_error() {
            assert!(out.is_empty());
        }
    }
});
