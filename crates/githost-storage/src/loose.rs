//! Loose objects: one zlib-compressed file per object under `objects/xx/`.

use crate::compression::{CompressionLevel, CompressionStats};
use crate::hash::HashAlgorithm;
use crate::{GitObject, ObjectId, ObjectType, Result, StorageError};
use bytes::Bytes;
use flate2::write::ZlibEncoder;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Reader/writer for the loose half of an object database.
#[derive(Debug)]
pub struct LooseStore {
    dir: PathBuf,
    algorithm: HashAlgorithm,
    level: CompressionLevel,
    fsync: bool,
    stats: CompressionStats,
}

impl LooseStore {
    /// Creates a store rooted at an `objects` directory.
    pub fn new(
        dir: impl Into<PathBuf>,
        algorithm: HashAlgorithm,
        level: CompressionLevel,
        fsync: bool,
    ) -> Self {
        Self {
            dir: dir.into(),
            algorithm,
            level,
            fsync,
            stats: CompressionStats::new(),
        }
    }

    /// The `objects` directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Compression accounting for writes and reads.
    pub fn stats(&self) -> &CompressionStats {
        &self.stats
    }

    /// Path of the file that holds `id`.
    pub fn path_for(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.dir.join(&hex[..2]).join(&hex[2..])
    }

    /// True when a loose file for `id` exists.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.path_for(id).is_file()
    }

    /// Writes an object. Returns `false` when it was already present.
    ///
    /// The file is written under a temporary name in `objects/`, synced, and
    /// linked into place without replacing an existing file, so concurrent
    /// writers of the same content cannot tear each other's output.
    pub fn write(&self, object: &GitObject) -> Result<bool> {
        let path = self.path_for(&object.id);
        if path.is_file() {
            return Ok(false);
        }

        let header = format!("{} {}\0", object.object_type.as_str(), object.data.len());
        let tmp = tempfile::Builder::new()
            .prefix("tmp_obj_")
            .tempfile_in(&self.dir)?;
        let mut encoder = ZlibEncoder::new(tmp, self.level.to_flate2());
        encoder.write_all(header.as_bytes())?;
        encoder.write_all(&object.data)?;
        let tmp = encoder.finish()?;

        let compressed_len = tmp.as_file().metadata()?.len();
        if self.fsync {
            tmp.as_file().sync_all()?;
        }

        let fanout = path
            .parent()
            .ok_or_else(|| StorageError::Corruption(format!("bad object path {}", path.display())))?;
        fs::create_dir_all(fanout)?;

        match tmp.persist_noclobber(&path) {
            Ok(_) => {}
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                tracing::debug!(id = %object.id, "loose object raced with another writer");
                return Ok(false);
            }
            Err(e) => return Err(e.error.into()),
        }
        if self.fsync {
            sync_dir(fanout)?;
        }

        self.stats
            .record_compress((header.len() + object.data.len()) as u64, compressed_len);
        tracing::debug!(id = %object.id, kind = %object.object_type, size = object.data.len(), "wrote loose object");
        Ok(true)
    }

    /// Reads an object, or `None` when no loose file exists.
    pub fn read(&self, id: &ObjectId) -> Result<Option<GitObject>> {
        let compressed = match fs::read(self.path_for(id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let raw = crate::compression::inflate(&compressed)
            .map_err(|e| StorageError::Corruption(format!("loose object {}: {}", id, e)))?;
        self.stats.record_decompress();

        let (object_type, body_start, size) = parse_header(&raw)
            .ok_or_else(|| StorageError::Corruption(format!("loose object {} has a bad header", id)))?;
        if raw.len() - body_start != size {
            return Err(StorageError::Corruption(format!(
                "loose object {} declares {} bytes but holds {}",
                id,
                size,
                raw.len() - body_start
            )));
        }

        let mut raw = Bytes::from(raw);
        let data = raw.split_off(body_start);
        let object = GitObject::from_parts(*id, object_type, data);
        object.verify()?;
        Ok(Some(object))
    }

    /// Deletes the loose copy of `id`. Missing files are not an error.
    pub fn remove(&self, id: &ObjectId) -> Result<()> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The two-hex-digit fan-out directories that currently exist.
    pub fn fanout_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(dirs),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.len() == 2
                && name.bytes().all(|b| b.is_ascii_hexdigit())
                && entry.file_type()?.is_dir()
            {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Ids of the objects stored in one fan-out directory.
    ///
    /// Temporary files and anything else that is not a well-formed object
    /// name are ignored. A directory that vanished yields nothing.
    pub fn ids_in(&self, fanout: &Path) -> Result<Vec<ObjectId>> {
        let Some(prefix) = fanout.file_name().and_then(|n| n.to_str()) else {
            return Ok(Vec::new());
        };
        let entries = match fs::read_dir(fanout) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let rest_len = self.algorithm.hex_len() - 2;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.len() != rest_len {
                continue;
            }
            if let Ok(id) = ObjectId::from_hex(&format!("{}{}", prefix, name)) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Parses `"<type> <size>\0"`, returning the type, body offset and size.
fn parse_header(raw: &[u8]) -> Option<(ObjectType, usize, usize)> {
    let nul = raw.iter().take(32).position(|b| *b == 0)?;
    let header = std::str::from_utf8(&raw[..nul]).ok()?;
    let (kind, size) = header.split_once(' ')?;
    let kind = ObjectType::parse(kind).ok()?;
    let size = size.parse().ok()?;
    Some((kind, nul + 1, size))
}

/// Makes a rename durable by syncing its directory.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
