//! Content-addressed object store over loose objects and packfiles.

use crate::cache::{CacheStats, ObjectCache};
use crate::compression::{CompressionLevel, CompressionStatsSnapshot};
use crate::config::StorageConfig;
use crate::hash::HashAlgorithm;
use crate::loose::{sync_dir, LooseStore};
use crate::model::Object;
use crate::pack::PackWriter;
use crate::pack_index::write_index;
use crate::packed::{PackFile, PackSet};
use crate::{GitObject, ObjectId, ObjectType, Result, StorageError};
use bytes::Bytes;
use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Result of consolidating loose objects into a pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackSummary {
    /// Pack checksum; also the `pack-<checksum>` file stem.
    pub checksum: ObjectId,
    /// Number of objects in the pack.
    pub objects: usize,
    /// Path of the `.pack` file.
    pub pack_path: PathBuf,
}

/// Durable, content-addressed storage of git objects.
///
/// Objects live either loose (`objects/xx/yyyy…`) or in packs
/// (`objects/pack/pack-*.pack` with a v2 `.idx`); callers cannot tell the
/// difference. A bounded LRU cache sits in front of reads.
#[derive(Debug)]
pub struct ObjectStore {
    dir: PathBuf,
    algorithm: HashAlgorithm,
    compression: CompressionLevel,
    fsync: bool,
    loose: LooseStore,
    packs: PackSet,
    cache: ObjectCache,
}

impl ObjectStore {
    /// Opens the object database in `objects_dir`, creating the directory
    /// layout if it is missing.
    pub fn open(objects_dir: impl Into<PathBuf>, config: &StorageConfig) -> Result<Self> {
        let dir = objects_dir.into();
        fs::create_dir_all(dir.join("pack"))?;
        fs::create_dir_all(dir.join("info"))?;

        let algorithm = config.hash_algorithm;
        let loose = LooseStore::new(&dir, algorithm, config.compression, config.fsync);
        let packs = PackSet::load(dir.join("pack"), algorithm)?;
        tracing::debug!(dir = %dir.display(), packs = packs.len(), algorithm = %algorithm, "opened object store");

        Ok(Self {
            loose,
            packs,
            cache: ObjectCache::new(config.cache_config()),
            compression: config.compression,
            fsync: config.fsync,
            algorithm,
            dir,
        })
    }

    /// The hash function naming objects in this store.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// The `objects` directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stores data as an object of the given type and returns its id.
    ///
    /// Idempotent: identical content yields the same id and a single
    /// physical copy. The write is durable when this returns.
    pub fn put(&self, object_type: ObjectType, data: impl Into<Bytes>) -> Result<ObjectId> {
        let object = GitObject::with_algorithm(self.algorithm, object_type, data);
        self.put_object(&object)
    }

    /// Stores a blob and returns its ID.
    pub fn put_blob(&self, content: impl Into<Bytes>) -> Result<ObjectId> {
        self.put(ObjectType::Blob, content)
    }

    /// Stores an already-hashed object.
    pub fn put_object(&self, object: &GitObject) -> Result<ObjectId> {
        if object.id.algorithm() != self.algorithm {
            return Err(StorageError::InvalidObject(format!(
                "{} object {} in a {} repository",
                object.id.algorithm(),
                object.id,
                self.algorithm
            )));
        }
        if !self.packs.contains(&object.id) {
            self.loose.write(object)?;
        }
        self.cache.insert(object);
        Ok(object.id)
    }

    /// Retrieves an object by ID.
    pub fn get(&self, id: &ObjectId) -> Result<GitObject> {
        self.try_get(id)?
            .ok_or_else(|| StorageError::ObjectNotFound(id.to_hex()))
    }

    /// Retrieves an object, or `None` when it is absent.
    pub fn try_get(&self, id: &ObjectId) -> Result<Option<GitObject>> {
        if let Some(object) = self.cache.get(id) {
            return Ok(Some(object));
        }

        let found = match self.loose.read(id)? {
            Some(object) => Some(object),
            None => match self.packs.read(id)? {
                Some(object) => Some(object),
                // Loose copy may have moved into a pack another process wrote.
                None if self.packs.refresh()? > 0 => self.packs.read(id)?,
                None => None,
            },
        };

        if let Some(object) = &found {
            self.cache.insert(object);
        }
        Ok(found)
    }

    /// Retrieves and parses an object.
    pub fn read(&self, id: &ObjectId) -> Result<Object> {
        self.get(id)?.parse()
    }

    /// Returns the type of a stored object.
    pub fn object_type(&self, id: &ObjectId) -> Result<ObjectType> {
        Ok(self.get(id)?.object_type)
    }

    /// Checks if an object exists.
    ///
    /// Filesystem errors while rescanning packs are logged and treated as
    /// "absent".
    pub fn exists(&self, id: &ObjectId) -> bool {
        if self.cache.contains(id) || self.loose.contains(id) || self.packs.contains(id) {
            return true;
        }
        match self.packs.refresh() {
            Ok(0) => false,
            Ok(_) => self.packs.contains(id),
            Err(e) => {
                tracing::warn!(error = %e, "rescanning packs failed");
                false
            }
        }
    }

    /// Starts a walk over every stored object id.
    ///
    /// The fan-out directories and the pack set are captured now; each call
    /// starts a fresh walk. An id present both loose and packed is yielded
    /// once.
    pub fn iter(&self) -> Result<ObjectIter<'_>> {
        Ok(ObjectIter {
            store: self,
            fanouts: self.loose.fanout_dirs()?.into_iter(),
            current: Vec::new().into_iter(),
            packs: self.packs.snapshot().into_iter(),
            seen: HashSet::new(),
        })
    }

    /// Copies the given loose objects into a new pack and index, registers
    /// the pack, then deletes the loose copies.
    ///
    /// Ids that are already packed are skipped. Returns `None` when nothing
    /// was left to pack.
    pub fn write_pack(&self, ids: &[ObjectId]) -> Result<Option<PackSummary>> {
        let mut seen = HashSet::new();
        let mut objects = Vec::new();
        for id in ids {
            if !seen.insert(*id) {
                continue;
            }
            match self.loose.read(id)? {
                Some(object) => objects.push(object),
                None if self.packs.contains(id) => {}
                None => return Err(StorageError::ObjectNotFound(id.to_hex())),
            }
        }
        if objects.is_empty() {
            return Ok(None);
        }

        let pack_dir = self.packs.dir().to_path_buf();
        let count = u32::try_from(objects.len()).map_err(|_| {
            StorageError::InvalidObject(format!("too many objects for one pack: {}", objects.len()))
        })?;

        let tmp = tempfile::Builder::new()
            .prefix("tmp_pack_")
            .tempfile_in(&pack_dir)?;
        let mut writer = PackWriter::new(BufWriter::new(tmp), self.algorithm, count, self.compression)?;
        let mut entries = Vec::with_capacity(objects.len());
        for object in &objects {
            entries.push(writer.write_object(object)?);
        }
        let (buffered, checksum) = writer.finish()?;
        let tmp = buffered.into_inner().map_err(|e| e.into_error())?;
        if self.fsync {
            tmp.as_file().sync_all()?;
        }

        let stem = pack_dir.join(format!("pack-{}", checksum));
        let pack_path = stem.with_extension("pack");
        let idx_path = stem.with_extension("idx");
        tmp.persist(&pack_path).map_err(|e| e.error)?;

        let tmp = tempfile::Builder::new()
            .prefix("tmp_idx_")
            .tempfile_in(&pack_dir)?;
        let (mut buffered, _) =
            write_index(BufWriter::new(tmp), self.algorithm, &mut entries, &checksum)?;
        buffered.flush()?;
        let tmp = buffered.into_inner().map_err(|e| e.into_error())?;
        if self.fsync {
            tmp.as_file().sync_all()?;
        }
        tmp.persist(&idx_path).map_err(|e| e.error)?;
        if self.fsync {
            sync_dir(&pack_dir)?;
        }

        self.packs.register(PackFile::open(&idx_path, self.algorithm)?);

        for object in &objects {
            self.loose.remove(&object.id)?;
        }
        tracing::info!(pack = %checksum, objects = objects.len(), "packed loose objects");

        Ok(Some(PackSummary {
            checksum,
            objects: objects.len(),
            pack_path,
        }))
    }

    /// Returns current cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Returns loose-object compression statistics.
    pub fn compression_stats(&self) -> CompressionStatsSnapshot {
        self.loose.stats().snapshot()
    }
}

/// Lazy walk over the ids in an [`ObjectStore`], created by
/// [`ObjectStore::iter`].
#[derive(Debug)]
pub struct ObjectIter<'a> {
    store: &'a ObjectStore,
    fanouts: std::vec::IntoIter<PathBuf>,
    current: std::vec::IntoIter<ObjectId>,
    packs: std::vec::IntoIter<Arc<PackFile>>,
    seen: HashSet<ObjectId>,
}

impl Iterator for ObjectIter<'_> {
    type Item = Result<ObjectId>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(id) = self.current.next() {
                if self.seen.insert(id) {
                    return Some(Ok(id));
                }
                continue;
            }
            if let Some(dir) = self.fanouts.next() {
                match self.store.loose.ids_in(&dir) {
                    Ok(ids) => self.current = ids.into_iter(),
                    Err(e) => return Some(Err(e)),
                }
                continue;
            }
            let pack = self.packs.next()?;
            self.current = pack.index().ids().to_vec().into_iter();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> ObjectStore {
        ObjectStore::open(dir.path().join("objects"), &StorageConfig::default()).unwrap()
    }

    fn loose_file_count(store: &ObjectStore) -> usize {
        walkdir::WalkDir::new(store.dir())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().parent().and_then(|p| p.file_name()).map(|n| n.len()) == Some(2))
            .count()
    }

    #[test]
    fn test_put_get() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let id = store.put_blob(&b"hello\n"[..]).unwrap();
        assert_eq!(id.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");

        let obj = store.get(&id).unwrap();
        assert_eq!(obj.object_type, ObjectType::Blob);
        assert_eq!(&obj.data[..], b"hello\n");
    }

    #[test]
    fn test_put_twice_single_copy() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        let a = store.put(ObjectType::Blob, &b"same"[..]).unwrap();
        let b = store.put(ObjectType::Blob, &b"same"[..]).unwrap();
        assert_eq!(a, b);
        assert_eq!(loose_file_count(&store), 1);
    }

    #[test]
    fn test_get_missing() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let missing = ObjectId::from_bytes([9u8; 20]);

        assert!(!store.exists(&missing));
        assert!(matches!(
            store.get(&missing),
            Err(StorageError::ObjectNotFound(_))
        ));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let id = open(&dir).put_blob(&b"persistent"[..]).unwrap();

        let store = open(&dir);
        assert!(store.exists(&id));
        assert_eq!(&store.get(&id).unwrap().data[..], b"persistent");
    }

    #[test]
    fn test_read_parses() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let tree = store.put(ObjectType::Tree, Bytes::new()).unwrap();
        let commit = GitObject::commit(&tree, &[], "A <a@x> 0 +0000", "A <a@x> 0 +0000", "root\n");
        let id = store.put_object(&commit).unwrap();

        match store.read(&id).unwrap() {
            Object::Commit(c) => assert_eq!(c.tree, tree),
            other => panic!("expected commit, got {:?}", other),
        }
        assert_eq!(store.object_type(&tree).unwrap(), ObjectType::Tree);
    }

    #[test]
    fn test_rejects_foreign_algorithm() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            hash_algorithm: HashAlgorithm::Sha256,
            ..StorageConfig::default()
        };
        let store = ObjectStore::open(dir.path(), &config).unwrap();
        assert!(store.put_object(&GitObject::blob(b"x".to_vec())).is_err());

        let id = store.put_blob(&b"x"[..]).unwrap();
        assert_eq!(id.algorithm(), HashAlgorithm::Sha256);
        assert!(store.exists(&id));
    }

    #[test]
    fn test_iter_is_restartable() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let mut expected: Vec<_> = (0..20u8)
            .map(|i| store.put_blob(vec![i; 3]).unwrap())
            .collect();
        expected.sort();

        for _ in 0..2 {
            let mut ids: Vec<_> = store.iter().unwrap().map(|r| r.unwrap()).collect();
            ids.sort();
            assert_eq!(ids, expected);
        }
    }

    #[test]
    fn test_write_pack_moves_objects() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let ids: Vec<_> = (0..5u8)
            .map(|i| store.put_blob(vec![b'a' + i; 100]).unwrap())
            .collect();

        let summary = store.write_pack(&ids).unwrap().unwrap();
        assert_eq!(summary.objects, 5);
        assert!(summary.pack_path.is_file());
        assert!(summary.pack_path.with_extension("idx").is_file());
        assert_eq!(loose_file_count(&store), 0);

        // A fresh store finds everything through the index.
        let reopened = open(&dir);
        for id in &ids {
            assert!(reopened.exists(id));
            assert_eq!(reopened.get(id).unwrap().id, *id);
        }
        assert_eq!(reopened.iter().unwrap().count(), 5);

        // Already packed: nothing to do, and re-putting writes no loose copy.
        assert!(store.write_pack(&ids).unwrap().is_none());
        store.put_blob(vec![b'a'; 100]).unwrap();
        assert_eq!(loose_file_count(&store), 0);
    }

    #[test]
    fn test_write_pack_missing_object() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let err = store.write_pack(&[ObjectId::from_bytes([3u8; 20])]).unwrap_err();
        assert!(matches!(err, StorageError::ObjectNotFound(_)));
    }

    #[test]
    fn test_pack_written_elsewhere_becomes_visible() {
        let dir = TempDir::new().unwrap();
        let writer = open(&dir);
        let reader = open(&dir);

        let id = writer.put_blob(&b"shared"[..]).unwrap();
        assert!(reader.exists(&id));
        writer.write_pack(&[id]).unwrap();

        // Loose copy is gone; the reader has never seen the new pack.
        assert_eq!(&reader.get(&id).unwrap().data[..], b"shared");
    }

    #[test]
    fn test_cache_serves_repeat_reads() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let id = store.put_blob(&b"cached"[..]).unwrap();

        store.get(&id).unwrap();
        store.get(&id).unwrap();
        assert!(store.cache_stats().hits >= 2);
    }

    #[test]
    fn test_concurrent_identical_puts() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(open(&dir));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.put_blob(&b"racy"[..]).unwrap())
            })
            .collect();
        let ids: HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(ids.len(), 1);
        assert_eq!(loose_file_count(&store), 1);
    }
}
