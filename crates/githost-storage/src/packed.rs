//! Read access to packfiles under `objects/pack`.

use crate::hash::HashAlgorithm;
use crate::pack::{decode_entry_header, EntryKind, PACK_HEADER_LEN, PACK_SIGNATURE, PACK_VERSION};
use crate::pack_index::PackIndex;
use crate::{GitObject, ObjectId, Result, StorageError};
use bytes::Bytes;
use flate2::bufread::ZlibDecoder;
use parking_lot::RwLock;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One `pack-<checksum>.pack` with its index.
#[derive(Debug)]
pub struct PackFile {
    pack_path: PathBuf,
    index: PackIndex,
    algorithm: HashAlgorithm,
}

impl PackFile {
    /// Opens a pack through its `.idx` path.
    pub fn open(idx_path: &Path, algorithm: HashAlgorithm) -> Result<Self> {
        let pack_path = idx_path.with_extension("pack");
        let index = PackIndex::open(idx_path, algorithm)?;

        let mut header = [0u8; PACK_HEADER_LEN];
        File::open(&pack_path)?.read_exact(&mut header)?;
        if &header[..4] != PACK_SIGNATURE
            || u32::from_be_bytes([header[4], header[5], header[6], header[7]]) != PACK_VERSION
        {
            return Err(StorageError::Corruption(format!(
                "{} is not a version 2 pack",
                pack_path.display()
            )));
        }
        let count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        if count as usize != index.len() {
            return Err(StorageError::Corruption(format!(
                "{} holds {} objects but its index lists {}",
                pack_path.display(),
                count,
                index.len()
            )));
        }

        Ok(Self {
            pack_path,
            index,
            algorithm,
        })
    }

    /// Path of the `.pack` file.
    pub fn path(&self) -> &Path {
        &self.pack_path
    }

    /// The pack's index.
    pub fn index(&self) -> &PackIndex {
        &self.index
    }

    /// True when the pack holds `id`.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.index.lookup(id).is_some()
    }

    /// Reads `id` from the pack, or `None` if the index does not list it.
    ///
    /// Packs written by this crate are undeltified; a delta entry is reported
    /// as corruption rather than resolved.
    pub fn read(&self, id: &ObjectId) -> Result<Option<GitObject>> {
        let Some(offset) = self.index.lookup(id) else {
            return Ok(None);
        };

        let mut file = File::open(&self.pack_path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut reader = BufReader::new(file);

        let (code, size) = decode_entry_header(&mut reader).map_err(|e| self.corrupt(id, e))?;
        let kind = EntryKind::from_code(code)
            .and_then(EntryKind::object_type)
            .ok_or_else(|| {
                StorageError::Corruption(format!(
                    "{}: entry for {} has unsupported type {}",
                    self.pack_path.display(),
                    id,
                    code
                ))
            })?;

        let mut data = Vec::with_capacity(size.min(1 << 24) as usize);
        ZlibDecoder::new(reader)
            .take(size.saturating_add(1))
            .read_to_end(&mut data)
            .map_err(|e| self.corrupt(id, e))?;
        if data.len() as u64 != size {
            return Err(self.corrupt(
                id,
                io::Error::new(io::ErrorKind::InvalidData, "inflated size mismatch"),
            ));
        }

        let actual = ObjectId::hash_object(self.algorithm, kind, &data);
        if actual != *id {
            return Err(StorageError::Corruption(format!(
                "{}: entry for {} hashes to {}",
                self.pack_path.display(),
                id,
                actual
            )));
        }
        Ok(Some(GitObject::from_parts(*id, kind, Bytes::from(data))))
    }

    fn corrupt(&self, id: &ObjectId, err: io::Error) -> StorageError {
        StorageError::Corruption(format!(
            "{}: reading {}: {}",
            self.pack_path.display(),
            id,
            err
        ))
    }
}

/// The set of packs known to an object store.
#[derive(Debug)]
pub struct PackSet {
    dir: PathBuf,
    algorithm: HashAlgorithm,
    packs: RwLock<Vec<Arc<PackFile>>>,
}

impl PackSet {
    /// Loads every readable pack in `dir`.
    pub fn load(dir: impl Into<PathBuf>, algorithm: HashAlgorithm) -> Result<Self> {
        let set = Self {
            dir: dir.into(),
            algorithm,
            packs: RwLock::new(Vec::new()),
        };
        set.refresh()?;
        Ok(set)
    }

    /// The `objects/pack` directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Picks up packs added since the last scan. Returns how many were new.
    pub fn refresh(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("idx")
                && path.with_extension("pack").is_file()
            {
                found.push(path);
            }
        }
        found.sort();

        let mut added = 0;
        for idx_path in found {
            let pack_path = idx_path.with_extension("pack");
            if self.packs.read().iter().any(|p| p.path() == pack_path) {
                continue;
            }
            match PackFile::open(&idx_path, self.algorithm) {
                Ok(pack) => {
                    tracing::debug!(pack = %pack_path.display(), objects = pack.index().len(), "loaded pack");
                    let mut packs = self.packs.write();
                    if !packs.iter().any(|p| p.path() == pack_path) {
                        packs.push(Arc::new(pack));
                        added += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(pack = %pack_path.display(), error = %e, "skipping unreadable pack");
                }
            }
        }
        Ok(added)
    }

    /// Adds a pack this process just wrote.
    pub fn register(&self, pack: PackFile) {
        let mut packs = self.packs.write();
        if !packs.iter().any(|p| p.path() == pack.path()) {
            packs.push(Arc::new(pack));
        }
    }

    /// The pack holding `id`, if any.
    pub fn find(&self, id: &ObjectId) -> Option<Arc<PackFile>> {
        self.packs.read().iter().find(|p| p.contains(id)).cloned()
    }

    /// True when some known pack holds `id`.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.find(id).is_some()
    }

    /// Reads `id` from whichever known pack holds it.
    pub fn read(&self, id: &ObjectId) -> Result<Option<GitObject>> {
        match self.find(id) {
            Some(pack) => pack.read(id),
            None => Ok(None),
        }
    }

    /// The packs known right now.
    pub fn snapshot(&self) -> Vec<Arc<PackFile>> {
        self.packs.read().clone()
    }

    /// Number of known packs.
    pub fn len(&self) -> usize {
        self.packs.read().len()
    }

    /// True when no packs are known.
    pub fn is_empty(&self) -> bool {
        self.packs.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionLevel;
    use crate::pack::PackWriter;
    use crate::pack_index::write_index;
    use tempfile::TempDir;

    fn write_pack(dir: &Path, objects: &[GitObject]) -> PathBuf {
        let mut writer = PackWriter::new(
            Vec::new(),
            HashAlgorithm::Sha1,
            objects.len() as u32,
            CompressionLevel::Default,
        )
        .unwrap();
        let mut entries: Vec<_> = objects
            .iter()
            .map(|o| writer.write_object(o).unwrap())
            .collect();
        let (pack, checksum) = writer.finish().unwrap();
        let (idx, _) = write_index(Vec::new(), HashAlgorithm::Sha1, &mut entries, &checksum).unwrap();

        let base = dir.join(format!("pack-{}", checksum));
        fs::write(base.with_extension("pack"), pack).unwrap();
        fs::write(base.with_extension("idx"), idx).unwrap();
        base.with_extension("idx")
    }

    #[test]
    fn test_read_from_pack() {
        let dir = TempDir::new().unwrap();
        let blob = GitObject::blob(b"packed content".to_vec());
        let tree = GitObject::new(crate::ObjectType::Tree, Vec::<u8>::new());
        let idx = write_pack(dir.path(), &[blob.clone(), tree.clone()]);

        let pack = PackFile::open(&idx, HashAlgorithm::Sha1).unwrap();
        assert_eq!(pack.read(&blob.id).unwrap(), Some(blob));
        assert_eq!(pack.read(&tree.id).unwrap(), Some(tree));
        assert_eq!(pack.read(&ObjectId::from_bytes([1; 20])).unwrap(), None);
    }

    #[test]
    fn test_refresh_picks_up_new_packs() {
        let dir = TempDir::new().unwrap();
        let set = PackSet::load(dir.path(), HashAlgorithm::Sha1).unwrap();
        assert!(set.is_empty());

        let blob = GitObject::blob(b"late arrival".to_vec());
        write_pack(dir.path(), &[blob.clone()]);
        assert!(!set.contains(&blob.id));

        assert_eq!(set.refresh().unwrap(), 1);
        assert_eq!(set.refresh().unwrap(), 0);
        assert_eq!(set.read(&blob.id).unwrap(), Some(blob));
    }

    #[test]
    fn test_missing_pack_dir() {
        let dir = TempDir::new().unwrap();
        let set = PackSet::load(dir.path().join("absent"), HashAlgorithm::Sha1).unwrap();
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_corrupt_index_is_skipped() {
        let dir = TempDir::new().unwrap();
        let idx = write_pack(dir.path(), &[GitObject::blob(b"x".to_vec())]);
        fs::write(&idx, b"garbage").unwrap();

        let set = PackSet::load(dir.path(), HashAlgorithm::Sha1).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn test_entry_hash_mismatch_is_corruption() {
        let dir = TempDir::new().unwrap();
        let claimed = ObjectId::from_bytes([9; 20]);
        let forged = GitObject::from_parts(claimed, crate::ObjectType::Blob, Bytes::from_static(b"not nines"));
        let idx = write_pack(dir.path(), &[forged]);

        let pack = PackFile::open(&idx, HashAlgorithm::Sha1).unwrap();
        assert!(matches!(
            pack.read(&claimed),
            Err(StorageError::Corruption(msg)) if msg.contains("hashes to")
        ));
    }

    #[test]
    fn test_truncated_pack_is_corruption() {
        let dir = TempDir::new().unwrap();
        let blob = GitObject::blob(vec![b'z'; 4096]);
        let idx = write_pack(dir.path(), &[blob.clone()]);
        let pack_path = idx.with_extension("pack");
        let bytes = fs::read(&pack_path).unwrap();
        fs::write(&pack_path, &bytes[..PACK_HEADER_LEN + 4]).unwrap();

        let pack = PackFile::open(&idx, HashAlgorithm::Sha1).unwrap();
        assert!(matches!(pack.read(&blob.id), Err(StorageError::Corruption(_))));
    }
}
