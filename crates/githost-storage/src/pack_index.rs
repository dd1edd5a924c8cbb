//! Git pack index (`.idx`) version 2.
//!
//! Layout: magic `\xfftOc`, version 2, a 256-entry cumulative fan-out table,
//! sorted object ids, one CRC32 per object, 4-byte offsets (MSB set means
//! "index into the 8-byte table"), the 8-byte offsets, the pack checksum,
//! and a checksum of the index itself.

use crate::hash::{HashAlgorithm, HashingWriter};
use crate::pack::PackEntryInfo;
use crate::{ObjectId, Result, StorageError};
use std::io::Write;
use std::path::Path;

const IDX_MAGIC: [u8; 4] = [0xff, b't', b'O', b'c'];
const IDX_VERSION: u32 = 2;
const IDX_HEADER_LEN: usize = 8;
const FANOUT_LEN: usize = 256 * 4;
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

/// A parsed pack index.
#[derive(Debug, Clone)]
pub struct PackIndex {
    fanout: [u32; 256],
    ids: Vec<ObjectId>,
    crc32: Vec<u32>,
    offsets: Vec<u64>,
    pack_checksum: ObjectId,
}

impl PackIndex {
    /// Reads and validates an index file.
    pub fn open(path: &Path, algorithm: HashAlgorithm) -> Result<Self> {
        let data = std::fs::read(path)?;
        Self::parse(&data, algorithm)
            .map_err(|e| StorageError::Corruption(format!("{}: {}", path.display(), e)))
    }

    /// Parses index bytes, verifying the trailing checksum.
    pub fn parse(data: &[u8], algorithm: HashAlgorithm) -> Result<Self> {
        let hash_len = algorithm.digest_len();
        if data.len() < IDX_HEADER_LEN + FANOUT_LEN + 2 * hash_len {
            return Err(corrupt("index too small"));
        }
        if data[..4] != IDX_MAGIC {
            return Err(corrupt("bad index magic"));
        }
        if be_u32(&data[4..8]) != IDX_VERSION {
            return Err(corrupt("unsupported index version"));
        }

        let body_end = data.len() - hash_len;
        if algorithm.digest(&data[..body_end]).as_bytes() != &data[body_end..] {
            return Err(corrupt("index checksum mismatch"));
        }

        let mut fanout = [0u32; 256];
        let mut prev = 0;
        for (i, slot) in fanout.iter_mut().enumerate() {
            let at = IDX_HEADER_LEN + i * 4;
            let value = be_u32(&data[at..at + 4]);
            if value < prev {
                return Err(corrupt("fan-out table is not monotonic"));
            }
            *slot = value;
            prev = value;
        }
        let count = fanout[255] as usize;

        let ids_at = IDX_HEADER_LEN + FANOUT_LEN;
        let crc_at = ids_at + count * hash_len;
        let ofs_at = crc_at + count * 4;
        let large_at = ofs_at + count * 4;
        // Without large offsets the tables end exactly at the pack checksum.
        let checksum_at = data.len() - 2 * hash_len;
        if large_at > checksum_at || (checksum_at - large_at) % 8 != 0 {
            return Err(corrupt("index tables do not match object count"));
        }
        let large_count = (checksum_at - large_at) / 8;

        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let at = ids_at + i * hash_len;
            ids.push(ObjectId::from_raw(&data[at..at + hash_len])?);
        }
        if ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err(corrupt("object ids are not strictly sorted"));
        }

        let crc32 = (0..count)
            .map(|i| be_u32(&data[crc_at + i * 4..crc_at + i * 4 + 4]))
            .collect();

        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            let raw = be_u32(&data[ofs_at + i * 4..ofs_at + i * 4 + 4]);
            if raw & LARGE_OFFSET_FLAG == 0 {
                offsets.push(raw as u64);
            } else {
                let slot = (raw & !LARGE_OFFSET_FLAG) as usize;
                if slot >= large_count {
                    return Err(corrupt("large offset out of bounds"));
                }
                let at = large_at + slot * 8;
                offsets.push(be_u64(&data[at..at + 8]));
            }
        }

        let pack_checksum = ObjectId::from_raw(&data[checksum_at..checksum_at + hash_len])?;

        Ok(Self {
            fanout,
            ids,
            crc32,
            offsets,
            pack_checksum,
        })
    }

    /// Offset of `id` in the pack, if present.
    ///
    /// Binary search restricted to the fan-out bucket of the first byte.
    pub fn lookup(&self, id: &ObjectId) -> Option<u64> {
        let first = id.first_byte() as usize;
        let start = if first == 0 {
            0
        } else {
            self.fanout[first - 1] as usize
        };
        let end = self.fanout[first] as usize;
        self.ids[start..end]
            .binary_search(id)
            .ok()
            .map(|i| self.offsets[start + i])
    }

    /// CRC32 recorded for `id`.
    pub fn crc32_of(&self, id: &ObjectId) -> Option<u32> {
        self.ids.binary_search(id).ok().map(|i| self.crc32[i])
    }

    /// All ids in sorted order.
    pub fn ids(&self) -> &[ObjectId] {
        &self.ids
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when the index lists no objects.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Checksum of the pack this index describes.
    pub fn pack_checksum(&self) -> ObjectId {
        self.pack_checksum
    }
}

/// Writes a v2 index for the given entries and returns its checksum.
///
/// `entries` is sorted in place by id.
pub fn write_index<W: Write>(
    writer: W,
    algorithm: HashAlgorithm,
    entries: &mut [PackEntryInfo],
    pack_checksum: &ObjectId,
) -> Result<(W, ObjectId)> {
    entries.sort_by(|a, b| a.id.cmp(&b.id));
    if entries.windows(2).any(|w| w[0].id == w[1].id) {
        return Err(StorageError::InvalidObject(
            "duplicate object in pack index".to_string(),
        ));
    }

    let mut out = HashingWriter::new(writer, algorithm);
    out.write_all(&IDX_MAGIC)?;
    out.write_all(&IDX_VERSION.to_be_bytes())?;

    let mut fanout = [0u32; 256];
    for entry in entries.iter() {
        fanout[entry.id.first_byte() as usize] += 1;
    }
    let mut running = 0u32;
    for slot in fanout.iter_mut() {
        running += *slot;
        *slot = running;
    }
    for value in fanout {
        out.write_all(&value.to_be_bytes())?;
    }

    for entry in entries.iter() {
        out.write_all(entry.id.as_bytes())?;
    }
    for entry in entries.iter() {
        out.write_all(&entry.crc32.to_be_bytes())?;
    }

    let mut large = Vec::new();
    for entry in entries.iter() {
        if entry.offset < LARGE_OFFSET_FLAG as u64 {
            out.write_all(&(entry.offset as u32).to_be_bytes())?;
        } else {
            let slot = large.len() as u32 | LARGE_OFFSET_FLAG;
            out.write_all(&slot.to_be_bytes())?;
            large.push(entry.offset);
        }
    }
    for offset in large {
        out.write_all(&offset.to_be_bytes())?;
    }

    out.write_all(pack_checksum.as_bytes())?;
    let (mut inner, checksum) = out.into_parts();
    inner.write_all(checksum.as_bytes())?;
    inner.flush()?;
    Ok((inner, checksum))
}

fn corrupt(msg: &str) -> StorageError {
    StorageError::Corruption(msg.to_string())
}

fn be_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_be_bytes(buf)
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(first: u8, fill: u8, offset: u64) -> PackEntryInfo {
        let mut bytes = [fill; 20];
        bytes[0] = first;
        PackEntryInfo {
            id: ObjectId::from_bytes(bytes),
            offset,
            crc32: offset as u32 ^ 0xdead_beef,
        }
    }

    fn build(entries: &mut [PackEntryInfo]) -> Vec<u8> {
        let checksum = ObjectId::from_bytes([0x5a; 20]);
        let (buf, _) = write_index(Vec::new(), HashAlgorithm::Sha1, entries, &checksum).unwrap();
        buf
    }

    #[test]
    fn test_write_then_lookup() {
        let mut entries = vec![entry(0xff, 1, 300), entry(0x00, 2, 12), entry(0x80, 3, 150)];
        let data = build(&mut entries);
        let idx = PackIndex::parse(&data, HashAlgorithm::Sha1).unwrap();

        assert_eq!(idx.len(), 3);
        assert_eq!(idx.pack_checksum(), ObjectId::from_bytes([0x5a; 20]));
        for e in &entries {
            assert_eq!(idx.lookup(&e.id), Some(e.offset));
            assert_eq!(idx.crc32_of(&e.id), Some(e.crc32));
        }
        assert_eq!(idx.lookup(&ObjectId::from_bytes([0x81; 20])), None);
        assert!(idx.ids().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_large_offsets() {
        let big = 5 * 1024 * 1024 * 1024u64;
        let mut entries = vec![entry(0x10, 1, 12), entry(0x20, 2, big)];
        let data = build(&mut entries);
        let idx = PackIndex::parse(&data, HashAlgorithm::Sha1).unwrap();
        assert_eq!(idx.lookup(&entries[1].id), Some(big));
        assert_eq!(idx.lookup(&entries[0].id), Some(12));
    }

    #[test]
    fn test_empty_index() {
        let data = build(&mut []);
        let idx = PackIndex::parse(&data, HashAlgorithm::Sha1).unwrap();
        assert!(idx.is_empty());
        assert_eq!(data.len(), 8 + 1024 + 40);
    }

    #[test]
    fn test_checksum_is_verified() {
        let mut entries = vec![entry(0x42, 1, 12)];
        let mut data = build(&mut entries);
        let at = 8 + 1024 + 3;
        data[at] ^= 0x01;
        assert!(matches!(
            PackIndex::parse(&data, HashAlgorithm::Sha1),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut data = build(&mut []);
        data[0] = 0;
        assert!(PackIndex::parse(&data, HashAlgorithm::Sha1).is_err());
        assert!(PackIndex::parse(&data[..10], HashAlgorithm::Sha1).is_err());
    }

    #[test]
    fn test_duplicate_entries_rejected() {
        let mut entries = vec![entry(0x42, 1, 12), entry(0x42, 1, 40)];
        let checksum = ObjectId::from_bytes([0; 20]);
        assert!(write_index(Vec::new(), HashAlgorithm::Sha1, &mut entries, &checksum).is_err());
    }

    #[test]
    fn test_sha256_index() {
        let id = ObjectId::Sha256([0x33; 32]);
        let mut entries = vec![PackEntryInfo {
            id,
            offset: 12,
            crc32: 7,
        }];
        let checksum = ObjectId::Sha256([0x01; 32]);
        let (data, _) =
            write_index(Vec::new(), HashAlgorithm::Sha256, &mut entries, &checksum).unwrap();
        let idx = PackIndex::parse(&data, HashAlgorithm::Sha256).unwrap();
        assert_eq!(idx.lookup(&id), Some(12));
        assert!(PackIndex::parse(&data, HashAlgorithm::Sha1).is_err());
    }
}
