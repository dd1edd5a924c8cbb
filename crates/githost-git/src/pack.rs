//! Git pack file streams on the wire.
//!
//! Incoming packs are decoded entry by entry straight from the request body
//! and every object lands in the [`ObjectStore`]. Outgoing packs are written
//! undeltified in the order commits, tags, trees, blobs.
//! See: https://git-scm.com/docs/pack-format

use crate::delta::{apply_delta, delta_sizes, DeltaError};
use crate::walk::ObjectSet;
use crate::{GitError, Result};
use flate2::bufread::ZlibDecoder;
use githost_storage::compression::CompressionLevel;
use githost_storage::hash::{HashAlgorithm, Hasher};
use githost_storage::pack::{
    decode_entry_header, decode_ofs_distance, EntryKind, PackWriter, PACK_HEADER_LEN,
    PACK_SIGNATURE, PACK_VERSION,
};
use bytes::Bytes;
use githost_storage::{GitObject, Object, ObjectId, ObjectStore, ObjectType};
use std::collections::HashMap;
use std::io::{self, BufRead, Read, Write};

/// Bounds applied while decoding an untrusted pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackLimits {
    /// Largest object, before or after delta resolution.
    pub max_object_size: u64,
    /// Largest pack stream, trailer included.
    pub max_pack_bytes: u64,
}

impl Default for PackLimits {
    fn default() -> Self {
        Self {
            max_object_size: 100 * 1024 * 1024,
            max_pack_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Tracks the byte position, hashes consumed bytes, and refuses to read
/// past the pack size limit.
struct CountingReader<R> {
    inner: R,
    hasher: Hasher,
    position: u64,
    limit: u64,
    exceeded: bool,
}

impl<R: BufRead> CountingReader<R> {
    fn new(inner: R, algorithm: HashAlgorithm, limit: u64) -> Self {
        Self {
            inner,
            hasher: algorithm.hasher(),
            position: 0,
            limit,
            exceeded: false,
        }
    }

    fn position(&self) -> u64 {
        self.position
    }

    /// Digest of everything consumed so far.
    fn digest(&self) -> ObjectId {
        self.hasher.clone().finalize()
    }

    fn error(&self, err: io::Error) -> GitError {
        if self.exceeded {
            GitError::PackTooLarge { limit: self.limit }
        } else if err.kind() == io::ErrorKind::UnexpectedEof {
            GitError::CorruptPack(format!("truncated at byte {}", self.position))
        } else {
            GitError::CorruptPack(format!("at byte {}: {}", self.position, err))
        }
    }
}

impl<R: BufRead> BufRead for CountingReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        let remaining = self.limit.saturating_sub(self.position);
        let buf = self.inner.fill_buf()?;
        if remaining == 0 && !buf.is_empty() {
            self.exceeded = true;
            return Err(io::Error::new(io::ErrorKind::Other, "pack size limit reached"));
        }
        let n = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        Ok(&buf[..n])
    }

    fn consume(&mut self, amt: usize) {
        if let Ok(buf) = self.inner.fill_buf() {
            self.hasher.update(&buf[..amt.min(buf.len())]);
        }
        self.inner.consume(amt);
        self.position += amt as u64;
    }
}

impl<R: BufRead> Read for CountingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = {
            let buf = self.fill_buf()?;
            let n = buf.len().min(out.len());
            out[..n].copy_from_slice(&buf[..n]);
            n
        };
        self.consume(n);
        Ok(n)
    }
}

/// What a delta entry is relative to.
#[derive(Debug, Clone, Copy)]
enum DeltaBase {
    /// Pack offset of an earlier entry.
    Offset(u64),
    /// Object id, in this pack or already stored.
    Id(ObjectId),
}

#[derive(Debug)]
struct PendingDelta {
    offset: u64,
    base: DeltaBase,
    delta: Vec<u8>,
}

/// Result of decoding one pack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedPack {
    /// Every object written, in the order it was resolved.
    pub objects: Vec<ObjectId>,
    /// How many entries were deltas.
    pub deltas: usize,
    /// The verified trailer; `None` for an empty stream.
    pub checksum: Option<ObjectId>,
}

/// Decodes pack streams into an object store.
#[derive(Debug, Clone, Copy)]
pub struct PackDecoder<'a> {
    store: &'a ObjectStore,
    limits: PackLimits,
}

impl<'a> PackDecoder<'a> {
    /// Creates a decoder writing into `store`.
    pub fn new(store: &'a ObjectStore, limits: PackLimits) -> Self {
        Self { store, limits }
    }

    /// Reads a whole pack from `reader`, storing every object.
    ///
    /// Deltas whose base is not yet known are held until the last entry has
    /// been read. A zero-length stream decodes to nothing.
    pub fn decode<R: BufRead>(&self, reader: R) -> Result<DecodedPack> {
        let algorithm = self.store.algorithm();
        let mut reader = CountingReader::new(reader, algorithm, self.limits.max_pack_bytes);

        let at_end = reader.fill_buf().map(|buf| buf.is_empty());
        if at_end.map_err(|e| reader.error(e))? {
            return Ok(DecodedPack::default());
        }

        let mut header = [0u8; PACK_HEADER_LEN];
        let read = reader.read_exact(&mut header);
        read.map_err(|e| reader.error(e))?;
        if &header[..4] != PACK_SIGNATURE {
            return Err(GitError::CorruptPack("missing PACK signature".to_string()));
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != PACK_VERSION {
            return Err(GitError::CorruptPack(format!(
                "unsupported pack version {}",
                version
            )));
        }
        let count = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);

        let mut decoded = DecodedPack::default();
        let mut by_offset: HashMap<u64, ObjectId> = HashMap::new();
        let mut pending: Vec<PendingDelta> = Vec::new();

        for _ in 0..count {
            let offset = reader.position();
            let (code, size) = decode_entry_header(&mut reader).map_err(|e| reader.error(e))?;
            let kind = EntryKind::from_code(code).ok_or(GitError::UnknownObjectType(code))?;
            if size > self.limits.max_object_size {
                return Err(GitError::OversizeObject {
                    size,
                    limit: self.limits.max_object_size,
                });
            }

            let base = match kind {
                EntryKind::OfsDelta => {
                    let distance = decode_ofs_distance(&mut reader).map_err(|e| reader.error(e))?;
                    if distance == 0 || distance > offset {
                        return Err(GitError::CorruptPack(format!(
                            "entry at {} points {} bytes back",
                            offset, distance
                        )));
                    }
                    Some(DeltaBase::Offset(offset - distance))
                }
                EntryKind::RefDelta => {
                    let mut raw = vec![0u8; algorithm.digest_len()];
                    let read = reader.read_exact(&mut raw);
                    read.map_err(|e| reader.error(e))?;
                    Some(DeltaBase::Id(ObjectId::from_raw(&raw)?))
                }
                _ => None,
            };

            let data = inflate(&mut reader, size)?;

            match (base, kind.object_type()) {
                (None, Some(object_type)) => {
                    let id = self.store_object(object_type, data)?;
                    by_offset.insert(offset, id);
                    decoded.objects.push(id);
                }
                (Some(base), _) => {
                    decoded.deltas += 1;
                    match self.base_object(base, &by_offset)? {
                        Some(base) => {
                            let id = self.resolve(&base, &data)?;
                            by_offset.insert(offset, id);
                            decoded.objects.push(id);
                        }
                        None => pending.push(PendingDelta {
                            offset,
                            base,
                            delta: data,
                        }),
                    }
                }
                (None, None) => return Err(GitError::UnknownObjectType(code)),
            }
        }

        let expected = reader.digest();
        let mut trailer = vec![0u8; algorithm.digest_len()];
        let read = reader.read_exact(&mut trailer);
        read.map_err(|e| reader.error(e))?;
        if trailer != expected.as_bytes() {
            return Err(GitError::CorruptPack(format!(
                "checksum mismatch: trailer {} but content hashes to {}",
                hex::encode(&trailer),
                expected
            )));
        }
        let trailing = reader.fill_buf().map(|buf| !buf.is_empty());
        if trailing.map_err(|e| reader.error(e))? {
            return Err(GitError::CorruptPack(
                "unexpected bytes after pack checksum".to_string(),
            ));
        }

        while !pending.is_empty() {
            let before = pending.len();
            let mut unresolved = Vec::new();
            for delta in pending.drain(..) {
                match self.base_object(delta.base, &by_offset)? {
                    Some(base) => {
                        let id = self.resolve(&base, &delta.delta)?;
                        by_offset.insert(delta.offset, id);
                        decoded.objects.push(id);
                    }
                    None => unresolved.push(delta),
                }
            }
            pending = unresolved;
            if pending.len() == before {
                return Err(GitError::CorruptPack(format!(
                    "{} deltas have no base in the pack or the store",
                    pending.len()
                )));
            }
        }

        decoded.checksum = Some(expected);
        tracing::debug!(
            objects = decoded.objects.len(),
            deltas = decoded.deltas,
            bytes = reader.position(),
            "decoded pack"
        );
        Ok(decoded)
    }

    fn base_object(
        &self,
        base: DeltaBase,
        by_offset: &HashMap<u64, ObjectId>,
    ) -> Result<Option<GitObject>> {
        let id = match base {
            DeltaBase::Offset(offset) => match by_offset.get(&offset) {
                Some(id) => *id,
                None => return Ok(None),
            },
            DeltaBase::Id(id) => id,
        };
        Ok(self.store.try_get(&id)?)
    }

    fn resolve(&self, base: &GitObject, delta: &[u8]) -> Result<ObjectId> {
        let corrupt = |e: DeltaError| GitError::CorruptPack(format!("delta against {}: {}", base.id, e));
        let (_, result_size) = delta_sizes(delta).map_err(corrupt)?;
        if result_size > self.limits.max_object_size {
            return Err(GitError::OversizeObject {
                size: result_size,
                limit: self.limits.max_object_size,
            });
        }
        let data = apply_delta(&base.data, delta, self.limits.max_object_size).map_err(corrupt)?;
        self.store_object(base.object_type, data)
    }

    /// Stores one object once its content parses for its type. Blobs are
    /// taken as they are.
    fn store_object(&self, object_type: ObjectType, data: Vec<u8>) -> Result<ObjectId> {
        let data = Bytes::from(data);
        if object_type != ObjectType::Blob {
            Object::parse(object_type, data.clone(), self.store.algorithm())
                .map_err(|e| GitError::CorruptPack(format!("malformed {}: {}", object_type, e)))?;
        }
        Ok(self.store.put(object_type, data)?)
    }
}

/// Inflates one entry body and checks it against the declared size.
fn inflate<R: BufRead>(reader: &mut CountingReader<R>, size: u64) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(size.min(1 << 20) as usize);
    let read = ZlibDecoder::new(&mut *reader)
        .take(size.saturating_add(1))
        .read_to_end(&mut data);
    read.map_err(|e| reader.error(e))?;
    if data.len() as u64 != size {
        return Err(GitError::CorruptPack(format!(
            "entry inflated to {} bytes but declared {}",
            data.len(),
            size
        )));
    }
    Ok(data)
}

/// Writes object sets as undeltified packs.
#[derive(Debug, Clone, Copy)]
pub struct PackEncoder<'a> {
    store: &'a ObjectStore,
    level: CompressionLevel,
}

impl<'a> PackEncoder<'a> {
    /// Creates an encoder reading from `store`.
    pub fn new(store: &'a ObjectStore) -> Self {
        Self {
            store,
            level: CompressionLevel::Default,
        }
    }

    /// Sets the zlib level for entries.
    pub fn with_compression(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    /// Streams `objects` into `writer` and returns it with the pack checksum.
    pub fn encode<W: Write>(&self, objects: &ObjectSet, writer: W) -> Result<(W, ObjectId)> {
        let mut ordered: Vec<&(ObjectId, ObjectType)> = objects.iter().collect();
        ordered.sort_by_key(|(_, kind)| send_rank(*kind));

        let count = u32::try_from(ordered.len()).map_err(|_| {
            GitError::protocol(format!("{} objects do not fit in one pack", ordered.len()))
        })?;
        let mut pack = PackWriter::new(writer, self.store.algorithm(), count, self.level)?;
        for (id, _) in ordered {
            let object = self.store.get(id)?;
            pack.write_object(&object)?;
        }
        let (writer, checksum) = pack.finish()?;
        tracing::debug!(objects = count, pack = %checksum, "encoded pack");
        Ok((writer, checksum))
    }
}

fn send_rank(kind: ObjectType) -> u8 {
    match kind {
        ObjectType::Commit => 0,
        ObjectType::Tag => 1,
        ObjectType::Tree => 2,
        ObjectType::Blob => 3,
    }
}
