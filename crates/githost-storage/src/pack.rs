//! Packfile format primitives and an undeltified pack writer.
//!
//! A pack is `PACK`, a big-endian version and object count, the entries, and
//! a trailing digest of everything before it. Each entry starts with a
//! variable-length header carrying the type code and the inflated size.

use crate::compression::CompressionLevel;
use crate::hash::{HashAlgorithm, HashingWriter};
use crate::{GitObject, ObjectId, ObjectType, Result, StorageError};
use flate2::write::ZlibEncoder;
use std::io::{self, Read, Write};

/// Pack signature.
pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";

/// The only pack version this crate reads or writes.
pub const PACK_VERSION: u32 = 2;

/// Signature, version, and object count.
pub const PACK_HEADER_LEN: usize = 12;

/// Longest entry header we accept: 4 bits plus 9 * 7 bits covers a u64.
const MAX_ENTRY_HEADER_BYTES: usize = 10;

/// Longest OFS_DELTA offset encoding.
const MAX_OFS_BYTES: usize = 10;

/// Type of one pack entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Commit (1).
    Commit,
    /// Tree (2).
    Tree,
    /// Blob (3).
    Blob,
    /// Tag (4).
    Tag,
    /// Delta against an earlier entry, by negative offset (6).
    OfsDelta,
    /// Delta against an object named by id (7).
    RefDelta,
}

impl EntryKind {
    /// Maps a type code to an entry kind. 0 and 5 are reserved.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Commit),
            2 => Some(Self::Tree),
            3 => Some(Self::Blob),
            4 => Some(Self::Tag),
            6 => Some(Self::OfsDelta),
            7 => Some(Self::RefDelta),
            _ => None,
        }
    }

    /// The type code written in the entry header.
    pub fn code(self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
            Self::OfsDelta => 6,
            Self::RefDelta => 7,
        }
    }

    /// The object type for non-delta entries.
    pub fn object_type(self) -> Option<ObjectType> {
        match self {
            Self::Commit => Some(ObjectType::Commit),
            Self::Tree => Some(ObjectType::Tree),
            Self::Blob => Some(ObjectType::Blob),
            Self::Tag => Some(ObjectType::Tag),
            Self::OfsDelta | Self::RefDelta => None,
        }
    }
}

impl From<ObjectType> for EntryKind {
    fn from(kind: ObjectType) -> Self {
        match kind {
            ObjectType::Commit => Self::Commit,
            ObjectType::Tree => Self::Tree,
            ObjectType::Blob => Self::Blob,
            ObjectType::Tag => Self::Tag,
        }
    }
}

/// Appends an entry header for `code` and `size`.
pub fn encode_entry_header(code: u8, size: u64, out: &mut Vec<u8>) {
    let mut size = size;
    let mut byte = ((code & 0x07) << 4) | (size & 0x0f) as u8;
    size >>= 4;
    while size > 0 {
        out.push(byte | 0x80);
        byte = (size & 0x7f) as u8;
        size >>= 7;
    }
    out.push(byte);
}

/// Reads an entry header, returning the raw type code and the size.
///
/// The code is returned unvalidated so callers can report which one was bad.
pub fn decode_entry_header<R: Read>(reader: &mut R) -> io::Result<(u8, u64)> {
    let mut byte = read_u8(reader)?;
    let code = (byte >> 4) & 0x07;
    let mut size = (byte & 0x0f) as u64;
    let mut shift = 4u32;
    let mut consumed = 1;
    while byte & 0x80 != 0 {
        if consumed >= MAX_ENTRY_HEADER_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "pack entry header too long",
            ));
        }
        byte = read_u8(reader)?;
        consumed += 1;
        let bits = (byte & 0x7f) as u64;
        if shift >= 64 || (shift > 57 && bits >> (64 - shift) != 0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "pack entry size overflows u64",
            ));
        }
        size |= bits << shift;
        shift += 7;
    }
    Ok((code, size))
}

/// Appends the OFS_DELTA encoding of a backwards distance.
pub fn encode_ofs_distance(distance: u64, out: &mut Vec<u8>) {
    let mut buf = [0u8; MAX_OFS_BYTES];
    let mut pos = buf.len() - 1;
    let mut value = distance;
    buf[pos] = (value & 0x7f) as u8;
    value >>= 7;
    while value > 0 {
        value -= 1;
        pos -= 1;
        buf[pos] = 0x80 | (value & 0x7f) as u8;
        value >>= 7;
    }
    out.extend_from_slice(&buf[pos..]);
}

/// Reads an OFS_DELTA backwards distance.
pub fn decode_ofs_distance<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut byte = read_u8(reader)?;
    let mut value = (byte & 0x7f) as u64;
    let mut consumed = 1;
    while byte & 0x80 != 0 {
        if consumed >= MAX_OFS_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "delta base offset too long",
            ));
        }
        byte = read_u8(reader)?;
        consumed += 1;
        value = value
            .checked_add(1)
            .and_then(|v| v.checked_mul(128))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "delta base offset overflows"))?
            | (byte & 0x7f) as u64;
    }
    Ok(value)
}

fn read_u8<R: Read>(reader: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

/// Where an entry landed in a pack written by [`PackWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackEntryInfo {
    /// Object id.
    pub id: ObjectId,
    /// Byte offset of the entry header.
    pub offset: u64,
    /// CRC32 of the raw entry bytes (header and compressed data).
    pub crc32: u32,
}

/// Streams undeltified objects into a pack.
#[derive(Debug)]
pub struct PackWriter<W: Write> {
    out: HashingWriter<W>,
    algorithm: HashAlgorithm,
    level: CompressionLevel,
    expected: u32,
    written: u32,
}

impl<W: Write> PackWriter<W> {
    /// Writes the pack header announcing `count` objects.
    pub fn new(
        writer: W,
        algorithm: HashAlgorithm,
        count: u32,
        level: CompressionLevel,
    ) -> Result<Self> {
        let mut out = HashingWriter::new(writer, algorithm);
        out.write_all(PACK_SIGNATURE)?;
        out.write_all(&PACK_VERSION.to_be_bytes())?;
        out.write_all(&count.to_be_bytes())?;
        Ok(Self {
            out,
            algorithm,
            level,
            expected: count,
            written: 0,
        })
    }

    /// Appends one object.
    pub fn write_object(&mut self, object: &GitObject) -> Result<PackEntryInfo> {
        if self.written == self.expected {
            return Err(StorageError::InvalidObject(format!(
                "pack already holds the announced {} objects",
                self.expected
            )));
        }
        if object.id.algorithm() != self.algorithm {
            return Err(StorageError::InvalidObject(format!(
                "{} object {} in a {} pack",
                object.id.algorithm(),
                object.id,
                self.algorithm
            )));
        }

        let mut entry = Vec::with_capacity(object.data.len() / 2 + 16);
        encode_entry_header(
            EntryKind::from(object.object_type).code(),
            object.data.len() as u64,
            &mut entry,
        );
        let mut encoder = ZlibEncoder::new(entry, self.level.to_flate2());
        encoder.write_all(&object.data)?;
        let entry = encoder.finish()?;

        let mut crc = flate2::Crc::new();
        crc.update(&entry);

        let offset = self.out.written();
        self.out.write_all(&entry)?;
        self.written += 1;

        Ok(PackEntryInfo {
            id: object.id,
            offset,
            crc32: crc.sum(),
        })
    }

    /// Bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.out.written()
    }

    /// Writes the trailing digest and returns the writer and pack checksum.
    pub fn finish(self) -> Result<(W, ObjectId)> {
        if self.written != self.expected {
            return Err(StorageError::InvalidObject(format!(
                "pack announced {} objects but {} were written",
                self.expected, self.written
            )));
        }
        let (mut inner, checksum) = self.out.into_parts();
        inner.write_all(checksum.as_bytes())?;
        inner.flush()?;
        Ok((inner, checksum))
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    proptest! {
        #[test]
        fn entry_header_roundtrip(code in 1u8..8, size in any::<u64>()) {
            let mut out = Vec::new();
            encode_entry_header(code, size, &mut out);
            prop_assert!(out.len() <= MAX_ENTRY_HEADER_BYTES);
            let decoded = decode_entry_header(&mut Cursor::new(out)).unwrap();
            prop_assert_eq!(decoded, (code, size));
        }

        #[test]
        fn ofs_distance_roundtrip(distance in 1u64..(1u64 << 62)) {
            let mut out = Vec::new();
            encode_ofs_distance(distance, &mut out);
            prop_assert_eq!(decode_ofs_distance(&mut Cursor::new(out)).unwrap(), distance);
        }

        #[test]
        fn decode_entry_header_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..16)) {
            let _ = decode_entry_header(&mut Cursor::new(bytes));
        }
    }
}
