//! Object hashing for SHA-1 and SHA-256 repositories.

use crate::ObjectId;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::fmt;
use std::io::{self, Write};

/// The hash function a repository uses to name its objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// 20-byte SHA-1 ids (the git default).
    #[default]
    Sha1,
    /// 32-byte SHA-256 ids (`extensions.objectformat = sha256`).
    Sha256,
}

impl HashAlgorithm {
    /// Length of a raw digest in bytes.
    pub const fn digest_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Length of a hex-encoded digest.
    pub const fn hex_len(self) -> usize {
        self.digest_len() * 2
    }

    /// Name used in git config and the `object-format` capability.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    /// Picks the algorithm from a raw digest length.
    pub fn from_digest_len(len: usize) -> Option<Self> {
        match len {
            20 => Some(Self::Sha1),
            32 => Some(Self::Sha256),
            _ => None,
        }
    }

    /// The all-zero id, used on the wire for "no object".
    pub const fn null_id(self) -> ObjectId {
        match self {
            Self::Sha1 => ObjectId::Sha1([0u8; 20]),
            Self::Sha256 => ObjectId::Sha256([0u8; 32]),
        }
    }

    /// Starts an incremental hash.
    pub fn hasher(self) -> Hasher {
        match self {
            Self::Sha1 => Hasher::Sha1(Sha1::new()),
            Self::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    /// Hashes a single buffer.
    pub fn digest(self, data: &[u8]) -> ObjectId {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Incremental hasher producing an [`ObjectId`].
#[derive(Clone)]
pub enum Hasher {
    /// SHA-1 state.
    Sha1(Sha1),
    /// SHA-256 state.
    Sha256(Sha256),
}

impl Hasher {
    /// Feeds bytes into the hash.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    /// Finishes the hash.
    pub fn finalize(self) -> ObjectId {
        match self {
            Self::Sha1(h) => {
                let mut bytes = [0u8; 20];
                bytes.copy_from_slice(&h.finalize());
                ObjectId::Sha1(bytes)
            }
            Self::Sha256(h) => {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&h.finalize());
                ObjectId::Sha256(bytes)
            }
        }
    }

    /// The algorithm behind this hasher.
    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            Self::Sha1(_) => HashAlgorithm::Sha1,
            Self::Sha256(_) => HashAlgorithm::Sha256,
        }
    }
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hasher({})", self.algorithm())
    }
}

/// Writer that hashes and counts everything passing through it.
///
/// Pack and index writers use this to produce their trailing checksum.
#[derive(Debug)]
pub struct HashingWriter<W> {
    inner: W,
    hasher: Hasher,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    /// Wraps a writer.
    pub fn new(inner: W, algorithm: HashAlgorithm) -> Self {
        Self {
            inner,
            hasher: algorithm.hasher(),
            written: 0,
        }
    }

    /// Number of bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Digest of everything written so far, without consuming the writer.
    pub fn digest(&self) -> ObjectId {
        self.hasher.clone().finalize()
    }

    /// Returns the inner writer and the digest of everything written.
    pub fn into_parts(self) -> (W, ObjectId) {
        (self.inner, self.hasher.finalize())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_of_empty_input() {
        let id = HashAlgorithm::Sha1.digest(b"");
        assert_eq!(id.to_hex(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn sha256_of_empty_input() {
        let id = HashAlgorithm::Sha256.digest(b"");
        assert_eq!(
            id.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn lengths() {
        assert_eq!(HashAlgorithm::Sha1.digest_len(), 20);
        assert_eq!(HashAlgorithm::Sha256.hex_len(), 64);
        assert_eq!(HashAlgorithm::from_digest_len(32), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::from_digest_len(16), None);
    }

    #[test]
    fn hashing_writer_matches_one_shot_digest() {
        let mut writer = HashingWriter::new(Vec::new(), HashAlgorithm::Sha1);
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        assert_eq!(writer.written(), 11);

        let (buf, digest) = writer.into_parts();
        assert_eq!(buf, b"hello world");
        assert_eq!(digest, HashAlgorithm::Sha1.digest(b"hello world"));
    }

    #[test]
    fn algorithm_deserializes_lowercase() {
        let algo: HashAlgorithm = serde_json::from_str("\"sha256\"").unwrap();
        assert_eq!(algo, HashAlgorithm::Sha256);
    }
}
