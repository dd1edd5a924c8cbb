//! Git object types and utilities.

use crate::hash::HashAlgorithm;
use crate::model::Object;
use crate::{Result, StorageError};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A content-addressed object identifier.
///
/// SHA-1 ids are 20 bytes, SHA-256 ids are 32. A repository uses exactly one
/// kind; mixing them is rejected at the protocol layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    /// 20-byte SHA-1 digest.
    Sha1([u8; 20]),
    /// 32-byte SHA-256 digest.
    Sha256([u8; 32]),
}

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl ObjectId {
    /// Creates a SHA-1 ObjectId from raw bytes.
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self::Sha1(bytes)
    }

    /// Creates an ObjectId from a raw digest of either supported length.
    pub fn from_raw(raw: &[u8]) -> Result<Self> {
        match raw.len() {
            20 => {
                let mut bytes = [0u8; 20];
                bytes.copy_from_slice(raw);
                Ok(Self::Sha1(bytes))
            }
            32 => {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(raw);
                Ok(Self::Sha256(bytes))
            }
            n => Err(StorageError::InvalidObject(format!(
                "invalid object id length: {} bytes",
                n
            ))),
        }
    }

    /// Creates an ObjectId from a hex string (40 or 64 digits).
    pub fn from_hex(hex: &str) -> Result<Self> {
        match hex.len() {
            40 => {
                let mut bytes = [0u8; 20];
                hex::decode_to_slice(hex, &mut bytes)
                    .map_err(|e| StorageError::InvalidObject(e.to_string()))?;
                Ok(Self::Sha1(bytes))
            }
            64 => {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(hex, &mut bytes)
                    .map_err(|e| StorageError::InvalidObject(e.to_string()))?;
                Ok(Self::Sha256(bytes))
            }
            n => Err(StorageError::InvalidObject(format!(
                "invalid object id length: {}",
                n
            ))),
        }
    }

    /// Parses a hex id and checks it belongs to `algorithm`.
    pub fn from_hex_with(hex: &str, algorithm: HashAlgorithm) -> Result<Self> {
        let id = Self::from_hex(hex)?;
        if id.algorithm() != algorithm {
            return Err(StorageError::InvalidObject(format!(
                "expected a {} object id, got {}",
                algorithm, hex
            )));
        }
        Ok(id)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Sha1(bytes) => bytes,
            Self::Sha256(bytes) => bytes,
        }
    }

    /// Returns the hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// The hash function that produced this id.
    pub fn algorithm(&self) -> HashAlgorithm {
        match self {
            Self::Sha1(_) => HashAlgorithm::Sha1,
            Self::Sha256(_) => HashAlgorithm::Sha256,
        }
    }

    /// The all-zero id for `algorithm`.
    pub fn null(algorithm: HashAlgorithm) -> Self {
        algorithm.null_id()
    }

    /// True for the all-zero id.
    pub fn is_null(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }

    /// First byte, used for loose fan-out directories and index fan-out.
    pub fn first_byte(&self) -> u8 {
        self.as_bytes()[0]
    }

    /// Computes the id of data with a git object header.
    pub fn hash_object(algorithm: HashAlgorithm, object_type: ObjectType, data: &[u8]) -> Self {
        let header = format!("{} {}\0", object_type.as_str(), data.len());
        let mut hasher = algorithm.hasher();
        hasher.update(header.as_bytes());
        hasher.update(data);
        hasher.finalize()
    }
}

impl FromStr for ObjectId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Git object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// File content.
    Blob,
    /// Directory listing.
    Tree,
    /// Commit object.
    Commit,
    /// Annotated tag.
    Tag,
}

impl ObjectType {
    /// Returns the string representation used in git.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
            Self::Tag => "tag",
        }
    }

    /// Parses an object type from a string.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "blob" => Ok(Self::Blob),
            "tree" => Ok(Self::Tree),
            "commit" => Ok(Self::Commit),
            "tag" => Ok(Self::Tag),
            _ => Err(StorageError::InvalidObject(format!(
                "unknown object type: {}",
                s
            ))),
        }
    }

    /// Returns the type code used in pack files.
    pub fn pack_type(&self) -> u8 {
        match self {
            Self::Commit => 1,
            Self::Tree => 2,
            Self::Blob => 3,
            Self::Tag => 4,
        }
    }

    /// Parses an object type from a pack file type code.
    pub fn from_pack_type(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Commit),
            2 => Ok(Self::Tree),
            3 => Ok(Self::Blob),
            4 => Ok(Self::Tag),
            _ => Err(StorageError::InvalidObject(format!(
                "unknown pack type: {}",
                code
            ))),
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A git object (blob, tree, commit, or tag) in its raw form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitObject {
    /// The object's content hash.
    pub id: ObjectId,
    /// The type of object.
    pub object_type: ObjectType,
    /// The raw object data (uncompressed, without the header).
    pub data: Bytes,
}

impl GitObject {
    /// Creates a new SHA-1 git object, computing its ID from the data.
    pub fn new(object_type: ObjectType, data: impl Into<Bytes>) -> Self {
        Self::with_algorithm(HashAlgorithm::Sha1, object_type, data)
    }

    /// Creates a new git object hashed with `algorithm`.
    pub fn with_algorithm(
        algorithm: HashAlgorithm,
        object_type: ObjectType,
        data: impl Into<Bytes>,
    ) -> Self {
        let data = data.into();
        let id = ObjectId::hash_object(algorithm, object_type, &data);
        Self {
            id,
            object_type,
            data,
        }
    }

    /// Assembles an object whose id is already known.
    ///
    /// Used by readers that located the object by id; call [`verify`](Self::verify)
    /// when the bytes come from an untrusted source.
    pub fn from_parts(id: ObjectId, object_type: ObjectType, data: Bytes) -> Self {
        Self {
            id,
            object_type,
            data,
        }
    }

    /// Recomputes the id and fails with `Corruption` on mismatch.
    pub fn verify(&self) -> Result<()> {
        let actual = ObjectId::hash_object(self.id.algorithm(), self.object_type, &self.data);
        if actual != self.id {
            return Err(StorageError::Corruption(format!(
                "object {} hashes to {}",
                self.id, actual
            )));
        }
        Ok(())
    }

    /// Creates a blob object from file content.
    pub fn blob(content: impl Into<Bytes>) -> Self {
        Self::new(ObjectType::Blob, content)
    }

    /// Creates a commit object.
    pub fn commit(
        tree_id: &ObjectId,
        parents: &[ObjectId],
        author: &str,
        committer: &str,
        message: &str,
    ) -> Self {
        let mut content = format!("tree {}\n", tree_id);
        for parent in parents {
            content.push_str(&format!("parent {}\n", parent));
        }
        content.push_str(&format!("author {}\n", author));
        content.push_str(&format!("committer {}\n", committer));
        content.push_str(&format!("\n{}", message));
        Self::with_algorithm(tree_id.algorithm(), ObjectType::Commit, content.into_bytes())
    }

    /// Returns the size of the object data.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Parses the raw data into the structured object model.
    pub fn parse(&self) -> Result<Object> {
        Object::parse(self.object_type, self.data.clone(), self.id.algorithm())
    }
}
