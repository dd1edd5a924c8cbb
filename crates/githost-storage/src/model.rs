//! Parsed git objects.
//!
//! [`GitObject`](crate::GitObject) carries the exact bytes that were hashed;
//! [`Object`] is the structured view used for reachability and inspection.
//! Objects only refer to each other by [`ObjectId`].

use crate::hash::HashAlgorithm;
use crate::{ObjectId, ObjectType, Result, StorageError};
use bytes::Bytes;
use smallvec::SmallVec;
use std::fmt;

/// A parsed git object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    /// Opaque file content.
    Blob(Bytes),
    /// Directory listing.
    Tree(Tree),
    /// Commit.
    Commit(Commit),
    /// Annotated tag.
    Tag(Tag),
}

impl Object {
    /// Parses raw object data of the given type.
    pub fn parse(kind: ObjectType, data: Bytes, algorithm: HashAlgorithm) -> Result<Self> {
        match kind {
            ObjectType::Blob => Ok(Self::Blob(data)),
            ObjectType::Tree => Tree::parse(&data, algorithm).map(Self::Tree),
            ObjectType::Commit => Commit::parse(&data, algorithm).map(Self::Commit),
            ObjectType::Tag => Tag::parse(&data, algorithm).map(Self::Tag),
        }
    }

    /// Serializes back to raw object data.
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Blob(data) => data.clone(),
            Self::Tree(tree) => tree.encode().into(),
            Self::Commit(commit) => commit.encode().into(),
            Self::Tag(tag) => tag.encode().into(),
        }
    }

    /// The object's type.
    pub fn object_type(&self) -> ObjectType {
        match self {
            Self::Blob(_) => ObjectType::Blob,
            Self::Tree(_) => ObjectType::Tree,
            Self::Commit(_) => ObjectType::Commit,
            Self::Tag(_) => ObjectType::Tag,
        }
    }

    /// Objects this one points at, with their expected types.
    ///
    /// Gitlink (submodule) entries are skipped: they name commits in another
    /// repository.
    pub fn children(&self) -> Vec<(ObjectId, ObjectType)> {
        match self {
            Self::Blob(_) => Vec::new(),
            Self::Tree(tree) => tree
                .entries
                .iter()
                .filter(|e| !e.mode.is_gitlink())
                .map(|e| (e.id, e.mode.object_type()))
                .collect(),
            Self::Commit(commit) => {
                let mut out = Vec::with_capacity(commit.parents.len() + 1);
                out.push((commit.tree, ObjectType::Tree));
                out.extend(commit.parents.iter().map(|p| (*p, ObjectType::Commit)));
                out
            }
            Self::Tag(tag) => vec![(tag.target, tag.target_type)],
        }
    }
}

/// File mode of a tree entry, stored as the octal number git writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryMode(pub u32);

impl EntryMode {
    /// Subdirectory.
    pub const TREE: Self = Self(0o40000);
    /// Regular file.
    pub const BLOB: Self = Self(0o100644);
    /// Executable file.
    pub const BLOB_EXECUTABLE: Self = Self(0o100755);
    /// Symbolic link.
    pub const SYMLINK: Self = Self(0o120000);
    /// Submodule commit.
    pub const GITLINK: Self = Self(0o160000);

    /// True for submodule entries.
    pub fn is_gitlink(self) -> bool {
        self.0 & 0o170000 == 0o160000
    }

    /// True for subdirectories.
    pub fn is_tree(self) -> bool {
        self.0 & 0o170000 == 0o040000
    }

    /// Type of the object the entry names.
    pub fn object_type(self) -> ObjectType {
        if self.is_tree() {
            ObjectType::Tree
        } else if self.is_gitlink() {
            ObjectType::Commit
        } else {
            ObjectType::Blob
        }
    }
}

impl fmt::Display for EntryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:o}", self.0)
    }
}

/// One entry of a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// File mode.
    pub mode: EntryMode,
    /// Path component (arbitrary bytes, no `/` or NUL).
    pub name: Vec<u8>,
    /// Target object.
    pub id: ObjectId,
}

impl TreeEntry {
    /// Type of the referenced object.
    pub fn kind(&self) -> ObjectType {
        self.mode.object_type()
    }
}

/// A tree: an ordered list of entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    /// Entries in stored order.
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    fn parse(data: &[u8], algorithm: HashAlgorithm) -> Result<Self> {
        let id_len = algorithm.digest_len();
        let mut entries = Vec::new();
        let mut rest = data;
        while !rest.is_empty() {
            let space = rest
                .iter()
                .position(|b| *b == b' ')
                .ok_or_else(|| invalid("tree entry without mode"))?;
            let mode_str = std::str::from_utf8(&rest[..space])
                .map_err(|_| invalid("tree entry mode is not ascii"))?;
            let mode = u32::from_str_radix(mode_str, 8)
                .map_err(|_| invalid("tree entry mode is not octal"))?;
            rest = &rest[space + 1..];

            let nul = rest
                .iter()
                .position(|b| *b == 0)
                .ok_or_else(|| invalid("tree entry name not terminated"))?;
            let name = rest[..nul].to_vec();
            if name.is_empty() {
                return Err(invalid("tree entry with empty name"));
            }
            rest = &rest[nul + 1..];

            if rest.len() < id_len {
                return Err(invalid("tree entry id truncated"));
            }
            let id = ObjectId::from_raw(&rest[..id_len])?;
            rest = &rest[id_len..];

            entries.push(TreeEntry {
                mode: EntryMode(mode),
                name,
                id,
            });
        }
        Ok(Self { entries })
    }

    /// Serializes the tree in git's binary format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &self.entries {
            out.extend_from_slice(entry.mode.to_string().as_bytes());
            out.push(b' ');
            out.extend_from_slice(&entry.name);
            out.push(0);
            out.extend_from_slice(entry.id.as_bytes());
        }
        out
    }
}

/// A commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Root tree.
    pub tree: ObjectId,
    /// Parent commits; most commits have one or two.
    pub parents: SmallVec<[ObjectId; 2]>,
    /// Author line (`Name <email> time tz`).
    pub author: Bytes,
    /// Committer line.
    pub committer: Bytes,
    /// Headers after `committer` (`encoding`, `gpgsig`, `mergetag`, ...).
    /// Multi-line values are stored with plain `\n` separators.
    pub extra_headers: Vec<(Bytes, Bytes)>,
    /// Everything after the blank line.
    pub message: Bytes,
}

impl Commit {
    fn parse(data: &[u8], algorithm: HashAlgorithm) -> Result<Self> {
        let (headers, message) = split_headers(data)?;
        let mut tree = None;
        let mut parents = SmallVec::new();
        let mut author = None;
        let mut committer = None;
        let mut extra_headers = Vec::new();

        for (key, value) in headers {
            match key.as_ref() {
                b"tree" if tree.is_none() => tree = Some(parse_hex_id(&value, algorithm)?),
                b"parent" => parents.push(parse_hex_id(&value, algorithm)?),
                b"author" if author.is_none() => author = Some(value),
                b"committer" if committer.is_none() => committer = Some(value),
                _ => extra_headers.push((key, value)),
            }
        }

        Ok(Self {
            tree: tree.ok_or_else(|| invalid("commit without tree"))?,
            parents,
            author: author.ok_or_else(|| invalid("commit without author"))?,
            committer: committer.ok_or_else(|| invalid("commit without committer"))?,
            extra_headers,
            message: Bytes::copy_from_slice(message),
        })
    }

    /// Serializes the commit in git's text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_header(&mut out, b"tree", self.tree.to_hex().as_bytes());
        for parent in &self.parents {
            write_header(&mut out, b"parent", parent.to_hex().as_bytes());
        }
        write_header(&mut out, b"author", &self.author);
        write_header(&mut out, b"committer", &self.committer);
        for (key, value) in &self.extra_headers {
            write_header(&mut out, key, value);
        }
        out.push(b'\n');
        out.extend_from_slice(&self.message);
        out
    }
}

/// An annotated tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Tagged object.
    pub target: ObjectId,
    /// Type of the tagged object.
    pub target_type: ObjectType,
    /// Tag name.
    pub name: Bytes,
    /// Tagger line; very old tags lack one.
    pub tagger: Option<Bytes>,
    /// Everything after the blank line (including any signature).
    pub message: Bytes,
}

impl Tag {
    fn parse(data: &[u8], algorithm: HashAlgorithm) -> Result<Self> {
        let (headers, message) = split_headers(data)?;
        let mut target = None;
        let mut target_type = None;
        let mut name = None;
        let mut tagger = None;

        for (key, value) in headers {
            match key.as_ref() {
                b"object" => target = Some(parse_hex_id(&value, algorithm)?),
                b"type" => {
                    let s = std::str::from_utf8(&value)
                        .map_err(|_| invalid("tag type is not ascii"))?;
                    target_type = Some(ObjectType::parse(s)?);
                }
                b"tag" => name = Some(value),
                b"tagger" => tagger = Some(value),
                _ => {}
            }
        }

        Ok(Self {
            target: target.ok_or_else(|| invalid("tag without object"))?,
            target_type: target_type.ok_or_else(|| invalid("tag without type"))?,
            name: name.ok_or_else(|| invalid("tag without name"))?,
            tagger,
            message: Bytes::copy_from_slice(message),
        })
    }

    /// Serializes the tag in git's text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_header(&mut out, b"object", self.target.to_hex().as_bytes());
        write_header(&mut out, b"type", self.target_type.as_str().as_bytes());
        write_header(&mut out, b"tag", &self.name);
        if let Some(tagger) = &self.tagger {
            write_header(&mut out, b"tagger", tagger);
        }
        out.push(b'\n');
        out.extend_from_slice(&self.message);
        out
    }
}

fn invalid(msg: &str) -> StorageError {
    StorageError::InvalidObject(msg.to_string())
}

fn parse_hex_id(value: &[u8], algorithm: HashAlgorithm) -> Result<ObjectId> {
    let s = std::str::from_utf8(value).map_err(|_| invalid("object id is not ascii"))?;
    ObjectId::from_hex_with(s, algorithm)
}

/// Splits a commit/tag body into headers and the message.
///
/// A line starting with a space continues the previous header's value.
fn split_headers(data: &[u8]) -> Result<(Vec<(Bytes, Bytes)>, &[u8])> {
    let mut headers: Vec<(Bytes, Vec<u8>)> = Vec::new();
    let mut rest = data;

    loop {
        if rest.is_empty() {
            // No blank line: headers only, empty message.
            break;
        }
        let eol = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| invalid("header line not terminated"))?;
        let line = &rest[..eol];
        rest = &rest[eol + 1..];

        if line.is_empty() {
            break;
        }
        if let Some(cont) = line.strip_prefix(b" ") {
            let (_, value) = headers
                .last_mut()
                .ok_or_else(|| invalid("continuation line without header"))?;
            value.push(b'\n');
            value.extend_from_slice(cont);
            continue;
        }
        let space = line
            .iter()
            .position(|b| *b == b' ')
            .ok_or_else(|| invalid("header line without value"))?;
        headers.push((
            Bytes::copy_from_slice(&line[..space]),
            line[space + 1..].to_vec(),
        ));
    }

    let headers = headers
        .into_iter()
        .map(|(k, v)| (k, Bytes::from(v)))
        .collect();
    Ok((headers, rest))
}

fn write_header(out: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    out.extend_from_slice(key);
    out.push(b' ');
    for (i, line) in value.split(|b| *b == b'\n').enumerate() {
        if i > 0 {
            out.extend_from_slice(b"\n ");
        }
        out.extend_from_slice(line);
    }
    out.push(b'\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GitObject;

    fn sha1(byte: u8) -> ObjectId {
        ObjectId::from_bytes([byte; 20])
    }

    #[test]
    fn test_tree_roundtrip() {
        let tree = Tree {
            entries: vec![
                TreeEntry {
                    mode: EntryMode::BLOB,
                    name: b"README.md".to_vec(),
                    id: sha1(1),
                },
                TreeEntry {
                    mode: EntryMode::TREE,
                    name: b"src".to_vec(),
                    id: sha1(2),
                },
            ],
        };
        let encoded = tree.encode();
        assert!(encoded.starts_with(b"100644 README.md\0"));
        // Directories are written without a leading zero.
        assert!(encoded.windows(8).any(|w| w == b"40000 sr"));

        let parsed = Tree::parse(&encoded, HashAlgorithm::Sha1).unwrap();
        assert_eq!(parsed, tree);
    }

    #[test]
    fn test_tree_children_skip_gitlinks() {
        let tree = Object::Tree(Tree {
            entries: vec![
                TreeEntry {
                    mode: EntryMode::GITLINK,
                    name: b"vendor".to_vec(),
                    id: sha1(9),
                },
                TreeEntry {
                    mode: EntryMode::BLOB_EXECUTABLE,
                    name: b"run.sh".to_vec(),
                    id: sha1(3),
                },
            ],
        });
        assert_eq!(tree.children(), vec![(sha1(3), ObjectType::Blob)]);
    }

    #[test]
    fn test_truncated_tree_is_rejected() {
        let mut data = b"100644 a\0".to_vec();
        data.extend_from_slice(&[1u8; 10]);
        assert!(Tree::parse(&data, HashAlgorithm::Sha1).is_err());
        assert!(Tree::parse(b"100644 a", HashAlgorithm::Sha1).is_err());
        assert!(Tree::parse(b"9x9 a\0", HashAlgorithm::Sha1).is_err());
    }

    #[test]
    fn test_commit_parse() {
        let tree = sha1(1);
        let parent = sha1(2);
        let raw = GitObject::commit(
            &tree,
            &[parent],
            "Alice <alice@example.com> 1234567890 +0000",
            "Bob <bob@example.com> 1234567890 +0000",
            "Initial commit\n",
        );

        let Object::Commit(commit) = raw.parse().unwrap() else {
            panic!("expected a commit");
        };
        assert_eq!(commit.tree, tree);
        assert_eq!(commit.parents.as_slice(), &[parent]);
        assert_eq!(&commit.author[..], b"Alice <alice@example.com> 1234567890 +0000");
        assert_eq!(&commit.message[..], b"Initial commit\n");
        assert_eq!(commit.encode(), raw.data.to_vec());
        assert_eq!(
            Object::Commit(commit).children(),
            vec![(tree, ObjectType::Tree), (parent, ObjectType::Commit)]
        );
    }

    #[test]
    fn test_commit_with_signature_roundtrips() {
        let raw = format!(
            "tree {}\nauthor A <a@x> 1 +0000\ncommitter A <a@x> 1 +0000\ngpgsig -----BEGIN-----\n line one\n -----END-----\n\nsigned\n",
            sha1(1)
        );
        let commit = Commit::parse(raw.as_bytes(), HashAlgorithm::Sha1).unwrap();
        assert_eq!(commit.extra_headers.len(), 1);
        assert_eq!(
            &commit.extra_headers[0].1[..],
            b"-----BEGIN-----\nline one\n-----END-----"
        );
        assert_eq!(commit.encode(), raw.as_bytes());
    }

    #[test]
    fn test_commit_missing_tree() {
        let raw = b"author A <a@x> 1 +0000\ncommitter A <a@x> 1 +0000\n\nmsg";
        assert!(Commit::parse(raw, HashAlgorithm::Sha1).is_err());
    }

    #[test]
    fn test_commit_rejects_foreign_id_length() {
        let raw = format!(
            "tree {}\nauthor A <a@x> 1 +0000\ncommitter A <a@x> 1 +0000\n\nmsg",
            "ab".repeat(32)
        );
        assert!(Commit::parse(raw.as_bytes(), HashAlgorithm::Sha1).is_err());
        assert!(Commit::parse(raw.as_bytes(), HashAlgorithm::Sha256).is_ok());
    }

    #[test]
    fn test_tag_roundtrip() {
        let tag = Tag {
            target: sha1(7),
            target_type: ObjectType::Commit,
            name: Bytes::from_static(b"v1.0.0"),
            tagger: Some(Bytes::from_static(b"Carol <carol@example.com> 1700000000 +0100")),
            message: Bytes::from_static(b"Release 1.0\n"),
        };
        let encoded = tag.encode();
        let parsed = Object::parse(ObjectType::Tag, encoded.into(), HashAlgorithm::Sha1).unwrap();
        assert_eq!(parsed.children(), vec![(sha1(7), ObjectType::Commit)]);
        assert_eq!(parsed, Object::Tag(tag));
    }

    #[test]
    fn test_tag_without_tagger() {
        let raw = format!("object {}\ntype blob\ntag old\n\nancient\n", sha1(4));
        let Object::Tag(tag) =
            Object::parse(ObjectType::Tag, raw.into(), HashAlgorithm::Sha1).unwrap()
        else {
            panic!("expected a tag");
        };
        assert!(tag.tagger.is_none());
        assert_eq!(tag.target_type, ObjectType::Blob);
    }

    #[test]
    fn test_blob_has_no_children() {
        let blob = Object::parse(
            ObjectType::Blob,
            Bytes::from_static(b"\0binary"),
            HashAlgorithm::Sha1,
        )
        .unwrap();
        assert!(blob.children().is_empty());
        assert_eq!(&blob.encode()[..], b"\0binary");
    }
}
