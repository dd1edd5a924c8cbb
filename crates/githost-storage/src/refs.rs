//! Git reference management.
//!
//! Refs are stored the way git stores them: one file per ref under `refs/`
//! holding `<hex>\n`, an optional `packed-refs` file, and a symbolic `HEAD`.
//! Every mutation is a compare-and-swap guarded by an in-process mutex and a
//! `<ref>.lock` file created exclusively, so concurrent updaters of the same
//! ref race and exactly one wins.

use crate::loose::sync_dir;
use crate::{ObjectId, ObjectStore, Result, StorageError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const REFS_PREFIX: &str = "refs/";
const HEADS_PREFIX: &str = "heads/";

/// A validated reference name, stored relative to `refs/` (`heads/main`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefName(String);

impl RefName {
    /// Validates a name given with or without the leading `refs/`.
    pub fn new(name: &str) -> Result<Self> {
        let relative = name.strip_prefix(REFS_PREFIX).unwrap_or(name);
        validate_ref_name(relative)?;
        Ok(Self(relative.to_string()))
    }

    /// The branch `heads/<name>`.
    pub fn branch(name: &str) -> Result<Self> {
        let short = name
            .strip_prefix("refs/heads/")
            .or_else(|| name.strip_prefix(HEADS_PREFIX))
            .unwrap_or(name);
        Self::new(&format!("{}{}", HEADS_PREFIX, short))
    }

    /// Name relative to `refs/`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Full name including `refs/`, as advertised on the wire.
    pub fn full_name(&self) -> String {
        format!("{}{}", REFS_PREFIX, self.0)
    }

    /// Short branch name when this ref lives under `heads/`.
    pub fn branch_name(&self) -> Option<&str> {
        self.0.strip_prefix(HEADS_PREFIX)
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", REFS_PREFIX, self.0)
    }
}

/// Checks a ref name against git's ref-format rules.
pub fn validate_ref_name(name: &str) -> Result<()> {
    let reject = |reason: &'static str| {
        Err(StorageError::InvalidRefName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return reject("empty name");
    }
    if name == "@" {
        return reject("single '@'");
    }
    if name.contains("..") {
        return reject("contains '..'");
    }
    if name.contains("@{") {
        return reject("contains '@{'");
    }
    if name.contains("//") {
        return reject("contains '//'");
    }
    if name.starts_with('/') || name.ends_with('/') {
        return reject("leading or trailing '/'");
    }
    if name.ends_with('.') {
        return reject("trailing '.'");
    }
    for c in name.chars() {
        if c.is_ascii_control() {
            return reject("contains a control character");
        }
        if matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\') {
            return reject("contains a forbidden character");
        }
    }
    for component in name.split('/') {
        if component.starts_with('.') {
            return reject("component starts with '.'");
        }
        if component.ends_with(".lock") {
            return reject("component ends with '.lock'");
        }
    }
    Ok(())
}

/// A git reference (branch, tag, or symbolic ref).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Direct reference to an object.
    Direct(ObjectId),
    /// Symbolic reference (e.g., HEAD -> refs/heads/main).
    Symbolic(String),
}

impl Reference {
    /// Returns the object ID if this is a direct reference.
    pub fn as_direct(&self) -> Option<ObjectId> {
        match self {
            Self::Direct(id) => Some(*id),
            Self::Symbolic(_) => None,
        }
    }

    fn parse(content: &str) -> Result<Self> {
        let line = content.trim_end_matches(['\n', '\r']);
        if let Some(target) = line.strip_prefix("ref: ") {
            return Ok(Self::Symbolic(target.trim().to_string()));
        }
        ObjectId::from_hex(line.trim()).map(Self::Direct)
    }
}

/// A ref's target and the sequence number of its last update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefEntry {
    /// Object the ref points at.
    pub target: ObjectId,
    /// Store-wide sequence of the last write by this process; 0 for refs
    /// loaded from disk.
    pub sequence: u64,
}

/// Outcome of a compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefUpdate {
    /// The ref was written; `sequence` orders it among all mutations.
    Applied {
        /// Store-wide sequence number of this mutation.
        sequence: u64,
    },
    /// The ref did not hold the expected value.
    Conflict {
        /// What the ref held instead.
        current: Option<ObjectId>,
    },
}

impl RefUpdate {
    /// True when the update took effect.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

#[derive(Debug, Default)]
struct RefState {
    sequence: u64,
    written: HashMap<RefName, u64>,
}

/// On-disk reference store for one repository.
#[derive(Debug)]
pub struct RefStore {
    git_dir: PathBuf,
    refs_dir: PathBuf,
    objects: Arc<ObjectStore>,
    fsync: bool,
    state: Mutex<RefState>,
}

impl RefStore {
    /// Opens the refs of the repository at `git_dir`.
    pub fn open(git_dir: impl Into<PathBuf>, objects: Arc<ObjectStore>, fsync: bool) -> Result<Self> {
        let git_dir = git_dir.into();
        let refs_dir = git_dir.join("refs");
        fs::create_dir_all(refs_dir.join("heads"))?;
        fs::create_dir_all(refs_dir.join("tags"))?;
        Ok(Self {
            git_dir,
            refs_dir,
            objects,
            fsync,
            state: Mutex::new(RefState::default()),
        })
    }

    /// Snapshot of every ref, sorted by name.
    pub fn list(&self) -> Result<BTreeMap<RefName, ObjectId>> {
        Ok(self
            .list_entries()?
            .into_iter()
            .map(|(name, entry)| (name, entry.target))
            .collect())
    }

    /// Snapshot of every ref with its update sequence.
    pub fn list_entries(&self) -> Result<BTreeMap<RefName, RefEntry>> {
        let state = self.state.lock();
        let mut refs: BTreeMap<RefName, ObjectId> = self.read_packed()?;

        for entry in walkdir::WalkDir::new(&self.refs_dir).min_depth(1) {
            let entry = entry.map_err(|e| {
                e.into_io_error()
                    .map(StorageError::Io)
                    .unwrap_or_else(|| StorageError::Corruption("ref directory loop".to_string()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.refs_dir) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if relative.ends_with(".lock") {
                continue;
            }
            let Ok(name) = RefName::new(&relative) else {
                tracing::debug!(file = %entry.path().display(), "ignoring malformed ref file");
                continue;
            };
            match read_ref_file(entry.path())? {
                Some(Reference::Direct(id)) => {
                    refs.insert(name, id);
                }
                Some(Reference::Symbolic(target)) => {
                    tracing::debug!(name = %name, target = %target, "skipping symbolic ref in listing");
                }
                None => {}
            }
        }

        Ok(refs
            .into_iter()
            .map(|(name, target)| {
                let sequence = state.written.get(&name).copied().unwrap_or(0);
                (name, RefEntry { target, sequence })
            })
            .collect())
    }

    /// Lists refs whose relative name starts with `prefix` (e.g. `tags/`).
    pub fn list_prefix(&self, prefix: &str) -> Result<BTreeMap<RefName, ObjectId>> {
        let prefix = prefix.strip_prefix(REFS_PREFIX).unwrap_or(prefix);
        Ok(self
            .list()?
            .into_iter()
            .filter(|(name, _)| name.as_str().starts_with(prefix))
            .collect())
    }

    /// Gets the target of a ref.
    pub fn get(&self, name: &str) -> Result<ObjectId> {
        Ok(self.get_entry(name)?.target)
    }

    /// Gets a ref's target and update sequence.
    pub fn get_entry(&self, name: &str) -> Result<RefEntry> {
        let name = RefName::new(name)?;
        let state = self.state.lock();
        let target = self
            .read_ref(&name)?
            .ok_or_else(|| StorageError::RefNotFound(name.full_name()))?;
        Ok(RefEntry {
            target,
            sequence: state.written.get(&name).copied().unwrap_or(0),
        })
    }

    /// Points `name` at `new` if it currently holds `expected_old`.
    ///
    /// `expected_old = None` means the ref must not exist yet. `new` must be
    /// present in the object store. A mismatch is reported as
    /// [`RefUpdate::Conflict`], not as an error.
    pub fn compare_and_swap(
        &self,
        name: &str,
        expected_old: Option<ObjectId>,
        new: ObjectId,
    ) -> Result<RefUpdate> {
        let name = RefName::new(name)?;
        if !self.objects.exists(&new) {
            return Err(StorageError::ObjectNotFound(new.to_hex()));
        }

        let mut state = self.state.lock();
        let path = self.ref_path(&name);
        let lock = RefLock::acquire(&path, &name)?;

        let current = self.read_ref(&name)?;
        if current != expected_old {
            tracing::debug!(name = %name, ?expected_old, ?current, "ref update conflict");
            return Ok(RefUpdate::Conflict { current });
        }

        lock.commit(format!("{}\n", new.to_hex()).as_bytes(), self.fsync)?;
        state.sequence += 1;
        let sequence = state.sequence;
        state.written.insert(name.clone(), sequence);
        tracing::debug!(name = %name, target = %new, sequence, "ref updated");
        Ok(RefUpdate::Applied { sequence })
    }

    /// Deletes `name` if it currently holds `expected_old`.
    ///
    /// `expected_old = None` deletes unconditionally; the ref must exist
    /// (`RefNotFound` otherwise).
    pub fn delete(&self, name: &str, expected_old: Option<ObjectId>) -> Result<RefUpdate> {
        let name = RefName::new(name)?;
        let mut state = self.state.lock();
        let path = self.ref_path(&name);
        let lock = RefLock::acquire(&path, &name)?;

        let current = self.read_ref(&name)?;
        match (expected_old, current) {
            (None, None) => return Err(StorageError::RefNotFound(name.full_name())),
            (Some(expected), current) if current != Some(expected) => {
                return Ok(RefUpdate::Conflict { current });
            }
            _ => {}
        }

        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.remove_packed(&name)?;
        drop(lock);
        self.prune_empty_dirs(&path);

        state.sequence += 1;
        let sequence = state.sequence;
        state.written.remove(&name);
        tracing::debug!(name = %name, sequence, "ref deleted");
        Ok(RefUpdate::Applied { sequence })
    }

    /// Reads `HEAD`.
    pub fn head(&self) -> Result<Reference> {
        read_ref_file(&self.git_dir.join("HEAD"))?
            .ok_or_else(|| StorageError::RefNotFound("HEAD".to_string()))
    }

    /// Resolves `HEAD` to a commit id. Fails `RefNotFound` on an unborn branch.
    pub fn resolve_head(&self) -> Result<ObjectId> {
        match self.head()? {
            Reference::Direct(id) => Ok(id),
            Reference::Symbolic(target) => self.get(&target),
        }
    }

    /// Points `HEAD` at a branch (`main`, `heads/main` or `refs/heads/main`).
    pub fn set_head(&self, branch: &str) -> Result<()> {
        let name = RefName::branch(branch)?;
        let _state = self.state.lock();
        let path = self.git_dir.join("HEAD");
        let lock = RefLock::acquire(&path, &name)?;
        lock.commit(format!("ref: {}\n", name.full_name()).as_bytes(), self.fsync)
    }

    /// Gets the current branch name (if HEAD is symbolic).
    pub fn current_branch(&self) -> Option<String> {
        match self.head().ok()? {
            Reference::Symbolic(target) => target
                .strip_prefix("refs/heads/")
                .map(|s| s.to_string()),
            Reference::Direct(_) => None,
        }
    }

    /// Creates a branch; fails with a conflict if it already exists.
    pub fn create_branch(&self, branch: &str, target: ObjectId) -> Result<RefUpdate> {
        let name = RefName::branch(branch)?;
        self.compare_and_swap(name.as_str(), None, target)
    }

    /// Lists branches by short name.
    pub fn list_branches(&self) -> Result<Vec<(String, ObjectId)>> {
        Ok(self
            .list()?
            .into_iter()
            .filter_map(|(name, id)| name.branch_name().map(|b| (b.to_string(), id)))
            .collect())
    }

    /// Deletes a branch unconditionally.
    pub fn delete_branch(&self, branch: &str) -> Result<RefUpdate> {
        let name = RefName::branch(branch)?;
        self.delete(name.as_str(), None)
    }

    fn ref_path(&self, name: &RefName) -> PathBuf {
        self.refs_dir.join(name.as_str())
    }

    /// Loose file first, then packed-refs.
    fn read_ref(&self, name: &RefName) -> Result<Option<ObjectId>> {
        match read_ref_file(&self.ref_path(name))? {
            Some(Reference::Direct(id)) => return Ok(Some(id)),
            Some(Reference::Symbolic(target)) => {
                return Err(StorageError::Corruption(format!(
                    "{} is a symbolic ref to {}",
                    name, target
                )))
            }
            None => {}
        }
        Ok(self.read_packed()?.get(name).copied())
    }

    fn packed_refs_path(&self) -> PathBuf {
        self.git_dir.join("packed-refs")
    }

    fn read_packed(&self) -> Result<BTreeMap<RefName, ObjectId>> {
        let content = match fs::read_to_string(self.packed_refs_path()) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let mut refs = BTreeMap::new();
        for line in content.lines() {
            if line.starts_with('#') || line.starts_with('^') || line.is_empty() {
                continue;
            }
            let Some((hex, name)) = line.split_once(' ') else {
                continue;
            };
            match (ObjectId::from_hex(hex), RefName::new(name)) {
                (Ok(id), Ok(name)) => {
                    refs.insert(name, id);
                }
                _ => tracing::warn!(line, "ignoring malformed packed-refs line"),
            }
        }
        Ok(refs)
    }

    /// Drops `name` (and its peeled line) from packed-refs, if listed.
    fn remove_packed(&self, name: &RefName) -> Result<()> {
        let path = self.packed_refs_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let full = name.full_name();
        let mut kept = String::with_capacity(content.len());
        let mut removed = false;
        let mut skip_peeled = false;
        for line in content.lines() {
            if line.starts_with('^') && skip_peeled {
                continue;
            }
            skip_peeled = false;
            if line.split_once(' ').map(|(_, n)| n) == Some(full.as_str()) {
                removed = true;
                skip_peeled = true;
                continue;
            }
            kept.push_str(line);
            kept.push('\n');
        }
        if !removed {
            return Ok(());
        }

        let lock = RefLock::acquire(&path, name)?;
        lock.commit(kept.as_bytes(), self.fsync)
    }

    /// Removes now-empty directories between the deleted ref and `refs/<top>`.
    fn prune_empty_dirs(&self, ref_path: &Path) {
        let mut dir = ref_path.parent();
        while let Some(current) = dir {
            if current.parent() == Some(self.refs_dir.as_path()) || current == self.refs_dir {
                break;
            }
            if fs::remove_dir(current).is_err() {
                break;
            }
            dir = current.parent();
        }
    }
}

fn read_ref_file(path: &Path) -> Result<Option<Reference>> {
    match fs::read_to_string(path) {
        Ok(content) => Reference::parse(&content).map(Some).map_err(|_| {
            StorageError::Corruption(format!("unreadable ref file {}", path.display()))
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        // A directory where a ref would be (`heads/a` vs `heads/a/b`).
        Err(e) if path.is_dir() => {
            tracing::debug!(path = %path.display(), error = %e, "ref path is a directory");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// An exclusively created `<path>.lock` file.
///
/// Committing renames it over the target; dropping it uncommitted removes it.
#[derive(Debug)]
struct RefLock {
    lock_path: PathBuf,
    target: PathBuf,
    file: File,
    committed: bool,
}

impl RefLock {
    fn acquire(target: &Path, name: &RefName) -> Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| StorageError::Corruption(format!("bad ref path {}", target.display())))?;
        fs::create_dir_all(parent)?;

        let mut lock_name = target.as_os_str().to_owned();
        lock_name.push(".lock");
        let lock_path = PathBuf::from(lock_name);
        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StorageError::Locked(name.full_name()))
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            lock_path,
            target: target.to_path_buf(),
            file,
            committed: false,
        })
    }

    fn commit(mut self, contents: &[u8], fsync: bool) -> Result<()> {
        self.file.write_all(contents)?;
        if fsync {
            self.file.sync_all()?;
        }
        fs::rename(&self.lock_path, &self.target)?;
        self.committed = true;
        if fsync {
            if let Some(parent) = self.target.parent() {
                sync_dir(parent)?;
            }
        }
        Ok(())
    }
}

impl Drop for RefLock {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}
