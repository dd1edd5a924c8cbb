//! Bare repositories on disk.

use crate::config::StorageConfig;
use crate::hash::HashAlgorithm;
use crate::refs::RefUpdate;
use crate::{GitObject, ObjectId, ObjectStore, RefStore, Result, StorageError};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_BRANCH: &str = "main";
const DESCRIPTION: &str = "Unnamed repository; edit this file 'description' to name the repository.\n";

/// A bare git repository with objects and references.
#[derive(Debug)]
pub struct Repository {
    /// Opaque key the caller uses for this repository (e.g. `owner/name`).
    pub key: String,
    /// Object store.
    pub objects: Arc<ObjectStore>,
    /// Reference store.
    pub refs: Arc<RefStore>,
    path: PathBuf,
}

impl Repository {
    /// Creates a new empty bare repository at `path`.
    ///
    /// Fails with `RepoExists` if a repository is already there.
    pub fn init(path: impl Into<PathBuf>, key: impl Into<String>, config: &StorageConfig) -> Result<Self> {
        let path = path.into();
        if Self::is_valid(&path) {
            return Err(StorageError::RepoExists(path));
        }

        fs::create_dir_all(&path)?;
        create_config(&path, config.hash_algorithm)?;
        create_description(&path)?;
        create_head(&path)?;
        create_info_dir(&path)?;
        create_objects_dir(&path)?;
        create_refs_dir(&path)?;

        let key = key.into();
        tracing::info!(repo = %key, path = %path.display(), algorithm = %config.hash_algorithm, "initialized repository");
        Self::open(path, key, config)
    }

    /// Opens an existing repository. The object format recorded in the
    /// repository's `config` wins over `config.hash_algorithm`.
    pub fn open(path: impl Into<PathBuf>, key: impl Into<String>, config: &StorageConfig) -> Result<Self> {
        let path = path.into();
        if !Self::is_valid(&path) {
            return Err(StorageError::RepoNotFound(path));
        }

        let config = StorageConfig {
            hash_algorithm: read_object_format(&path)?,
            ..config.clone()
        };
        let objects = Arc::new(ObjectStore::open(path.join("objects"), &config)?);
        let refs = Arc::new(RefStore::open(&path, Arc::clone(&objects), config.fsync)?);

        Ok(Self {
            key: key.into(),
            objects,
            refs,
            path,
        })
    }

    /// True when `path` looks like a bare repository.
    pub fn is_valid(path: &Path) -> bool {
        path.join("HEAD").is_file() && path.join("objects").is_dir() && path.join("refs").is_dir()
    }

    /// The repository directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The repository's object format.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.objects.algorithm()
    }

    /// Records a commit on the current branch and advances it.
    ///
    /// The parent is the branch's current tip, if any. Fails with `Locked`
    /// if the branch moved underneath.
    pub fn commit(
        &self,
        tree_id: &ObjectId,
        message: &str,
        author: &str,
        committer: &str,
    ) -> Result<ObjectId> {
        let branch = self
            .refs
            .current_branch()
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string());
        let branch_ref = format!("heads/{}", branch);
        let parent = match self.refs.get(&branch_ref) {
            Ok(id) => Some(id),
            Err(StorageError::RefNotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let parents: Vec<ObjectId> = parent.into_iter().collect();
        let commit = GitObject::commit(tree_id, &parents, author, committer, message);
        let commit_id = self.objects.put_object(&commit)?;

        match self.refs.compare_and_swap(&branch_ref, parent, commit_id)? {
            RefUpdate::Applied { .. } => Ok(commit_id),
            RefUpdate::Conflict { .. } => Err(StorageError::Locked(format!("refs/{}", branch_ref))),
        }
    }
}

fn create_config(git_dir: &Path, algorithm: HashAlgorithm) -> Result<()> {
    let config_txt = match algorithm {
        HashAlgorithm::Sha1 => "[core]\n\trepositoryformatversion = 0\n\tfilemode = true\n\tbare = true\n".to_string(),
        HashAlgorithm::Sha256 => format!(
            "[core]\n\trepositoryformatversion = 1\n\tfilemode = true\n\tbare = true\n[extensions]\n\tobjectformat = {}\n",
            algorithm.name()
        ),
    };
    fs::write(git_dir.join("config"), config_txt)?;
    Ok(())
}

fn create_description(git_dir: &Path) -> Result<()> {
    fs::write(git_dir.join("description"), DESCRIPTION)?;
    Ok(())
}

fn create_head(git_dir: &Path) -> Result<()> {
    fs::write(git_dir.join("HEAD"), format!("ref: refs/heads/{}\n", DEFAULT_BRANCH))?;
    Ok(())
}

fn create_info_dir(git_dir: &Path) -> Result<()> {
    fs::create_dir_all(git_dir.join("info"))?;
    Ok(())
}

fn create_objects_dir(git_dir: &Path) -> Result<()> {
    fs::create_dir_all(git_dir.join("objects/info"))?;
    fs::create_dir_all(git_dir.join("objects/pack"))?;
    Ok(())
}

fn create_refs_dir(git_dir: &Path) -> Result<()> {
    fs::create_dir_all(git_dir.join("refs/heads"))?;
    fs::create_dir_all(git_dir.join("refs/tags"))?;
    Ok(())
}

/// Reads `extensions.objectformat` from the repository config.
fn read_object_format(git_dir: &Path) -> Result<HashAlgorithm> {
    let config = match fs::read_to_string(git_dir.join("config")) {
        Ok(config) => config,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashAlgorithm::Sha1),
        Err(e) => return Err(e.into()),
    };

    let mut in_extensions = false;
    for line in config.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_extensions = line.eq_ignore_ascii_case("[extensions]");
            continue;
        }
        if !in_extensions {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case("objectformat") {
            return match value.trim().to_ascii_lowercase().as_str() {
                "sha1" => Ok(HashAlgorithm::Sha1),
                "sha256" => Ok(HashAlgorithm::Sha256),
                other => Err(StorageError::Corruption(format!(
                    "unsupported object format {:?}",
                    other
                ))),
            };
        }
    }
    Ok(HashAlgorithm::Sha1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectType;
    use tempfile::TempDir;

    #[test]
    fn test_init_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("alice/project.git");
        let repo = Repository::init(&path, "alice/project", &StorageConfig::default()).unwrap();

        assert_eq!(repo.key, "alice/project");
        assert_eq!(fs::read_to_string(path.join("HEAD")).unwrap(), "ref: refs/heads/main\n");
        assert!(fs::read_to_string(path.join("config")).unwrap().contains("bare = true"));
        for sub in ["objects/pack", "objects/info", "refs/heads", "refs/tags", "info"] {
            assert!(path.join(sub).is_dir(), "{} missing", sub);
        }
        assert!(path.join("description").is_file());
        assert_eq!(repo.refs.current_branch().as_deref(), Some("main"));
    }

    #[test]
    fn test_init_twice_fails() {
        let dir = TempDir::new().unwrap();
        Repository::init(dir.path(), "k", &StorageConfig::default()).unwrap();
        assert!(matches!(
            Repository::init(dir.path(), "k", &StorageConfig::default()),
            Err(StorageError::RepoExists(_))
        ));
    }

    #[test]
    fn test_open_missing() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Repository::open(dir.path().join("nope"), "k", &StorageConfig::default()),
            Err(StorageError::RepoNotFound(_))
        ));
    }

    #[test]
    fn test_sha256_format_is_detected_on_open() {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            hash_algorithm: HashAlgorithm::Sha256,
            ..StorageConfig::default()
        };
        Repository::init(dir.path(), "k", &config).unwrap();

        let repo = Repository::open(dir.path(), "k", &StorageConfig::default()).unwrap();
        assert_eq!(repo.algorithm(), HashAlgorithm::Sha256);
        let id = repo.objects.put_blob(&b"x"[..]).unwrap();
        assert_eq!(id.as_bytes().len(), 32);
    }

    #[test]
    fn test_repository_commit() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path(), "alice/test-repo", &StorageConfig::default()).unwrap();

        let tree_id = repo.objects.put(ObjectType::Tree, Vec::<u8>::new()).unwrap();
        let author = "Alice <alice@example.com> 1234567890 +0000";
        let first = repo.commit(&tree_id, "Initial commit\n", author, author).unwrap();
        let second = repo.commit(&tree_id, "Second\n", author, author).unwrap();

        assert_eq!(repo.refs.resolve_head().unwrap(), second);
        let crate::Object::Commit(c) = repo.objects.read(&second).unwrap() else {
            panic!("expected commit");
        };
        assert_eq!(c.parents.as_slice(), &[first]);
    }
}
