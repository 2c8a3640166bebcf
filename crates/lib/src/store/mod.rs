//! Content-addressed object store.
//!
//! Every artifact is identified by a fingerprint over its name, type tag,
//! canonical content and references, and lives under a store path derived from
//! that fingerprint. Objects are write-once: they are staged under `tmp/`,
//! write-protected, and installed with an atomic rename.
//!
//! # Layout
//!
//! ```text
//! store/
//! ├── obj/<hash>-<name>           # artifacts (file or directory tree)
//! ├── meta/<hash>-<name>.json     # ArtifactInfo for each valid object
//! ├── results/<fingerprint>.json  # cached build results, keyed by recipe
//! ├── logs/<fingerprint>.log      # captured build output
//! ├── tmp/                        # staging area and build sandboxes
//! ├── locks/                      # per-path lock files
//! ├── gcroots/                    # pinned roots
//! ├── temproots/                  # per-process temporary roots
//! └── .lock                       # store-wide lock (garbage collection)
//! ```

pub mod archive;
mod info;
pub mod path;
pub mod results;

pub use info::*;
pub use path::{StorePath, StorePathError};
pub use results::{ResultOrigin, ResultRecord};

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::platform::immutable::{SealError, seal};
use crate::util::fs::{copy_path, dir_size, remove_path, write_json_atomic};
use crate::util::hash::{DirHashError, Fingerprint, hash_file, hash_tree, is_executable};
use crate::util::unix_now;

const OBJ_DIR: &str = "obj";
const META_DIR: &str = "meta";
const RESULTS_DIR: &str = "results";
const LOGS_DIR: &str = "logs";
const TMP_DIR: &str = "tmp";
const LOCKS_DIR: &str = "locks";
const ROOTS_DIR: &str = "gcroots";
const TEMP_ROOTS_DIR: &str = "temproots";

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("store path not found: {0}")]
  NotFound(StorePath),

  #[error("store object {path} is corrupt: expected fingerprint {expected}, found {actual}")]
  Corrupt {
    path: StorePath,
    expected: Fingerprint,
    actual: Fingerprint,
  },

  #[error("reference {reference} of '{name}' is not a valid store path")]
  MissingReference { name: String, reference: StorePath },

  #[error("store object {0} is not a regular file")]
  NotAFile(StorePath),

  #[error("unsupported file type at {0}")]
  Unsupported(PathBuf),

  #[error(transparent)]
  Path(#[from] StorePathError),

  #[error("failed to hash content: {0}")]
  Hash(#[from] DirHashError),

  #[error(transparent)]
  Seal(#[from] SealError),

  #[error("invalid metadata for {path}: {source}")]
  Metadata {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("archive error: {0}")]
  Archive(String),

  #[error("store i/o error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
  move |source| StoreError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// A staged object whose fingerprint has been computed but which has not
/// been committed yet.
#[derive(Debug, Clone)]
pub struct StagedObject {
  pub staged: PathBuf,
  pub path: StorePath,
  pub fingerprint: Fingerprint,
  pub kind: ArtifactKind,
  pub references: BTreeSet<StorePath>,
}

/// Handle to an on-disk store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
  root: PathBuf,
}

impl Store {
  /// Open (and create if needed) the store at `root`.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
    let root = root.into();
    for dir in [
      OBJ_DIR,
      META_DIR,
      RESULTS_DIR,
      LOGS_DIR,
      TMP_DIR,
      LOCKS_DIR,
      ROOTS_DIR,
      TEMP_ROOTS_DIR,
    ] {
      let path = root.join(dir);
      fs::create_dir_all(&path).map_err(io_err(&path))?;
    }
    let root = dunce::canonicalize(&root).map_err(io_err(&root))?;
    debug!(root = %root.display(), "opened store");
    Ok(Self { root })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// On-disk location of a store object.
  pub fn object_path(&self, path: &StorePath) -> PathBuf {
    self.root.join(OBJ_DIR).join(path.to_string())
  }

  fn meta_path(&self, path: &StorePath) -> PathBuf {
    self.root.join(META_DIR).join(format!("{}.json", path))
  }

  pub fn objects_dir(&self) -> PathBuf {
    self.root.join(OBJ_DIR)
  }

  pub fn meta_dir(&self) -> PathBuf {
    self.root.join(META_DIR)
  }

  pub fn tmp_dir(&self) -> PathBuf {
    self.root.join(TMP_DIR)
  }

  pub fn locks_dir(&self) -> PathBuf {
    self.root.join(LOCKS_DIR)
  }

  pub fn roots_dir(&self) -> PathBuf {
    self.root.join(ROOTS_DIR)
  }

  pub fn temp_roots_dir(&self) -> PathBuf {
    self.root.join(TEMP_ROOTS_DIR)
  }

  pub fn results_dir(&self) -> PathBuf {
    self.root.join(RESULTS_DIR)
  }

  pub fn logs_dir(&self) -> PathBuf {
    self.root.join(LOGS_DIR)
  }

  /// Create a fresh staging directory under `tmp/`. Removed on drop.
  ///
  /// The name is `<prefix><pid>-<random>` so the garbage collector can tell
  /// whether its owner is still running.
  pub fn staging_dir(&self, prefix: &str) -> Result<tempfile::TempDir, StoreError> {
    let tmp = self.tmp_dir();
    tempfile::Builder::new()
      .prefix(&staging_prefix(prefix))
      .tempdir_in(&tmp)
      .map_err(io_err(&tmp))
  }

  /// Whether `path` is a valid (fully committed) store object.
  pub fn exists(&self, path: &StorePath) -> bool {
    self.meta_path(path).is_file() && self.object_path(path).symlink_metadata().is_ok()
  }

  /// Add content to the store.
  ///
  /// Idempotent: identical content with identical references returns the
  /// same path and leaves the existing object untouched.
  pub fn put(&self, name: &str, content: Content, references: &BTreeSet<StorePath>) -> Result<StorePath, StoreError> {
    let staging = self.staging_dir("put-")?;
    let object = self.stage(&staging, name, content, references)?;
    Ok(self.commit(object, None)?.path)
  }

  /// Write `content` into `staging` and compute its identity without
  /// committing it.
  pub fn stage(
    &self,
    staging: &tempfile::TempDir,
    name: &str,
    content: Content,
    references: &BTreeSet<StorePath>,
  ) -> Result<StagedObject, StoreError> {
    let staged = staging.path().join("content");

    match content {
      Content::Bytes { data, executable } => {
        let mut file = fs::File::create(&staged).map_err(io_err(&staged))?;
        file.write_all(&data).map_err(io_err(&staged))?;
        file.sync_all().map_err(io_err(&staged))?;
        set_executable(&staged, executable).map_err(io_err(&staged))?;
      }
      Content::Tree(src) => {
        copy_path(&src, &staged).map_err(io_err(&src))?;
      }
    }

    self.fingerprint_staged(name, &staged, references)
  }

  /// Compute the identity of a staged file or tree without committing it.
  pub fn fingerprint_staged(
    &self,
    name: &str,
    staged: &Path,
    references: &BTreeSet<StorePath>,
  ) -> Result<StagedObject, StoreError> {
    let metadata = fs::symlink_metadata(staged).map_err(io_err(staged))?;

    let (kind, content) = if metadata.is_dir() {
      (ArtifactKind::Tree, hash_tree(staged)?)
    } else if metadata.is_file() {
      let kind = if is_executable(staged) {
        ArtifactKind::Executable
      } else {
        ArtifactKind::File
      };
      (kind, hash_file(staged)?)
    } else {
      return Err(StoreError::Unsupported(staged.to_path_buf()));
    };

    let fingerprint = content_fingerprint(name, kind, &content, references);
    let path = StorePath::from_fingerprint(&fingerprint, name)?;

    Ok(StagedObject {
      staged: staged.to_path_buf(),
      path,
      fingerprint,
      kind,
      references: references.clone(),
    })
  }

  /// Commit a staged file or tree into the store.
  ///
  /// The staged path is moved into place; if an identical object already
  /// exists the staged copy is discarded instead.
  pub fn add_staged(
    &self,
    name: &str,
    staged: &Path,
    references: &BTreeSet<StorePath>,
    deriver: Option<Fingerprint>,
  ) -> Result<ArtifactInfo, StoreError> {
    let object = self.fingerprint_staged(name, staged, references)?;
    self.commit(object, deriver)
  }

  /// Commit an object previously returned by [`Store::fingerprint_staged`].
  pub fn commit(&self, object: StagedObject, deriver: Option<Fingerprint>) -> Result<ArtifactInfo, StoreError> {
    for reference in &object.references {
      if !self.exists(reference) {
        return Err(StoreError::MissingReference {
          name: object.path.name().to_string(),
          reference: reference.clone(),
        });
      }
    }

    if self.exists(&object.path) {
      debug!(path = %object.path, "object already in store");
      remove_path(&object.staged).map_err(io_err(&object.staged))?;
      return self.query_info(&object.path);
    }

    let info = ArtifactInfo {
      path: object.path.clone(),
      fingerprint: object.fingerprint,
      kind: object.kind,
      references: object.references,
      size: dir_size(&object.staged),
      deriver,
      registered_at: unix_now(),
    };

    seal(&object.staged)?;

    // Metadata first: an object without metadata is never reported as valid.
    let meta_path = self.meta_path(&info.path);
    write_json_atomic(&meta_path, &info).map_err(io_err(&meta_path))?;

    let target = self.object_path(&info.path);
    if let Err(e) = fs::rename(&object.staged, &target) {
      if target.symlink_metadata().is_ok() {
        // Another writer installed the same object first.
        debug!(path = %info.path, "lost commit race, discarding staged copy");
        remove_path(&object.staged).map_err(io_err(&object.staged))?;
      } else {
        return Err(StoreError::Io { path: target, source: e });
      }
    }

    info!(path = %info.path, kind = %info.kind, size = info.size, "committed store object");
    Ok(info)
  }

  /// Look up an artifact.
  pub fn get(&self, path: &StorePath) -> Result<Artifact, StoreError> {
    let info = self.query_info(path)?;
    Ok(Artifact::new(info, self.object_path(path)))
  }

  /// Read the recorded metadata of a valid store object.
  pub fn query_info(&self, path: &StorePath) -> Result<ArtifactInfo, StoreError> {
    if !self.exists(path) {
      return Err(StoreError::NotFound(path.clone()));
    }
    let meta_path = self.meta_path(path);
    let content = fs::read_to_string(&meta_path).map_err(io_err(&meta_path))?;
    serde_json::from_str(&content).map_err(|source| StoreError::Metadata { path: meta_path, source })
  }

  /// The recorded references of a valid store object.
  pub fn references(&self, path: &StorePath) -> Result<BTreeSet<StorePath>, StoreError> {
    Ok(self.query_info(path)?.references)
  }

  /// All valid store objects, sorted.
  pub fn list(&self) -> Result<Vec<StorePath>, StoreError> {
    let dir = self.objects_dir();
    let mut paths = Vec::new();

    for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
      let entry = entry.map_err(io_err(&dir))?;
      let name = entry.file_name();
      let Some(name) = name.to_str() else {
        continue;
      };
      match name.parse::<StorePath>() {
        Ok(path) if self.exists(&path) => paths.push(path),
        Ok(path) => debug!(path = %path, "skipping object without metadata"),
        Err(_) => debug!(name, "skipping unrecognized entry in object directory"),
      }
    }

    paths.sort();
    Ok(paths)
  }

  /// Recompute an object's fingerprint and compare it with the recorded one.
  pub fn verify(&self, path: &StorePath) -> Result<(), StoreError> {
    let info = self.query_info(path)?;
    let object = self.fingerprint_staged(path.name(), &self.object_path(path), &info.references)?;

    if object.fingerprint != info.fingerprint || object.kind != info.kind || !path.matches(&object.fingerprint) {
      warn!(path = %path, expected = %info.fingerprint, actual = %object.fingerprint, "store object corrupt");
      return Err(StoreError::Corrupt {
        path: path.clone(),
        expected: info.fingerprint,
        actual: object.fingerprint,
      });
    }

    Ok(())
  }

  /// Remove an object and its metadata. Returns the number of bytes freed.
  ///
  /// Callers must hold the path's exclusive lock.
  pub fn delete(&self, path: &StorePath) -> Result<u64, StoreError> {
    let object = self.object_path(path);
    let size = if object.symlink_metadata().is_ok() {
      dir_size(&object)
    } else {
      0
    };

    remove_path(&object).map_err(io_err(&object))?;

    let meta_path = self.meta_path(path);
    match fs::remove_file(&meta_path) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(e) => return Err(StoreError::Io { path: meta_path, source: e }),
    }

    debug!(path = %path, size, "deleted store object");
    Ok(size)
  }

  /// Metadata files whose object is missing. Left behind by a crash between
  /// writing metadata and installing the object.
  pub fn orphaned_metadata(&self) -> Result<Vec<PathBuf>, StoreError> {
    let dir = self.meta_dir();
    let mut orphans = Vec::new();

    for entry in fs::read_dir(&dir).map_err(io_err(&dir))? {
      let entry = entry.map_err(io_err(&dir))?;
      let file_name = entry.file_name();
      let Some(name) = file_name.to_str().and_then(|n| n.strip_suffix(".json")) else {
        continue;
      };
      if let Ok(path) = name.parse::<StorePath>()
        && self.object_path(&path).symlink_metadata().is_err()
      {
        orphans.push(entry.path());
      }
    }

    Ok(orphans)
  }
}

pub(crate) fn staging_prefix(prefix: &str) -> String {
  format!("{}{}-", prefix, std::process::id())
}

/// The pid embedded in a staging entry name by [`Store::staging_dir`].
pub fn staging_owner(name: &str) -> Option<u32> {
  let (rest, _random) = name.rsplit_once('-')?;
  let (_, pid) = rest.rsplit_once('-')?;
  pid.parse().ok()
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> io::Result<()> {
  use std::os::unix::fs::PermissionsExt;
  let mode = if executable { 0o755 } else { 0o644 };
  fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path, _executable: bool) -> io::Result<()> {
  Ok(())
}
