//! Garbage collection roots.
//!
//! Permanent roots are entries under `gcroots/`: a symlink to the object (or
//! a file holding the store path) per root name. Temporary roots pin the
//! paths an in-flight realization depends on; each [`TempRoots`] owns one
//! file `temproots/<pid>-<n>` listing store paths, removed on drop. Files
//! whose process has died are ignored and cleaned up by the collector.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, warn};

use super::GcError;
use crate::lock::{LockManager, LockMode, StoreLock, process_alive};
use crate::store::{ArtifactInfo, Content, StagedObject, Store, StorePath};
use crate::util::hash::Fingerprint;

static NEXT_TEMP_ROOTS: AtomicU64 = AtomicU64::new(0);

/// A named permanent root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GcRoot {
  pub name: String,
  pub path: StorePath,
}

fn check_root_name(name: &str) -> Result<(), GcError> {
  if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
    return Err(GcError::InvalidRootName(name.to_string()));
  }
  Ok(())
}

/// Register `path` as a permanent root called `name`, replacing any root of
/// that name.
///
/// Holds the path's shared lock until the root is on disk, so a collector
/// either sees the root or has already deleted the path.
pub fn add_root(store: &Store, name: &str, path: &StorePath) -> Result<PathBuf, GcError> {
  check_root_name(name)?;
  let _lock = LockManager::new(store).with_command("root").acquire(path, LockMode::Shared)?;
  if !store.exists(path) {
    return Err(GcError::UnknownPath(path.clone()));
  }

  let dir = store.roots_dir();
  let link = dir.join(name);
  let io_err = |source| GcError::Io {
    path: link.clone(),
    source,
  };

  // Build the new root beside the old one, then swap it in.
  let staged = dir.join(format!(".{}.new", name));
  match fs::remove_file(&staged) {
    Ok(()) => {}
    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
    Err(e) => return Err(io_err(e)),
  }

  #[cfg(unix)]
  std::os::unix::fs::symlink(store.object_path(path), &staged).map_err(io_err)?;
  #[cfg(not(unix))]
  fs::write(&staged, path.to_string()).map_err(io_err)?;

  fs::rename(&staged, &link).map_err(io_err)?;
  debug!(root = name, path = %path, "added gc root");
  Ok(link)
}

/// Remove the root called `name`. Returns whether it existed.
pub fn remove_root(store: &Store, name: &str) -> Result<bool, GcError> {
  check_root_name(name)?;
  let link = store.roots_dir().join(name);
  match fs::remove_file(&link) {
    Ok(()) => Ok(true),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
    Err(source) => Err(GcError::Io { path: link, source }),
  }
}

/// All permanent roots, sorted by name. Entries that do not name a store
/// path are skipped with a warning.
pub fn list_roots(store: &Store) -> Result<Vec<GcRoot>, GcError> {
  let dir = store.roots_dir();
  let mut roots = Vec::new();

  for entry in fs::read_dir(&dir).map_err(|source| GcError::Io {
    path: dir.clone(),
    source,
  })? {
    let entry = entry.map_err(|source| GcError::Io {
      path: dir.clone(),
      source,
    })?;
    let Some(name) = entry.file_name().to_str().map(str::to_string) else {
      continue;
    };
    if name.starts_with('.') {
      continue;
    }

    match read_root(&entry.path()) {
      Some(path) => roots.push(GcRoot { name, path }),
      None => warn!(root = %entry.path().display(), "ignoring unreadable gc root"),
    }
  }

  roots.sort_by(|a, b| a.name.cmp(&b.name));
  Ok(roots)
}

fn read_root(entry: &Path) -> Option<StorePath> {
  if let Ok(target) = fs::read_link(entry) {
    return target.file_name()?.to_str()?.parse().ok();
  }
  fs::read_to_string(entry).ok()?.trim().parse().ok()
}

/// Temporary roots of one realization in this process.
#[derive(Debug)]
pub struct TempRoots {
  store_root: PathBuf,
  file: PathBuf,
  paths: Mutex<BTreeSet<StorePath>>,
}

impl TempRoots {
  pub fn new(store: &Store) -> Self {
    let n = NEXT_TEMP_ROOTS.fetch_add(1, Ordering::Relaxed);
    Self {
      store_root: store.root().to_path_buf(),
      file: store
        .temp_roots_dir()
        .join(format!("{}-{}", std::process::id(), n)),
      paths: Mutex::new(BTreeSet::new()),
    }
  }

  pub fn file(&self) -> &Path {
    &self.file
  }

  /// Record `paths` as live. Blocks while a collection is running.
  pub fn add<'a>(&self, paths: impl IntoIterator<Item = &'a StorePath>) -> Result<(), GcError> {
    let _store_lock = StoreLock::wait(&self.store_root, LockMode::Shared, "register temp roots")?;
    let mut known = self.paths.lock().unwrap_or_else(|e| e.into_inner());

    let fresh: Vec<&StorePath> = paths.into_iter().filter(|p| !known.contains(*p)).collect();
    if fresh.is_empty() {
      return Ok(());
    }

    let mut lines = String::new();
    for path in &fresh {
      lines.push_str(&path.to_string());
      lines.push('\n');
    }

    let io_err = |source| GcError::Io {
      path: self.file.clone(),
      source,
    };
    let mut file = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&self.file)
      .map_err(io_err)?;
    file.write_all(lines.as_bytes()).map_err(io_err)?;
    file.sync_data().map_err(io_err)?;

    known.extend(fresh.into_iter().cloned());
    Ok(())
  }

  pub fn paths(&self) -> BTreeSet<StorePath> {
    self.paths.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }
}

impl Drop for TempRoots {
  fn drop(&mut self) {
    match fs::remove_file(&self.file) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(e) => warn!(file = %self.file.display(), error = %e, "failed to remove temp roots"),
    }
  }
}

/// The owning pid of a temp roots file name.
fn temp_roots_owner(name: &str) -> Option<u32> {
  name.split('-').next()?.parse().ok()
}

/// Paths pinned by live processes. Files left by dead processes are removed
/// unless `dry_run`. Callers hold the store lock exclusively.
pub(crate) fn live_temp_roots(store: &Store, dry_run: bool) -> Result<(BTreeSet<StorePath>, usize), GcError> {
  let dir = store.temp_roots_dir();
  let io_err = |source| GcError::Io {
    path: dir.clone(),
    source,
  };

  let mut live = BTreeSet::new();
  let mut stale = 0;
  for entry in fs::read_dir(&dir).map_err(io_err)? {
    let entry = entry.map_err(io_err)?;
    let file = entry.path();
    let owner = entry.file_name().to_str().and_then(temp_roots_owner);

    if owner.is_some_and(process_alive) {
      // The owner may drop its roots while we look.
      let content = match fs::read_to_string(&file) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
        Err(source) => return Err(GcError::Io { path: file, source }),
      };
      live.extend(content.lines().filter_map(|line| line.trim().parse::<StorePath>().ok()));
      continue;
    }

    stale += 1;
    if !dry_run {
      debug!(file = %file.display(), "removing stale temp roots");
      if let Err(e) = fs::remove_file(&file) {
        warn!(file = %file.display(), error = %e, "failed to remove stale temp roots");
      }
    }
  }

  Ok((live, stale))
}

/// Keeps paths a realization touches alive against a concurrent collector.
///
/// Paths are locked before they are checked or committed and stay locked
/// until they are recorded as temp roots, so the collector either sees the
/// root or fails to take the path lock and skips the path.
#[derive(Debug, Clone)]
pub struct RootGuard {
  locks: LockManager,
  roots: Arc<TempRoots>,
}

impl RootGuard {
  pub fn new(locks: LockManager, roots: Arc<TempRoots>) -> Self {
    Self { locks, roots }
  }

  pub fn roots(&self) -> &TempRoots {
    &self.roots
  }

  /// Pin existing store paths. Returns `false` if any of them is missing.
  pub fn pin(&self, store: &Store, paths: &BTreeSet<StorePath>) -> Result<bool, GcError> {
    let mut held = Vec::with_capacity(paths.len());
    for path in paths {
      held.push(self.locks.acquire(path, LockMode::Shared)?);
      if !store.exists(path) {
        return Ok(false);
      }
    }
    self.roots.add(paths)?;
    Ok(true)
  }

  /// [`Store::put`], pinning the new path before anyone can collect it.
  pub fn put(
    &self,
    store: &Store,
    name: &str,
    content: Content,
    references: &BTreeSet<StorePath>,
  ) -> Result<StorePath, GcError> {
    let staging = store.staging_dir("put-")?;
    let object = store.stage(&staging, name, content, references)?;
    let path = object.path.clone();
    self.commit(store, vec![object], None)?;
    Ok(path)
  }

  /// Commit staged objects under their exclusive path locks and pin them.
  pub fn commit(
    &self,
    store: &Store,
    objects: Vec<StagedObject>,
    deriver: Option<Fingerprint>,
  ) -> Result<Vec<ArtifactInfo>, GcError> {
    // Identical outputs share a path; locking it twice would self-deadlock.
    let paths: BTreeSet<StorePath> = objects.iter().map(|o| o.path.clone()).collect();
    let mut held = Vec::with_capacity(paths.len());
    for path in &paths {
      held.push(self.locks.acquire(path, LockMode::Exclusive)?);
    }

    let mut infos = Vec::with_capacity(objects.len());
    for object in objects {
      infos.push(store.commit(object, deriver.clone())?);
    }

    self.roots.add(&paths)?;
    Ok(infos)
  }
}

/// Commit staged objects, through `guard` when one is given.
pub fn commit_staged(
  store: &Store,
  guard: Option<&RootGuard>,
  objects: Vec<StagedObject>,
  deriver: Option<Fingerprint>,
) -> Result<Vec<ArtifactInfo>, GcError> {
  match guard {
    Some(guard) => guard.commit(store, objects, deriver),
    None => objects
      .into_iter()
      .map(|object| store.commit(object, deriver.clone()).map_err(GcError::from))
      .collect(),
  }
}
