//! Mark-and-sweep garbage collection of the store.
//!
//! The live set is the reference closure of every root: permanent roots in
//! `gcroots/`, temp roots of running processes and any extra roots the
//! caller names. Everything else is deleted under its exclusive path lock.
//! A path whose lock is held is skipped, never waited on.
//!
//! The exclusive store lock is held only while marking. Deletion runs
//! without it:
//!
//! 1. mark under the store lock, then release it;
//! 2. take the path lock of every dead path that is free;
//! 3. mark again under the store lock and release paths rooted meanwhile;
//! 4. delete what is left.
//!
//! Rooting a path takes its path lock before it checks the path exists, so a
//! root either lands before step 3 sees it or waits until the path is gone.
//!
//! Leftovers are swept as well: staging of dead processes, metadata without
//! an object, results naming deleted outputs, lock files of paths that are
//! not objects and logs of recipes without a valid result.

mod roots;

pub use roots::*;

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::consts::RECIPE_PATH_SUFFIX;
use crate::lock::{LockError, LockManager, LockMode, PathLock, StoreLock, StoreLockError, process_alive};
use crate::platform::immutable::unseal;
use crate::store::{Store, StoreError, StorePath, staging_owner};
use crate::util::fs::remove_path;
use crate::util::hash::Fingerprint;

#[derive(Debug, Error)]
pub enum GcError {
  #[error("invalid root name '{0}'")]
  InvalidRootName(String),

  #[error("{0} is not in the store")]
  UnknownPath(StorePath),

  #[error(transparent)]
  StoreLock(#[from] StoreLockError),

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("gc i/o error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

#[derive(Debug, Clone, Default)]
pub struct GcOptions {
  /// Paths kept alive for this collection only.
  pub extra_roots: BTreeSet<StorePath>,
  /// Report what would be deleted without touching anything.
  pub dry_run: bool,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct GcStats {
  pub roots: usize,
  pub live: usize,
  pub scanned: usize,
  pub deleted: usize,
  pub bytes_freed: u64,
  pub skipped_locked: usize,
  pub stale_temp_roots: usize,
  pub stale_staging: usize,
  pub orphaned_metadata: usize,
  pub stale_results: usize,
  pub stale_locks: usize,
  pub stale_logs: usize,
}

#[derive(Debug, Serialize)]
pub struct GcResult {
  pub dry_run: bool,
  pub stats: GcStats,
  pub deleted: Vec<StorePath>,
  pub skipped: Vec<StorePath>,
}

/// Every store path reachable from `roots`. Roots naming missing objects
/// are ignored.
pub fn live_closure(store: &Store, roots: &BTreeSet<StorePath>) -> Result<BTreeSet<StorePath>, GcError> {
  let mut live = BTreeSet::new();
  let mut worklist: Vec<StorePath> = roots.iter().cloned().collect();

  while let Some(path) = worklist.pop() {
    if live.contains(&path) {
      continue;
    }
    if !store.exists(&path) {
      debug!(path = %path, "root or reference not in store");
      continue;
    }
    for reference in store.references(&path)? {
      if !live.contains(&reference) {
        worklist.push(reference);
      }
    }
    live.insert(path);
  }

  Ok(live)
}

pub fn collect_garbage(store: &Store, locks: &LockManager, options: &GcOptions) -> Result<GcResult, GcError> {
  let mut stats = GcStats::default();

  let (live, all) = {
    let _store_lock = StoreLock::wait(store.root(), LockMode::Exclusive, "gc")?;
    let live = mark(store, options, &mut stats)?;
    (live, store.list()?)
  };
  stats.scanned = all.len();
  let candidates: Vec<StorePath> = all.into_iter().filter(|p| !live.contains(p)).collect();

  let mut deleted = Vec::new();
  let mut skipped = Vec::new();

  if options.dry_run {
    for path in candidates {
      stats.bytes_freed += store.query_info(&path).map(|info| info.size).unwrap_or(0);
      deleted.push(path);
    }
  } else {
    let held = lock_candidates(locks, candidates, &mut skipped)?;
    for lock in confirm_dead(store, options, &mut stats, held)? {
      let path = lock.path().clone();
      stats.bytes_freed += store.delete(&path)?;
      // Waiters on the old lock file notice the unlink and retry.
      if let Err(e) = lock.unlink() {
        warn!(path = %path, error = %e, "failed to remove lock file");
      }
      deleted.push(path);
    }
  }

  stats.deleted = deleted.len();
  stats.skipped_locked = skipped.len();

  stats.stale_staging = clean_staging(store, options.dry_run)?;
  stats.orphaned_metadata = clean_orphaned_metadata(store, locks, options.dry_run)?;

  let stale_results = store.stale_results()?;
  stats.stale_results = stale_results.len();
  if !options.dry_run {
    for file in &stale_results {
      if let Err(e) = fs::remove_file(file) {
        warn!(file = %file.display(), error = %e, "failed to remove stale record");
      }
    }
  }

  let busy_recipes = clean_locks(store, locks, options.dry_run, &mut stats)?;
  stats.stale_logs = clean_logs(store, &busy_recipes, options.dry_run)?;

  info!(
    deleted = stats.deleted,
    bytes_freed = stats.bytes_freed,
    skipped_locked = stats.skipped_locked,
    live = stats.live,
    dry_run = options.dry_run,
    "garbage collection complete"
  );

  Ok(GcResult {
    dry_run: options.dry_run,
    stats,
    deleted,
    skipped,
  })
}

/// The live set. Callers hold the store lock exclusively.
fn mark(store: &Store, options: &GcOptions, stats: &mut GcStats) -> Result<BTreeSet<StorePath>, GcError> {
  let mut roots: BTreeSet<StorePath> = list_roots(store)?.into_iter().map(|root| root.path).collect();
  let (temp_roots, stale_temp_roots) = live_temp_roots(store, options.dry_run)?;
  roots.extend(temp_roots);
  roots.extend(options.extra_roots.iter().cloned());

  let live = live_closure(store, &roots)?;
  stats.roots = roots.len();
  stats.live = live.len();
  stats.stale_temp_roots += stale_temp_roots;
  Ok(live)
}

/// Take the exclusive lock of every candidate that nobody else holds.
fn lock_candidates(
  locks: &LockManager,
  candidates: Vec<StorePath>,
  skipped: &mut Vec<StorePath>,
) -> Result<Vec<PathLock>, GcError> {
  let mut held = Vec::with_capacity(candidates.len());
  for path in candidates {
    match locks.try_acquire(&path, LockMode::Exclusive) {
      Ok(lock) => held.push(lock),
      Err(LockError::WouldBlock { holder, .. }) => {
        debug!(path = %path, ?holder, "path is locked, skipping");
        skipped.push(path);
      }
      Err(e) => return Err(e.into()),
    }
  }
  Ok(held)
}

/// Mark again and release candidates rooted since the first mark.
///
/// Anything that roots a path takes its path lock first, so once every
/// candidate is held the live set can only grow by roots already on disk.
fn confirm_dead(
  store: &Store,
  options: &GcOptions,
  stats: &mut GcStats,
  mut held: Vec<PathLock>,
) -> Result<Vec<PathLock>, GcError> {
  if held.is_empty() {
    return Ok(held);
  }

  let _store_lock = StoreLock::wait(store.root(), LockMode::Exclusive, "gc")?;
  let live = mark(store, options, stats)?;
  held.retain(|lock| {
    let dead = !live.contains(lock.path());
    if !dead {
      debug!(path = %lock.path(), "rooted during collection, keeping");
    }
    dead
  });
  Ok(held)
}

/// Remove metadata whose object is gone. A commit in progress writes its
/// metadata before the object under the exclusive path lock, so held paths
/// are left alone.
fn clean_orphaned_metadata(store: &Store, locks: &LockManager, dry_run: bool) -> Result<usize, GcError> {
  let mut removed = 0;
  for file in store.orphaned_metadata()? {
    let Some(path) = file
      .file_stem()
      .and_then(|stem| stem.to_str())
      .and_then(|stem| stem.parse::<StorePath>().ok())
    else {
      continue;
    };
    let _lock = match locks.try_acquire(&path, LockMode::Exclusive) {
      Ok(lock) => lock,
      Err(LockError::WouldBlock { .. }) => continue,
      Err(e) => return Err(e.into()),
    };
    if store.object_path(&path).symlink_metadata().is_ok() {
      continue;
    }

    removed += 1;
    if !dry_run && let Err(e) = fs::remove_file(&file) {
      warn!(file = %file.display(), error = %e, "failed to remove orphaned metadata");
    }
  }
  Ok(removed)
}

/// Remove lock files of paths that are not store objects: recipe locks and
/// leftovers of commits that never happened. Returns the recipe paths whose
/// lock is held, since their build is still running.
fn clean_locks(
  store: &Store,
  locks: &LockManager,
  dry_run: bool,
  stats: &mut GcStats,
) -> Result<Vec<StorePath>, GcError> {
  let dir = store.locks_dir();
  let io_err = |source| GcError::Io {
    path: dir.clone(),
    source,
  };

  let mut busy_recipes = Vec::new();
  for entry in fs::read_dir(&dir).map_err(io_err)? {
    let entry = entry.map_err(io_err)?;
    let Some(path) = entry
      .file_name()
      .to_str()
      .and_then(|name| name.strip_suffix(".lock"))
      .and_then(|name| name.parse::<StorePath>().ok())
    else {
      continue;
    };
    if store.exists(&path) {
      continue;
    }

    let lock = match locks.try_acquire(&path, LockMode::Exclusive) {
      Ok(lock) => lock,
      Err(LockError::WouldBlock { .. }) => {
        if path.name().ends_with(RECIPE_PATH_SUFFIX) {
          busy_recipes.push(path);
        }
        continue;
      }
      Err(e) => return Err(e.into()),
    };

    // Committed just before we took the lock.
    if store.exists(&path) {
      continue;
    }

    stats.stale_locks += 1;
    if !dry_run && let Err(e) = lock.unlink() {
      warn!(path = %path, error = %e, "failed to remove lock file");
    }
  }
  Ok(busy_recipes)
}

/// Remove build logs of recipes with no valid result, except those still
/// being built.
fn clean_logs(store: &Store, busy_recipes: &[StorePath], dry_run: bool) -> Result<usize, GcError> {
  let dir = store.logs_dir();
  let io_err = |source| GcError::Io {
    path: dir.clone(),
    source,
  };

  let mut removed = 0;
  for entry in fs::read_dir(&dir).map_err(io_err)? {
    let entry = entry.map_err(io_err)?;
    let Some(fingerprint) = entry
      .file_name()
      .to_str()
      .and_then(|name| name.strip_suffix(".log"))
      .map(|fp| Fingerprint(fp.to_string()))
    else {
      continue;
    };
    if busy_recipes.iter().any(|path| path.matches(&fingerprint)) || store.valid_result(&fingerprint).is_some() {
      continue;
    }

    removed += 1;
    if dry_run {
      continue;
    }
    let file = entry.path();
    debug!(log = %file.display(), "removing log of unrecorded build");
    if let Err(e) = fs::remove_file(&file) {
      warn!(log = %file.display(), error = %e, "failed to remove build log");
    }
  }
  Ok(removed)
}

/// Remove staging entries under `tmp/` whose owning process is gone.
fn clean_staging(store: &Store, dry_run: bool) -> Result<usize, GcError> {
  let dir = store.tmp_dir();
  let io_err = |source| GcError::Io {
    path: dir.clone(),
    source,
  };

  let mut removed = 0;
  for entry in fs::read_dir(&dir).map_err(io_err)? {
    let entry = entry.map_err(io_err)?;
    let Some(owner) = entry.file_name().to_str().and_then(staging_owner) else {
      continue;
    };
    if process_alive(owner) {
      continue;
    }

    removed += 1;
    if dry_run {
      continue;
    }

    let path = entry.path();
    debug!(staging = %path.display(), owner, "removing abandoned staging directory");
    // Copied inputs are read-only.
    if let Err(e) = unseal(&path) {
      warn!(staging = %path.display(), error = %e, "failed to make staging writable");
    }
    if let Err(e) = remove_path(&path) {
      warn!(staging = %path.display(), error = %e, "failed to remove staging directory");
    }
  }

  Ok(removed)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::Content;
  use std::sync::Arc;
  use tempfile::TempDir;

  struct Fixture {
    _temp: TempDir,
    store: Store,
    locks: LockManager,
  }

  fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let store = Store::open(temp.path().join("store")).unwrap();
    let locks = LockManager::new(&store).with_command("test");
    Fixture {
      _temp: temp,
      store,
      locks,
    }
  }

  fn put(store: &Store, name: &str, refs: &[&StorePath]) -> StorePath {
    store
      .put(
        name,
        Content::bytes(name.as_bytes().to_vec()),
        &refs.iter().map(|p| (*p).clone()).collect(),
      )
      .unwrap()
  }

  #[test]
  fn keeps_closure_of_roots_and_deletes_the_rest() {
    let f = fixture();
    // shared <- app, shared <- tool; only app is rooted.
    let shared = put(&f.store, "shared", &[]);
    let app = put(&f.store, "app", &[&shared]);
    let tool = put(&f.store, "tool", &[&shared]);
    let junk = put(&f.store, "junk", &[]);
    add_root(&f.store, "app", &app).unwrap();

    let result = collect_garbage(&f.store, &f.locks, &GcOptions::default()).unwrap();

    assert!(f.store.exists(&app));
    assert!(f.store.exists(&shared));
    assert!(!f.store.exists(&tool));
    assert!(!f.store.exists(&junk));
    assert_eq!(result.deleted.iter().collect::<BTreeSet<_>>(), BTreeSet::from([&tool, &junk]));
    assert!(result.stats.bytes_freed > 0);
    assert_eq!(result.stats.live, 2);

    // A second pass finds nothing more.
    let again = collect_garbage(&f.store, &f.locks, &GcOptions::default()).unwrap();
    assert!(again.deleted.is_empty());
  }

  #[test]
  fn removing_a_root_frees_its_closure() {
    let f = fixture();
    let shared = put(&f.store, "shared", &[]);
    let app = put(&f.store, "app", &[&shared]);
    add_root(&f.store, "app", &app).unwrap();
    remove_root(&f.store, "app").unwrap();

    collect_garbage(&f.store, &f.locks, &GcOptions::default()).unwrap();
    assert!(f.store.list().unwrap().is_empty());
  }

  #[test]
  fn dry_run_deletes_nothing() {
    let f = fixture();
    let junk = put(&f.store, "junk", &[]);

    let result = collect_garbage(
      &f.store,
      &f.locks,
      &GcOptions {
        dry_run: true,
        ..GcOptions::default()
      },
    )
    .unwrap();

    assert_eq!(result.deleted, vec![junk.clone()]);
    assert!(f.store.exists(&junk));
  }

  #[test]
  fn extra_roots_are_kept() {
    let f = fixture();
    let keep = put(&f.store, "keep", &[]);

    collect_garbage(
      &f.store,
      &f.locks,
      &GcOptions {
        extra_roots: BTreeSet::from([keep.clone()]),
        ..GcOptions::default()
      },
    )
    .unwrap();
    assert!(f.store.exists(&keep));
  }

  #[test]
  fn temp_roots_protect_paths() {
    let f = fixture();
    let pinned = put(&f.store, "pinned", &[]);
    let guard = RootGuard::new(f.locks.clone(), Arc::new(TempRoots::new(&f.store)));
    assert!(guard.pin(&f.store, &BTreeSet::from([pinned.clone()])).unwrap());

    collect_garbage(&f.store, &f.locks, &GcOptions::default()).unwrap();
    assert!(f.store.exists(&pinned));

    drop(guard);
    collect_garbage(&f.store, &f.locks, &GcOptions::default()).unwrap();
    assert!(!f.store.exists(&pinned));
  }

  #[cfg(unix)]
  #[test]
  fn locked_paths_are_skipped() {
    let f = fixture();
    let busy = put(&f.store, "busy", &[]);
    let held = f.locks.acquire(&busy, LockMode::Shared).unwrap();

    let result = collect_garbage(&f.store, &f.locks, &GcOptions::default()).unwrap();
    assert_eq!(result.skipped, vec![busy.clone()]);
    assert!(f.store.exists(&busy));

    drop(held);
    let result = collect_garbage(&f.store, &f.locks, &GcOptions::default()).unwrap();
    assert_eq!(result.deleted, vec![busy.clone()]);
    assert!(!f.locks.lock_file(&busy).exists());
  }

  #[cfg(unix)]
  #[test]
  fn abandoned_staging_and_records_are_cleaned() {
    let f = fixture();
    let dead = f.store.tmp_dir().join(format!("build-abc-{}-XYZ123", i32::MAX));
    fs::create_dir_all(dead.join("out")).unwrap();
    let mine = f.store.staging_dir("put-").unwrap();

    let junk = put(&f.store, "junk", &[]);
    let fp = crate::util::hash::hash_bytes(b"recipe");
    f.store
      .write_result(&crate::store::ResultRecord::new(
        fp.clone(),
        "r",
        std::collections::BTreeMap::from([("out".to_string(), junk)]),
        crate::store::ResultOrigin::Built,
      ))
      .unwrap();

    let result = collect_garbage(&f.store, &f.locks, &GcOptions::default()).unwrap();

    assert!(!dead.exists());
    assert!(mine.path().exists());
    assert_eq!(result.stats.stale_staging, 1);
    assert_eq!(result.stats.stale_results, 1);
    assert!(f.store.read_result(&fp).unwrap().is_none());
  }

  #[test]
  fn paths_rooted_after_marking_are_kept() {
    let f = fixture();
    let late = put(&f.store, "late", &[]);
    let dead = put(&f.store, "dead", &[]);
    let options = GcOptions::default();
    let mut stats = GcStats::default();

    let live = mark(&f.store, &options, &mut stats).unwrap();
    assert!(live.is_empty());
    let mut skipped = Vec::new();
    let held = lock_candidates(&f.locks, vec![late.clone(), dead.clone()], &mut skipped).unwrap();
    assert_eq!(held.len(), 2);

    // The store lock is free while candidates are held.
    let roots = TempRoots::new(&f.store);
    roots.add([&late]).unwrap();
    drop(StoreLock::acquire(f.store.root(), LockMode::Exclusive, "test").unwrap());

    let held = confirm_dead(&f.store, &options, &mut stats, held).unwrap();
    let doomed: Vec<&StorePath> = held.iter().map(|lock| lock.path()).collect();
    assert_eq!(doomed, vec![&dead]);
    assert_eq!(stats.live, 1);
  }

  #[cfg(unix)]
  #[test]
  fn unused_lock_files_and_logs_are_removed() {
    let f = fixture();
    let kept = put(&f.store, "kept", &[]);
    add_root(&f.store, "kept", &kept).unwrap();

    let finished_fp = crate::util::hash::hash_bytes(b"finished");
    let finished = StorePath::from_fingerprint(&finished_fp, "finished.recipe").unwrap();
    drop(f.locks.acquire(&finished, LockMode::Exclusive).unwrap());
    f.store.write_log(&finished_fp, b"failed\n").unwrap();

    let cached_fp = crate::util::hash::hash_bytes(b"cached");
    f.store
      .write_result(&crate::store::ResultRecord::new(
        cached_fp.clone(),
        "cached",
        std::collections::BTreeMap::from([("out".to_string(), kept.clone())]),
        crate::store::ResultOrigin::Built,
      ))
      .unwrap();
    let cached_log = f.store.write_log(&cached_fp, b"ok\n").unwrap();

    let running_fp = crate::util::hash::hash_bytes(b"running");
    let running = StorePath::from_fingerprint(&running_fp, "running.recipe").unwrap();
    let building = f.locks.acquire(&running, LockMode::Exclusive).unwrap();
    let running_log = f.store.write_log(&running_fp, b"compiling\n").unwrap();

    let object_lock = f.locks.acquire(&kept, LockMode::Shared).unwrap();
    drop(object_lock);

    let result = collect_garbage(&f.store, &f.locks, &GcOptions::default()).unwrap();

    assert_eq!(result.stats.stale_locks, 1);
    assert_eq!(result.stats.stale_logs, 1);
    assert!(!f.locks.lock_file(&finished).exists());
    assert!(!f.store.log_path(&finished_fp).exists());
    assert!(f.locks.lock_file(&running).exists());
    assert!(running_log.exists());
    assert!(cached_log.exists());
    assert!(f.locks.lock_file(&kept).exists());

    drop(building);
    let result = collect_garbage(&f.store, &f.locks, &GcOptions::default()).unwrap();
    assert_eq!(result.stats.stale_locks, 1);
    assert_eq!(result.stats.stale_logs, 1);
    assert!(!running_log.exists());
    assert!(cached_log.exists());
  }
}
