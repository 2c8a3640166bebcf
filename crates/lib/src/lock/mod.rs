//! Advisory locking.
//!
//! Two kinds of locks protect a store shared by several processes:
//!
//! - [`PathLock`]: one lock file per store path under `locks/`. At most one
//!   builder realizes a given path at a time; the garbage collector takes the
//!   exclusive lock before deleting.
//! - [`StoreLock`]: the store-wide `.lock`, held exclusively by the garbage
//!   collector and briefly shared by builders registering temporary roots.
//!
//! Both use `flock(2)`, so the kernel releases them when the holder exits.
//! A lock file that still carries holder metadata naming a dead process was
//! abandoned by a crashed builder; acquiring it reports the recovery.

mod store_lock;

pub use store_lock::*;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::store::{Store, StorePath};
use crate::util::unix_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

/// Holder information written into exclusively held lock files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub command: String,
}

impl LockMetadata {
  pub fn current(command: &str) -> Self {
    Self {
      version: 1,
      pid: std::process::id(),
      started_at_unix: unix_now(),
      command: command.to_string(),
    }
  }
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error("store path {path} is locked by another process{}", holder_suffix(.holder))]
  WouldBlock { path: StorePath, holder: Option<u32> },

  #[error("lock i/o error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("lock task failed: {0}")]
  Join(String),
}

fn holder_suffix(holder: &Option<u32>) -> String {
  match holder {
    Some(pid) => format!(" (PID {})", pid),
    None => String::new(),
  }
}

/// Hands out per-path locks for one store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LockManager {
  dir: PathBuf,
  command: String,
}

impl LockManager {
  pub fn new(store: &Store) -> Self {
    Self {
      dir: store.locks_dir(),
      command: "build".to_string(),
    }
  }

  /// Label recorded as the holder's command in lock metadata.
  pub fn with_command(mut self, command: &str) -> Self {
    self.command = command.to_string();
    self
  }

  pub fn lock_file(&self, path: &StorePath) -> PathBuf {
    self.dir.join(format!("{}.lock", path))
  }

  /// Block until the lock for `path` is held.
  pub fn acquire(&self, path: &StorePath, mode: LockMode) -> Result<PathLock, LockError> {
    self.lock(path, mode, true)
  }

  /// Take the lock for `path` or fail with [`LockError::WouldBlock`].
  pub fn try_acquire(&self, path: &StorePath, mode: LockMode) -> Result<PathLock, LockError> {
    self.lock(path, mode, false)
  }

  /// [`LockManager::acquire`] on the blocking thread pool.
  pub async fn acquire_async(&self, path: &StorePath, mode: LockMode) -> Result<PathLock, LockError> {
    let manager = self.clone();
    let path = path.clone();
    tokio::task::spawn_blocking(move || manager.acquire(&path, mode))
      .await
      .map_err(|e| LockError::Join(e.to_string()))?
  }

  fn lock(&self, path: &StorePath, mode: LockMode, blocking: bool) -> Result<PathLock, LockError> {
    let lock_path = self.lock_file(path);
    let io_err = |source| LockError::Io {
      path: lock_path.clone(),
      source,
    };

    loop {
      let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(io_err)?;

      if let Err(err) = flock(&file, mode, blocking) {
        if err.kind() == io::ErrorKind::WouldBlock {
          let holder = read_metadata(&file).map(|m| m.pid);
          return Err(LockError::WouldBlock {
            path: path.clone(),
            holder,
          });
        }
        return Err(io_err(err));
      }

      // The previous holder may have deleted the file while we waited; our lock
      // would then protect nothing.
      if is_unlinked(&file).map_err(io_err)? {
        trace!(path = %path, "lock file was removed while waiting, retrying");
        continue;
      }

      let mut recovered_stale = false;
      if mode == LockMode::Exclusive {
        if let Some(previous) = read_metadata(&file)
          && previous.pid != std::process::id()
          && !process_alive(previous.pid)
        {
          warn!(
            path = %path,
            pid = previous.pid,
            command = %previous.command,
            "recovered stale lock left by a dead process"
          );
          recovered_stale = true;
        }
        write_metadata(&file, &LockMetadata::current(&self.command)).map_err(io_err)?;
      }

      debug!(path = %path, ?mode, "acquired path lock");
      return Ok(PathLock {
        file,
        path: path.clone(),
        mode,
        lock_path,
        recovered_stale,
      });
    }
  }
}

/// A held path lock. Released on drop.
#[derive(Debug)]
pub struct PathLock {
  file: File,
  path: StorePath,
  mode: LockMode,
  lock_path: PathBuf,
  recovered_stale: bool,
}

impl PathLock {
  pub fn path(&self) -> &StorePath {
    &self.path
  }

  pub fn mode(&self) -> LockMode {
    self.mode
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }

  /// Whether this acquisition took over a lock abandoned by a dead process.
  pub fn recovered_stale(&self) -> bool {
    self.recovered_stale
  }

  /// Remove the lock file and release the lock. Waiters notice the unlink and
  /// retry on a fresh file.
  pub fn unlink(self) -> Result<(), LockError> {
    match std::fs::remove_file(&self.lock_path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(source) => Err(LockError::Io {
        path: self.lock_path.clone(),
        source,
      }),
    }
  }
}

impl Drop for PathLock {
  fn drop(&mut self) {
    // A clean release leaves no holder behind; only crashed holders do.
    if self.mode == LockMode::Exclusive {
      let _ = self.file.set_len(0);
    }
    trace!(path = %self.path, "released path lock");
  }
}

fn read_metadata(file: &File) -> Option<LockMetadata> {
  let mut file = file;
  file.seek(SeekFrom::Start(0)).ok()?;
  let mut contents = String::new();
  file.read_to_string(&mut contents).ok()?;
  serde_json::from_str(&contents).ok()
}

fn write_metadata(file: &File, metadata: &LockMetadata) -> io::Result<()> {
  file.set_len(0)?;
  let mut writer = io::BufWriter::new(file);
  writer.seek(SeekFrom::Start(0))?;
  serde_json::to_writer_pretty(&mut writer, metadata).map_err(io::Error::other)?;
  writer.flush()
}

#[cfg(unix)]
pub(crate) fn flock(file: &File, mode: LockMode, blocking: bool) -> io::Result<()> {
  use rustix::fs::FlockOperation;
  use std::os::unix::io::AsFd;

  let operation = match (mode, blocking) {
    (LockMode::Shared, true) => FlockOperation::LockShared,
    (LockMode::Exclusive, true) => FlockOperation::LockExclusive,
    (LockMode::Shared, false) => FlockOperation::NonBlockingLockShared,
    (LockMode::Exclusive, false) => FlockOperation::NonBlockingLockExclusive,
  };

  rustix::fs::flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(not(unix))]
pub(crate) fn flock(_file: &File, _mode: LockMode, _blocking: bool) -> io::Result<()> {
  Err(io::Error::new(io::ErrorKind::Unsupported, "file locking requires a unix platform"))
}

#[cfg(unix)]
fn is_unlinked(file: &File) -> io::Result<bool> {
  use std::os::unix::io::AsFd;

  let stat = rustix::fs::fstat(file.as_fd()).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))?;
  Ok(stat.st_nlink == 0)
}

#[cfg(not(unix))]
fn is_unlinked(_file: &File) -> io::Result<bool> {
  Ok(false)
}

/// Whether a process with this pid exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
  use nix::errno::Errno;
  use nix::sys::signal::kill;
  use nix::unistd::Pid;

  let Ok(raw) = i32::try_from(pid) else {
    return false;
  };
  match kill(Pid::from_raw(raw), None) {
    Ok(()) => true,
    Err(Errno::EPERM) => true,
    Err(_) => false,
  }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
  true
}
