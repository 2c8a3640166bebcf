//! The store-wide lock at `<store>/.lock`.
//!
//! A collection holds it exclusively from the first mark to the last sweep.
//! Anything that must not interleave with a collection takes it shared for
//! as long as it needs: registering temporary roots, rooting a fresh result.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, trace};

use super::{LockMetadata, LockMode, flock, read_metadata, write_metadata};

const LOCK_FILE: &str = ".lock";

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error(
    "store {} is busy: {}\nif no kiln process is running, delete {}",
    .store.display(),
    describe_holder(.holder),
    .lock_path.display()
  )]
  Busy {
    store: PathBuf,
    lock_path: PathBuf,
    holder: Option<LockMetadata>,
  },

  #[error("store lock i/o error at {}: {source}", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn describe_holder(holder: &Option<LockMetadata>) -> String {
  let Some(holder) = holder else {
    return "the holder left no record".to_string();
  };
  let since = UNIX_EPOCH + Duration::from_secs(holder.started_at_unix);
  format!(
    "`{}` (PID {}) holds it since {}",
    holder.command,
    holder.pid,
    humantime::format_rfc3339_seconds(since)
  )
}

/// A held store lock. Released when dropped.
#[derive(Debug)]
pub struct StoreLock {
  file: File,
  mode: LockMode,
  lock_path: PathBuf,
}

impl StoreLock {
  /// Fail with [`StoreLockError::Busy`] instead of waiting.
  pub fn acquire(store: &Path, mode: LockMode, command: &str) -> Result<Self, StoreLockError> {
    Self::take(store, mode, command, false)
  }

  /// Wait until no conflicting holder is left.
  pub fn wait(store: &Path, mode: LockMode, command: &str) -> Result<Self, StoreLockError> {
    Self::take(store, mode, command, true)
  }

  fn take(store: &Path, mode: LockMode, command: &str, blocking: bool) -> Result<Self, StoreLockError> {
    let lock_path = store.join(LOCK_FILE);
    let io_err = |source| StoreLockError::Io {
      path: lock_path.clone(),
      source,
    };

    std::fs::create_dir_all(store).map_err(io_err)?;
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(io_err)?;

    match flock(&file, mode, blocking) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
        trace!(store = %store.display(), ?mode, "store lock is busy");
        return Err(StoreLockError::Busy {
          store: store.to_path_buf(),
          lock_path: lock_path.clone(),
          holder: read_metadata(&file),
        });
      }
      Err(e) => return Err(io_err(e)),
    }

    // Only the exclusive holder owns the record.
    if mode == LockMode::Exclusive {
      write_metadata(&file, &LockMetadata::current(command)).map_err(io_err)?;
    }

    debug!(store = %store.display(), ?mode, command, "took store lock");
    Ok(Self { file, mode, lock_path })
  }

  /// The holder record, read through the held handle.
  pub fn holder(&self) -> Option<LockMetadata> {
    read_metadata(&self.file)
  }

  pub fn mode(&self) -> LockMode {
    self.mode
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}
