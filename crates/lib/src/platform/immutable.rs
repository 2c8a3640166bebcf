//! Write protection for store objects.
//!
//! A sealed object has no write bits anywhere: regular files end up 0444,
//! directories and anything executable 0555. Symlinks carry no permissions
//! of their own and are skipped. Unsealing restores 0644/0755 so the tree
//! can be deleted.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum SealError {
  #[error("cannot walk {}: {source}", .path.display())]
  Walk {
    path: PathBuf,
    #[source]
    source: walkdir::Error,
  },
}

/// Strip write permission from every entry below `path`, children before
/// their directory.
pub fn seal(path: &Path) -> Result<(), SealError> {
  rewrite_modes(path, false)
}

/// Give write permission back, each directory before its children.
pub fn unseal(path: &Path) -> Result<(), SealError> {
  rewrite_modes(path, true)
}

/// A missing `path` is not an error. Entries whose mode cannot be changed
/// are logged and skipped; only a failed traversal aborts.
fn rewrite_modes(path: &Path, writable: bool) -> Result<(), SealError> {
  if path.symlink_metadata().is_err() {
    return Ok(());
  }
  debug!(path = %path.display(), writable, "rewriting store object modes");

  // Directories are sealed after their contents and unsealed before them.
  let walker = WalkDir::new(path).contents_first(!writable);
  for entry in walker {
    let entry = entry.map_err(|source| SealError::Walk {
      path: path.to_path_buf(),
      source,
    })?;
    if entry.path_is_symlink() {
      continue;
    }
    if let Err(e) = set_mode(entry.path(), writable) {
      warn!(path = %entry.path().display(), error = %e, writable, "cannot change mode");
    }
  }
  Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, writable: bool) -> io::Result<()> {
  use std::os::unix::fs::PermissionsExt;

  let mut permissions = std::fs::symlink_metadata(path)?.permissions();
  let current = permissions.mode();
  let executable = path.is_dir() || current & 0o111 != 0;
  let read = if executable { 0o555 } else { 0o444 };
  let owner_write = if writable { 0o200 } else { 0 };
  let mode = read | owner_write;
  if current & 0o777 == mode {
    return Ok(());
  }
  permissions.set_mode(mode);
  std::fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
fn set_mode(path: &Path, writable: bool) -> io::Result<()> {
  let mut permissions = std::fs::symlink_metadata(path)?.permissions();
  permissions.set_readonly(!writable);
  std::fs::set_permissions(path, permissions)
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use std::fs;
  use std::os::unix::fs::PermissionsExt;
  use tempfile::TempDir;

  fn mode(path: &Path) -> u32 {
    fs::symlink_metadata(path).unwrap().permissions().mode() & 0o777
  }

  fn object(temp: &TempDir) -> PathBuf {
    let root = temp.path().join("obj");
    fs::create_dir_all(root.join("bin")).unwrap();
    fs::write(root.join("README"), "docs").unwrap();
    fs::write(root.join("bin/tool"), "#!/bin/sh\n").unwrap();
    fs::set_permissions(root.join("bin/tool"), fs::Permissions::from_mode(0o755)).unwrap();
    std::os::unix::fs::symlink("bin/tool", root.join("tool")).unwrap();
    root
  }

  #[test]
  fn sealed_object_has_no_write_bits() {
    let temp = TempDir::new().unwrap();
    let root = object(&temp);

    seal(&root).unwrap();

    assert_eq!(mode(&root.join("README")), 0o444);
    assert_eq!(mode(&root.join("bin/tool")), 0o555);
    assert_eq!(mode(&root.join("bin")), 0o555);
    assert_eq!(mode(&root), 0o555);

    unseal(&root).unwrap();
  }

  #[test]
  fn unsealed_object_can_be_removed() {
    let temp = TempDir::new().unwrap();
    let root = object(&temp);

    seal(&root).unwrap();
    unseal(&root).unwrap();

    assert_eq!(mode(&root.join("README")), 0o644);
    assert_eq!(mode(&root.join("bin")), 0o755);
    fs::remove_dir_all(&root).unwrap();
  }

  #[test]
  fn single_file_objects_are_sealed() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("blob");
    fs::write(&file, "data").unwrap();

    seal(&file).unwrap();
    assert_eq!(mode(&file), 0o444);
    unseal(&file).unwrap();
    assert_eq!(mode(&file), 0o644);
  }

  #[test]
  fn missing_path_is_ignored() {
    let temp = TempDir::new().unwrap();
    seal(&temp.path().join("nope")).unwrap();
    unseal(&temp.path().join("nope")).unwrap();
  }
}
