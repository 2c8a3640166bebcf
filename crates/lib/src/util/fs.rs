//! Filesystem helpers shared by the store, sandbox and garbage collector.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;
use walkdir::WalkDir;

use crate::platform::immutable::unseal;

/// Write `value` as JSON to `path` atomically.
///
/// The content is written to a temporary file in the same directory and then
/// renamed over `path`, so readers never observe a partially written file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
  let dir = path
    .parent()
    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory"))?;

  let mut temp = tempfile::NamedTempFile::new_in(dir)?;
  serde_json::to_writer_pretty(&mut temp, value).map_err(io::Error::other)?;
  temp.write_all(b"\n")?;
  temp.as_file().sync_all()?;
  temp.persist(path).map_err(|e| e.error)?;
  Ok(())
}

/// Copy a file, directory tree or symlink from `src` to `dst`.
///
/// Symlinks are copied as links, file permissions are preserved and
/// directories are created writable.
pub fn copy_path(src: &Path, dst: &Path) -> io::Result<()> {
  let metadata = fs::symlink_metadata(src)?;

  if metadata.file_type().is_symlink() {
    return copy_symlink(src, dst);
  }

  if metadata.is_file() {
    fs::copy(src, dst)?;
    return Ok(());
  }

  fs::create_dir_all(dst)?;
  for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
    let entry = entry.map_err(io::Error::other)?;
    let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
    let target = dst.join(rel);
    let file_type = entry.file_type();

    if file_type.is_symlink() {
      copy_symlink(entry.path(), &target)?;
    } else if file_type.is_dir() {
      fs::create_dir_all(&target)?;
    } else if file_type.is_file() {
      fs::copy(entry.path(), &target)?;
    } else {
      return Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("unsupported file type at {}", entry.path().display()),
      ));
    }
  }

  Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
  let target = fs::read_link(src)?;
  std::os::unix::fs::symlink(target, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, _dst: &Path) -> io::Result<()> {
  Err(io::Error::new(
    io::ErrorKind::Unsupported,
    format!("symlinks are not supported: {}", src.display()),
  ))
}

/// Remove a file or directory tree, restoring write permissions first.
///
/// Missing paths are not an error.
pub fn remove_path(path: &Path) -> io::Result<()> {
  let metadata = match fs::symlink_metadata(path) {
    Ok(m) => m,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
    Err(e) => return Err(e),
  };

  if metadata.is_dir() {
    unseal(path).map_err(io::Error::other)?;
    fs::remove_dir_all(path)
  } else {
    fs::remove_file(path)
  }
}

/// Total size in bytes of the regular files under `path`.
pub fn dir_size(path: &Path) -> u64 {
  WalkDir::new(path)
    .into_iter()
    .filter_map(|e| e.ok())
    .filter(|e| e.file_type().is_file())
    .filter_map(|e| e.metadata().ok())
    .map(|m| m.len())
    .sum()
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn atomic_write_replaces_content() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("value.json");

    write_json_atomic(&path, &vec![1, 2, 3]).unwrap();
    write_json_atomic(&path, &vec![4]).unwrap();

    let parsed: Vec<i32> = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(parsed, vec![4]);
    assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);
  }

  #[test]
  fn copy_path_copies_nested_trees() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    fs::create_dir_all(src.join("a/b")).unwrap();
    fs::write(src.join("a/b/file"), "nested").unwrap();
    fs::write(src.join("top"), "top").unwrap();

    let dst = temp.path().join("dst");
    copy_path(&src, &dst).unwrap();

    assert_eq!(fs::read_to_string(dst.join("a/b/file")).unwrap(), "nested");
    assert_eq!(fs::read_to_string(dst.join("top")).unwrap(), "top");
  }

  #[test]
  fn remove_path_handles_missing_and_readonly() {
    let temp = TempDir::new().unwrap();
    assert!(remove_path(&temp.path().join("missing")).is_ok());

    let dir = temp.path().join("ro");
    fs::create_dir_all(dir.join("inner")).unwrap();
    fs::write(dir.join("inner/f"), "x").unwrap();
    crate::platform::immutable::seal(&dir).unwrap();

    remove_path(&dir).unwrap();
    assert!(!dir.exists());
  }

  #[test]
  fn dir_size_sums_files() {
    let temp = TempDir::new().unwrap();
    fs::write(temp.path().join("a"), "12345").unwrap();
    fs::create_dir(temp.path().join("sub")).unwrap();
    fs::write(temp.path().join("sub/b"), "123").unwrap();
    assert_eq!(dir_size(temp.path()), 8);
  }
}
