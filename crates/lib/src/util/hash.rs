//! SHA-256 fingerprints of bytes, files, trees and serializable definitions.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::consts::OBJ_HASH_PREFIX_LEN;

pub type HashError = serde_json::Error;

/// A full SHA-256 digest in lowercase hex.
///
/// Names both artifact contents and recipe identities.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
  fn from_digest(hasher: Sha256) -> Self {
    Fingerprint(hex::encode(hasher.finalize()))
  }

  /// The leading characters used as the hash part of a store path.
  pub fn short(&self) -> &str {
    &self.0[..OBJ_HASH_PREFIX_LEN.min(self.0.len())]
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Definitions identified by their JSON form. Implementors keep that form
/// deterministic: ordered maps, no floats.
pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<Fingerprint, HashError> {
    let mut hasher = Sha256::new();
    serde_json::to_writer(&mut hasher, self)?;
    Ok(Fingerprint::from_digest(hasher))
  }
}

#[derive(Debug, thiserror::Error)]
pub enum DirHashError {
  #[error("cannot walk tree: {0}")]
  Walk(#[from] walkdir::Error),

  #[error("cannot read {}: {source}", .path.display())]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("{} is not a file, directory or symlink", .0.display())]
  Unsupported(PathBuf),
}

/// Fingerprint a directory tree.
///
/// Every entry below `root` becomes one record, and the records are hashed in
/// order of their raw relative path bytes:
///
/// ```text
/// D <path>
/// F <path> <x|-> <content sha256>
/// L <path> <link target>
/// ```
///
/// The first byte is the entry kind; every following field is its length as
/// a little-endian `u64` followed by its raw bytes, so no file name can be
/// mistaken for a field or record boundary. Paths are `/`-separated and not
/// reencoded.
///
/// Only the executable bit of a file's mode counts. Timestamps, ownership and
/// creation order do not, so equal trees fingerprint equally wherever they
/// were built. Sockets, fifos and devices are rejected.
pub fn hash_tree(root: &Path) -> Result<Fingerprint, DirHashError> {
  let mut records: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();

  for entry in WalkDir::new(root).min_depth(1) {
    let entry = entry?;
    let path = entry.path();
    let rel = path_bytes(path.strip_prefix(root).unwrap_or(path));
    let kind = entry.file_type();

    let mut record = Vec::new();
    if kind.is_dir() {
      record.push(b'D');
      push_field(&mut record, &rel);
    } else if kind.is_symlink() {
      let target = fs::read_link(path).map_err(|source| DirHashError::Read {
        path: path.to_path_buf(),
        source,
      })?;
      record.push(b'L');
      push_field(&mut record, &rel);
      push_field(&mut record, &path_bytes(&target));
    } else if kind.is_file() {
      let mode: &[u8] = if is_executable(path) { b"x" } else { b"-" };
      record.push(b'F');
      push_field(&mut record, &rel);
      push_field(&mut record, mode);
      push_field(&mut record, hash_file(path)?.as_str().as_bytes());
    } else {
      return Err(DirHashError::Unsupported(path.to_path_buf()));
    }

    records.push((rel, record));
  }

  records.sort_unstable_by(|a, b| a.0.cmp(&b.0));
  let mut tree = Sha256::new();
  for (_, record) in &records {
    tree.update(record);
  }
  Ok(Fingerprint::from_digest(tree))
}

fn push_field(record: &mut Vec<u8>, field: &[u8]) {
  record.extend_from_slice(&(field.len() as u64).to_le_bytes());
  record.extend_from_slice(field);
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> Vec<u8> {
  use std::os::unix::ffi::OsStrExt;
  path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Vec<u8> {
  path.to_string_lossy().replace('\\', "/").into_bytes()
}

/// Fingerprint a file's contents.
pub fn hash_file(path: &Path) -> Result<Fingerprint, DirHashError> {
  let read_err = |source| DirHashError::Read {
    path: path.to_path_buf(),
    source,
  };
  let mut file = File::open(path).map_err(read_err)?;
  let mut hasher = Sha256::new();
  io::copy(&mut file, &mut hasher).map_err(read_err)?;
  Ok(Fingerprint::from_digest(hasher))
}

pub fn hash_bytes(data: &[u8]) -> Fingerprint {
  Fingerprint::from_digest(Sha256::new_with_prefix(data))
}

/// Whether any executable bit is set. Symlinks are not followed.
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
  use std::os::unix::fs::PermissionsExt;
  fs::symlink_metadata(path).is_ok_and(|m| m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
pub fn is_executable(_path: &Path) -> bool {
  false
}
