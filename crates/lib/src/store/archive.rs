//! Tar transfer format for store objects.
//!
//! An archive holds a single top-level entry named `content`: the file itself
//! for file artifacts, or the root directory for trees. Entries are written in
//! sorted order with deterministic headers (zeroed mtime and ownership, mode
//! reduced to 0644/0755) and symlinks are stored as links.

use std::path::{Path, PathBuf};

use tar::{Archive, Builder, HeaderMode};
use walkdir::WalkDir;

use super::{Store, StoreError, StorePath};

const ROOT_ENTRY: &str = "content";

fn archive_err(e: impl std::fmt::Display) -> StoreError {
  StoreError::Archive(e.to_string())
}

/// Serialize a store object into a tar stream.
pub fn export_archive(store: &Store, path: &StorePath) -> Result<Vec<u8>, StoreError> {
  let artifact = store.get(path)?;
  let location = artifact.location();

  let mut builder = Builder::new(Vec::new());
  builder.mode(HeaderMode::Deterministic);
  builder.follow_symlinks(false);

  for entry in WalkDir::new(location).sort_by_file_name() {
    let entry = entry.map_err(archive_err)?;
    let rel = entry.path().strip_prefix(location).map_err(archive_err)?;
    let name = Path::new(ROOT_ENTRY).join(rel);
    builder.append_path_with_name(entry.path(), &name).map_err(archive_err)?;
  }

  builder.into_inner().map_err(archive_err)
}

/// Unpack a tar stream produced by [`export_archive`] into `dest`.
///
/// Returns the location of the unpacked object, ready for
/// [`Store::add_staged`].
pub fn unpack_archive(bytes: &[u8], dest: &Path) -> Result<PathBuf, StoreError> {
  let mut archive = Archive::new(bytes);
  archive.set_preserve_mtime(false);
  archive.unpack(dest).map_err(archive_err)?;

  let root = dest.join(ROOT_ENTRY);
  if root.symlink_metadata().is_err() {
    return Err(StoreError::Archive(format!("archive has no '{}' entry", ROOT_ENTRY)));
  }
  Ok(root)
}
