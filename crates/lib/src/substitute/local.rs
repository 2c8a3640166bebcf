//! A substituter backed by a local (or network-mounted) directory.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{Realisation, SubstituteError, realisation_for};
use crate::store::archive::export_archive;
use crate::store::{Store, StorePath};
use crate::util::fs::write_json_atomic;
use crate::util::hash::Fingerprint;

#[derive(Debug, Clone)]
pub struct LocalCache {
  root: PathBuf,
}

impl LocalCache {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn realisation_file(&self, fingerprint: &Fingerprint) -> PathBuf {
    self.root.join("realisations").join(format!("{}.json", fingerprint))
  }

  pub fn object_file(&self, path: &StorePath) -> PathBuf {
    self.root.join("objects").join(format!("{}.tar", path))
  }

  pub async fn query(&self, fingerprint: &Fingerprint) -> Result<Option<Realisation>, SubstituteError> {
    let file = self.realisation_file(fingerprint);
    let content = match tokio::fs::read(&file).await {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(source) => return Err(SubstituteError::Io { path: file, source }),
    };

    serde_json::from_slice(&content)
      .map(Some)
      .map_err(|source| SubstituteError::Decode {
        location: file.display().to_string(),
        source,
      })
  }

  pub async fn fetch(&self, path: &StorePath) -> Result<Vec<u8>, SubstituteError> {
    let file = self.object_file(path);
    match tokio::fs::read(&file).await {
      Ok(bytes) => Ok(bytes),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SubstituteError::NotFound { path: path.clone() }),
      Err(source) => Err(SubstituteError::Io { path: file, source }),
    }
  }

  /// Write archives for any outputs the cache lacks, then the realisation.
  ///
  /// The realisation goes last so readers never see one whose objects are
  /// missing.
  pub async fn push(
    &self,
    store: &Store,
    fingerprint: &Fingerprint,
    outputs: &BTreeMap<String, StorePath>,
  ) -> Result<(), SubstituteError> {
    for dir in ["realisations", "objects"] {
      let dir = self.root.join(dir);
      tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|source| SubstituteError::Io { path: dir, source })?;
    }

    for path in outputs.values() {
      let file = self.object_file(path);
      if tokio::fs::try_exists(&file).await.unwrap_or(false) {
        continue;
      }
      let bytes = export_archive(store, path)?;
      write_atomic(&file, &bytes).map_err(|source| SubstituteError::Io { path: file, source })?;
      debug!(path = %path, cache = %self.root.display(), "pushed object");
    }

    let realisation = realisation_for(store, outputs)?;
    let file = self.realisation_file(fingerprint);
    write_json_atomic(&file, &realisation).map_err(|source| SubstituteError::Io { path: file, source })?;
    Ok(())
  }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
  let dir = path
    .parent()
    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory"))?;
  let mut temp = tempfile::NamedTempFile::new_in(dir)?;
  temp.write_all(bytes)?;
  temp.persist(path).map_err(|e| e.error)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::Content;
  use crate::util::hash::hash_bytes;
  use std::collections::BTreeSet;
  use tempfile::TempDir;

  #[tokio::test]
  async fn push_writes_layout() {
    let temp = TempDir::new().unwrap();
    let store = Store::open(temp.path().join("store")).unwrap();
    let cache = LocalCache::new(temp.path().join("cache"));
    let fp = hash_bytes(b"recipe");
    let out = store.put("hello", Content::bytes("hi"), &BTreeSet::new()).unwrap();

    cache
      .push(&store, &fp, &BTreeMap::from([("out".to_string(), out.clone())]))
      .await
      .unwrap();

    assert!(cache.object_file(&out).is_file());
    let realisation = cache.query(&fp).await.unwrap().unwrap();
    assert_eq!(realisation.outputs["out"].path, out);
    assert_eq!(
      realisation.outputs["out"].fingerprint,
      store.query_info(&out).unwrap().fingerprint
    );
  }

  #[tokio::test]
  async fn fetch_of_unknown_path_is_not_found() {
    let temp = TempDir::new().unwrap();
    let cache = LocalCache::new(temp.path());
    let path = StorePath::from_fingerprint(&hash_bytes(b"x"), "x").unwrap();

    assert!(matches!(cache.fetch(&path).await, Err(SubstituteError::NotFound { .. })));
  }

  #[tokio::test]
  async fn garbage_realisation_is_a_decode_error() {
    let temp = TempDir::new().unwrap();
    let cache = LocalCache::new(temp.path());
    let fp = hash_bytes(b"recipe");
    std::fs::create_dir_all(temp.path().join("realisations")).unwrap();
    std::fs::write(cache.realisation_file(&fp), "nope").unwrap();

    assert!(matches!(cache.query(&fp).await, Err(SubstituteError::Decode { .. })));
  }
}
