use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::path::StorePath;
use super::StoreError;
use crate::util::hash::{Fingerprint, hash_bytes};

/// Type tag of an artifact; part of its fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
  File,
  Executable,
  Tree,
}

impl fmt::Display for ArtifactKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let tag = match self {
      ArtifactKind::File => "file",
      ArtifactKind::Executable => "executable",
      ArtifactKind::Tree => "tree",
    };
    f.write_str(tag)
  }
}

/// Content handed to [`Store::put`](super::Store::put).
#[derive(Debug, Clone)]
pub enum Content {
  Bytes { data: Vec<u8>, executable: bool },
  Tree(PathBuf),
}

impl Content {
  pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
    Content::Bytes {
      data: data.into(),
      executable: false,
    }
  }
}

/// Metadata recorded for every valid store object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactInfo {
  pub path: StorePath,
  pub fingerprint: Fingerprint,
  pub kind: ArtifactKind,
  /// Store paths this artifact depends on. Followed by the garbage collector.
  pub references: BTreeSet<StorePath>,
  /// Total size of the regular files in bytes.
  pub size: u64,
  /// Fingerprint of the recipe that produced this artifact, if any.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub deriver: Option<Fingerprint>,
  pub registered_at: u64,
}

/// Compute the fingerprint of an artifact.
///
/// Covers the name, the type tag, the content digest and the sorted references.
pub fn content_fingerprint(
  name: &str,
  kind: ArtifactKind,
  content: &Fingerprint,
  references: &BTreeSet<StorePath>,
) -> Fingerprint {
  let mut record = format!("kiln-artifact:{}:{}:{}", kind, content, name);
  for reference in references {
    record.push(':');
    record.push_str(&reference.to_string());
  }
  hash_bytes(record.as_bytes())
}

/// A valid artifact in the store.
#[derive(Debug, Clone)]
pub struct Artifact {
  pub info: ArtifactInfo,
  location: PathBuf,
}

impl Artifact {
  pub(super) fn new(info: ArtifactInfo, location: PathBuf) -> Self {
    Self { info, location }
  }

  pub fn path(&self) -> &StorePath {
    &self.info.path
  }

  pub fn kind(&self) -> ArtifactKind {
    self.info.kind
  }

  /// The object's location on disk.
  pub fn location(&self) -> &Path {
    &self.location
  }

  /// Read the bytes of a file artifact.
  pub fn read_bytes(&self) -> Result<Vec<u8>, StoreError> {
    if self.info.kind == ArtifactKind::Tree {
      return Err(StoreError::NotAFile(self.info.path.clone()));
    }
    std::fs::read(&self.location).map_err(|e| StoreError::Io {
      path: self.location.clone(),
      source: e,
    })
  }
}
