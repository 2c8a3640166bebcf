//! Substituters: sources of prebuilt outputs.
//!
//! A substituter answers two questions: "is there a realisation for this
//! recipe fingerprint" and "give me the bytes of this store path". Both a
//! local directory and an HTTP server use the same layout:
//!
//! ```text
//! realisations/<recipe fingerprint>.json
//! objects/<store path>.tar
//! ```
//!
//! Nothing fetched is trusted: every object is unpacked into staging,
//! re-fingerprinted with the advertised references and compared with the
//! advertised fingerprint before it is committed.

mod http;
mod local;

pub use http::HttpCache;
pub use local::LocalCache;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::gc::{GcError, RootGuard, commit_staged};
use crate::store::archive::unpack_archive;
use crate::store::{StagedObject, Store, StoreError, StorePath};
use crate::util::hash::Fingerprint;

/// One output as advertised by a substituter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealisedOutput {
  pub path: StorePath,
  pub fingerprint: Fingerprint,
  #[serde(default)]
  pub references: BTreeSet<StorePath>,
}

/// The outputs of one recipe fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Realisation {
  pub outputs: BTreeMap<String, RealisedOutput>,
}

#[derive(Debug, Error)]
pub enum SubstituteError {
  #[error("unsupported substituter url '{0}'")]
  InvalidUrl(String),

  #[error("substituter {0} is read-only")]
  ReadOnly(String),

  #[error("{path} not available from substituter")]
  NotFound { path: StorePath },

  #[error("realisation is missing output '{0}'")]
  Incomplete(String),

  #[error("fetched {path} is corrupt: expected {expected}, got {actual}")]
  Corrupt {
    path: StorePath,
    expected: String,
    actual: String,
  },

  #[error("{path} references {reference} which is not in the local store")]
  MissingReference { path: StorePath, reference: StorePath },

  #[error("request to {url} failed: {source}")]
  Http {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("request to {url} returned HTTP {status}")]
  Status { url: String, status: u16 },

  #[error("invalid realisation from {location}: {source}")]
  Decode {
    location: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("substituter i/o error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Commit(#[from] GcError),

  #[error("substitution task failed: {0}")]
  Join(String),
}

/// A configured substituter. Tried in configuration order.
#[derive(Debug, Clone)]
pub enum Substituter {
  Local(LocalCache),
  Http(HttpCache),
}

impl Substituter {
  /// Parse `file://<dir>`, `http(s)://<url>` or an absolute directory path.
  pub fn from_url(url: &str) -> Result<Self, SubstituteError> {
    if let Some(dir) = url.strip_prefix("file://") {
      return Ok(Substituter::Local(LocalCache::new(dir)));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
      return Ok(Substituter::Http(HttpCache::new(url)));
    }
    if url.starts_with('/') {
      return Ok(Substituter::Local(LocalCache::new(url)));
    }
    Err(SubstituteError::InvalidUrl(url.to_string()))
  }

  pub fn url(&self) -> String {
    match self {
      Substituter::Local(cache) => format!("file://{}", cache.root().display()),
      Substituter::Http(cache) => cache.base_url().to_string(),
    }
  }

  pub fn is_writable(&self) -> bool {
    matches!(self, Substituter::Local(_))
  }

  pub async fn query(&self, fingerprint: &Fingerprint) -> Result<Option<Realisation>, SubstituteError> {
    match self {
      Substituter::Local(cache) => cache.query(fingerprint).await,
      Substituter::Http(cache) => cache.query(fingerprint).await,
    }
  }

  pub async fn fetch(&self, path: &StorePath) -> Result<Vec<u8>, SubstituteError> {
    match self {
      Substituter::Local(cache) => cache.fetch(path).await,
      Substituter::Http(cache) => cache.fetch(path).await,
    }
  }

  /// Upload the outputs of a recipe.
  pub async fn push(
    &self,
    store: &Store,
    fingerprint: &Fingerprint,
    outputs: &BTreeMap<String, StorePath>,
  ) -> Result<(), SubstituteError> {
    match self {
      Substituter::Local(cache) => cache.push(store, fingerprint, outputs).await,
      Substituter::Http(_) => Err(SubstituteError::ReadOnly(self.url())),
    }
  }

  /// Fetch, verify and commit the outputs of `fingerprint`.
  ///
  /// Returns `Ok(None)` on a miss. Nothing is committed unless every output
  /// verifies. With a `guard`, committed and already present outputs are
  /// pinned as temp roots.
  pub async fn substitute(
    &self,
    store: &Store,
    fingerprint: &Fingerprint,
    slots: &[String],
    guard: Option<&RootGuard>,
  ) -> Result<Option<BTreeMap<String, StorePath>>, SubstituteError> {
    let Some(realisation) = self.query(fingerprint).await? else {
      debug!(substituter = %self.url(), fingerprint = %fingerprint.short(), "substituter miss");
      return Ok(None);
    };

    // Staging directories must outlive the commit below.
    let mut staging = Vec::new();
    let mut staged: Vec<(String, Option<StagedObject>, StorePath)> = Vec::new();

    for slot in slots {
      let output = realisation
        .outputs
        .get(slot)
        .ok_or_else(|| SubstituteError::Incomplete(slot.clone()))?;

      if let Some(reference) = output.references.iter().find(|r| !store.exists(r)) {
        return Err(SubstituteError::MissingReference {
          path: output.path.clone(),
          reference: reference.clone(),
        });
      }

      if store.exists(&output.path) {
        debug!(path = %output.path, "already present, not fetching");
        staged.push((slot.clone(), None, output.path.clone()));
        continue;
      }

      let bytes = self.fetch(&output.path).await?;
      let dir = store.staging_dir("substitute-")?;
      let unpacked = unpack_archive(&bytes, dir.path())?;
      let object = store.fingerprint_staged(output.path.name(), &unpacked, &output.references)?;

      if object.fingerprint != output.fingerprint || object.path != output.path {
        warn!(
          substituter = %self.url(),
          path = %output.path,
          expected = %output.fingerprint,
          actual = %object.fingerprint,
          "discarding corrupt substitute"
        );
        return Err(SubstituteError::Corrupt {
          path: output.path.clone(),
          expected: output.fingerprint.to_string(),
          actual: object.fingerprint.to_string(),
        });
      }

      staging.push(dir);
      staged.push((slot.clone(), Some(object), output.path.clone()));
    }

    let mut outputs = BTreeMap::new();
    let mut present = BTreeSet::new();
    let mut objects = Vec::new();
    for (slot, object, path) in staged {
      match object {
        Some(object) => objects.push(object),
        None => {
          present.insert(path.clone());
        }
      }
      outputs.insert(slot, path);
    }

    // Committing may wait on path locks and the store lock.
    let store = store.clone();
    let guard = guard.cloned();
    let deriver = Some(fingerprint.clone());
    let pinned = tokio::task::spawn_blocking(move || {
      commit_staged(&store, guard.as_ref(), objects, deriver)?;
      match &guard {
        Some(guard) => guard.pin(&store, &present),
        None => Ok(present.iter().all(|p| store.exists(p))),
      }
    })
    .await
    .map_err(|e| SubstituteError::Join(e.to_string()))??;
    drop(staging);

    if !pinned {
      debug!(substituter = %self.url(), "output vanished while substituting");
      return Ok(None);
    }

    info!(substituter = %self.url(), fingerprint = %fingerprint.short(), "substituted outputs");
    Ok(Some(outputs))
  }
}

/// Describe the given outputs for publication.
pub(crate) fn realisation_for(
  store: &Store,
  outputs: &BTreeMap<String, StorePath>,
) -> Result<Realisation, StoreError> {
  let mut realised = BTreeMap::new();
  for (slot, path) in outputs {
    let info = store.query_info(path)?;
    realised.insert(
      slot.clone(),
      RealisedOutput {
        path: info.path,
        fingerprint: info.fingerprint,
        references: info.references,
      },
    );
  }
  Ok(Realisation { outputs: realised })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::Content;
  use crate::util::hash::hash_bytes;
  use tempfile::TempDir;

  struct Fixture {
    _temp: TempDir,
    upstream: Store,
    local: Store,
    cache: Substituter,
  }

  fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let upstream = Store::open(temp.path().join("upstream")).unwrap();
    let local = Store::open(temp.path().join("local")).unwrap();
    let cache = Substituter::from_url(&format!("file://{}", temp.path().join("cache").display())).unwrap();
    Fixture {
      _temp: temp,
      upstream,
      local,
      cache,
    }
  }

  #[test]
  fn parses_urls() {
    assert!(matches!(Substituter::from_url("file:///srv/cache"), Ok(Substituter::Local(_))));
    assert!(matches!(Substituter::from_url("/srv/cache"), Ok(Substituter::Local(_))));
    assert!(matches!(
      Substituter::from_url("https://cache.example.org"),
      Ok(Substituter::Http(_))
    ));
    assert!(matches!(
      Substituter::from_url("s3://bucket"),
      Err(SubstituteError::InvalidUrl(_))
    ));
  }

  #[tokio::test]
  async fn pushed_outputs_can_be_substituted() {
    let f = fixture();
    let fp = hash_bytes(b"recipe");
    let out = f.upstream.put("hello", Content::bytes("hi"), &BTreeSet::new()).unwrap();
    let outputs = BTreeMap::from([("out".to_string(), out.clone())]);

    f.cache.push(&f.upstream, &fp, &outputs).await.unwrap();
    let got = f.cache.substitute(&f.local, &fp, &["out".to_string()], None).await.unwrap();

    assert_eq!(got, Some(outputs));
    assert_eq!(f.local.get(&out).unwrap().read_bytes().unwrap(), b"hi");
    assert_eq!(f.local.query_info(&out).unwrap().deriver, Some(fp));
  }

  #[tokio::test]
  async fn miss_is_none() {
    let f = fixture();
    let got = f
      .cache
      .substitute(&f.local, &hash_bytes(b"unknown"), &["out".to_string()], None)
      .await
      .unwrap();
    assert_eq!(got, None);
  }

  #[tokio::test]
  async fn corrupt_object_is_rejected() {
    let f = fixture();
    let fp = hash_bytes(b"recipe");
    let out = f.upstream.put("hello", Content::bytes("hi"), &BTreeSet::new()).unwrap();
    let outputs = BTreeMap::from([("out".to_string(), out.clone())]);
    f.cache.push(&f.upstream, &fp, &outputs).await.unwrap();

    // Replace the archive with one holding different bytes.
    let evil = f.upstream.put("evil", Content::bytes("pwned"), &BTreeSet::new()).unwrap();
    let bytes = crate::store::archive::export_archive(&f.upstream, &evil).unwrap();
    let Substituter::Local(cache) = &f.cache else { unreachable!() };
    std::fs::write(cache.object_file(&out), bytes).unwrap();

    let err = f.cache.substitute(&f.local, &fp, &["out".to_string()], None).await.unwrap_err();
    assert!(matches!(err, SubstituteError::Corrupt { .. }));
    assert!(!f.local.exists(&out));
    assert!(f.local.list().unwrap().is_empty());
  }

  #[tokio::test]
  async fn references_must_be_local() {
    let f = fixture();
    let fp = hash_bytes(b"recipe");
    let dep = f.upstream.put("dep", Content::bytes("dep"), &BTreeSet::new()).unwrap();
    let out = f
      .upstream
      .put("top", Content::bytes("top"), &BTreeSet::from([dep.clone()]))
      .unwrap();
    f.cache
      .push(&f.upstream, &fp, &BTreeMap::from([("out".to_string(), out)]))
      .await
      .unwrap();

    let err = f.cache.substitute(&f.local, &fp, &["out".to_string()], None).await.unwrap_err();
    assert!(matches!(err, SubstituteError::MissingReference { reference, .. } if reference == dep));
  }

  #[tokio::test]
  async fn incomplete_realisation_is_an_error() {
    let f = fixture();
    let fp = hash_bytes(b"recipe");
    let out = f.upstream.put("hello", Content::bytes("hi"), &BTreeSet::new()).unwrap();
    f.cache
      .push(&f.upstream, &fp, &BTreeMap::from([("out".to_string(), out)]))
      .await
      .unwrap();

    let err = f
      .cache
      .substitute(&f.local, &fp, &["out".to_string(), "doc".to_string()], None)
      .await
      .unwrap_err();
    assert!(matches!(err, SubstituteError::Incomplete(slot) if slot == "doc"));
  }
}
