//! Persisted build results and build logs.
//!
//! A successful realization is recorded under `results/<fingerprint>.json`,
//! keyed by the recipe fingerprint. A record is only honored while every
//! output it names is still a valid store object.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Store, StoreError, StorePath};
use crate::util::fs::write_json_atomic;
use crate::util::hash::Fingerprint;
use crate::util::unix_now;

/// How a recorded result was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultOrigin {
  Built,
  Substituted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
  pub fingerprint: Fingerprint,
  /// Recipe id in the graph that produced this record. Informational only.
  pub recipe: String,
  pub outputs: BTreeMap<String, StorePath>,
  pub origin: ResultOrigin,
  pub created_at: u64,
}

impl ResultRecord {
  pub fn new(
    fingerprint: Fingerprint,
    recipe: impl Into<String>,
    outputs: BTreeMap<String, StorePath>,
    origin: ResultOrigin,
  ) -> Self {
    Self {
      fingerprint,
      recipe: recipe.into(),
      outputs,
      origin,
      created_at: unix_now(),
    }
  }
}

impl Store {
  fn result_path(&self, fingerprint: &Fingerprint) -> PathBuf {
    self.results_dir().join(format!("{}.json", fingerprint))
  }

  pub fn log_path(&self, fingerprint: &Fingerprint) -> PathBuf {
    self.logs_dir().join(format!("{}.log", fingerprint))
  }

  pub fn write_result(&self, record: &ResultRecord) -> Result<(), StoreError> {
    let path = self.result_path(&record.fingerprint);
    write_json_atomic(&path, record).map_err(|source| StoreError::Io { path, source })
  }

  /// Read a persisted record without checking its outputs.
  pub fn read_result(&self, fingerprint: &Fingerprint) -> Result<Option<ResultRecord>, StoreError> {
    let path = self.result_path(fingerprint);
    let content = match fs::read_to_string(&path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(source) => return Err(StoreError::Io { path, source }),
    };
    serde_json::from_str(&content)
      .map(Some)
      .map_err(|source| StoreError::Metadata { path, source })
  }

  /// A persisted record whose outputs all still exist.
  ///
  /// Unreadable records and records with missing outputs count as a miss.
  pub fn valid_result(&self, fingerprint: &Fingerprint) -> Option<ResultRecord> {
    let record = match self.read_result(fingerprint) {
      Ok(Some(record)) => record,
      Ok(None) => return None,
      Err(e) => {
        warn!(fingerprint = %fingerprint.short(), error = %e, "ignoring unreadable build result");
        return None;
      }
    };

    if let Some((output, path)) = record.outputs.iter().find(|(_, path)| !self.exists(path)) {
      debug!(fingerprint = %fingerprint.short(), output, path = %path, "cached result has missing output");
      return None;
    }

    Some(record)
  }

  /// Result records that can no longer be honored.
  pub fn stale_results(&self) -> Result<Vec<PathBuf>, StoreError> {
    let dir = self.results_dir();
    let io_err = |source| StoreError::Io {
      path: dir.clone(),
      source,
    };

    let mut stale = Vec::new();
    for entry in fs::read_dir(&dir).map_err(io_err)? {
      let entry = entry.map_err(io_err)?;
      let file_name = entry.file_name();
      let Some(fingerprint) = file_name.to_str().and_then(|n| n.strip_suffix(".json")) else {
        continue;
      };
      if self.valid_result(&Fingerprint(fingerprint.to_string())).is_none() {
        stale.push(entry.path());
      }
    }

    stale.sort();
    Ok(stale)
  }

  /// Store captured build output. Overwrites the log of a previous attempt.
  pub fn write_log(&self, fingerprint: &Fingerprint, log: &[u8]) -> Result<PathBuf, StoreError> {
    let path = self.log_path(fingerprint);
    fs::write(&path, log).map_err(|source| StoreError::Io {
      path: path.clone(),
      source,
    })?;
    Ok(path)
  }
}
