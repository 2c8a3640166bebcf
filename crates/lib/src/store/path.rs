//! Store path naming.
//!
//! A store path is `<hash>-<name>`: the first 32 hex characters of a
//! fingerprint followed by a sanitized, human-readable name. It is the on-disk
//! identifier of an artifact and is stable across machines given identical
//! content.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::consts::{MAX_NAME_LEN, OBJ_HASH_PREFIX_LEN};
use crate::util::hash::Fingerprint;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorePathError {
  #[error("store path '{0}' is missing the '-' separator")]
  MissingSeparator(String),

  #[error("store path '{0}' has an invalid hash part")]
  InvalidHash(String),

  #[error("invalid store path name '{0}'")]
  InvalidName(String),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorePath {
  hash: String,
  name: String,
}

impl StorePath {
  /// Derive a store path from a fingerprint and a name.
  ///
  /// The name is sanitized; see [`sanitize_name`].
  pub fn from_fingerprint(fingerprint: &Fingerprint, name: &str) -> Result<Self, StorePathError> {
    let name = sanitize_name(name)?;
    Ok(Self {
      hash: fingerprint.short().to_string(),
      name,
    })
  }

  /// The hash part (32 lowercase hex characters).
  pub fn hash_part(&self) -> &str {
    &self.hash
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Whether `fingerprint` is the fingerprint this path was derived from.
  pub fn matches(&self, fingerprint: &Fingerprint) -> bool {
    fingerprint.0.len() == 64 && fingerprint.short() == self.hash
  }
}

impl fmt::Display for StorePath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}", self.hash, self.name)
  }
}

impl FromStr for StorePath {
  type Err = StorePathError;

  /// Parses `<hash>-<name>`. A full filesystem path is accepted too; only
  /// its last component is used.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let base = s.rsplit('/').next().unwrap_or(s);
    let (hash, name) = base
      .split_once('-')
      .ok_or_else(|| StorePathError::MissingSeparator(s.to_string()))?;

    if hash.len() != OBJ_HASH_PREFIX_LEN || !hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
      return Err(StorePathError::InvalidHash(s.to_string()));
    }

    if sanitize_name(name)? != name {
      return Err(StorePathError::InvalidName(name.to_string()));
    }

    Ok(Self {
      hash: hash.to_string(),
      name: name.to_string(),
    })
  }
}

impl Serialize for StorePath {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for StorePath {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}

/// Sanitize a human-readable name for use in a store path.
///
/// Characters outside `[A-Za-z0-9+._?=-]` become `_`. The result must be
/// non-empty, must not start with `.`, and is truncated to 211 characters.
pub fn sanitize_name(name: &str) -> Result<String, StorePathError> {
  let sanitized: String = name
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || "+._?=-".contains(c) {
        c
      } else {
        '_'
      }
    })
    .take(MAX_NAME_LEN)
    .collect();

  if sanitized.is_empty() || sanitized.starts_with('.') {
    return Err(StorePathError::InvalidName(name.to_string()));
  }

  Ok(sanitized)
}
