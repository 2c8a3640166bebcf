//! Build recipes and their identity.
//!
//! A recipe is a single build step: named inputs (existing store paths or
//! outputs of other recipes), a command, and declared output slots. Recipes
//! arrive already resolved, as JSON:
//!
//! ```json
//! {
//!   "recipes": {
//!     "hello": {
//!       "inputs": { "src": { "path": "0123...-hello-src" } },
//!       "command": { "builder": "/bin/sh", "args": ["-c", "cp $input_src/* $out"] },
//!       "outputs": ["out"]
//!     },
//!     "greeting": {
//!       "inputs": { "hello": { "recipe": "hello", "output": "out" } },
//!       "command": { "builder": "/bin/sh", "args": ["-c", "..."] },
//!       "outputs": ["out", "doc"]
//!     }
//!   }
//! }
//! ```

mod graph;

pub use graph::*;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::store::StorePath;
use crate::util::hash::{Fingerprint, Hashable};

/// Identifier of a recipe within a graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipeId(pub String);

impl RecipeId {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RecipeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for RecipeId {
  fn from(s: &str) -> Self {
    RecipeId(s.to_string())
  }
}

/// A recipe input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputRef {
  /// An artifact already in the store.
  Path { path: StorePath },
  /// A named output of another recipe in the same graph.
  Recipe { recipe: RecipeId, output: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
  pub builder: String,
  #[serde(default)]
  pub args: Vec<String>,
  #[serde(default)]
  pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
  /// Name used for output store paths. Defaults to the recipe id.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(default)]
  pub inputs: IndexMap<String, InputRef>,
  pub command: Command,
  pub outputs: Vec<String>,
}

/// The resolved recipe graph as handed over by an evaluator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
  pub recipes: IndexMap<RecipeId, Recipe>,
}

impl GraphSpec {
  pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }

  pub fn from_file(path: &Path) -> Result<Self, GraphError> {
    let content = std::fs::read_to_string(path).map_err(|source| GraphError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json(&content).map_err(|source| GraphError::Parse {
      path: path.to_path_buf(),
      source,
    })
  }
}

/// Identity of one input as it contributes to a recipe fingerprint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputIdentity {
  Path(StorePath),
  Recipe { fingerprint: Fingerprint, output: String },
}

/// The canonical record a recipe fingerprint is computed over.
///
/// Recipe inputs are replaced by the fingerprint of the producing recipe, so
/// a change anywhere upstream changes every downstream identity.
#[derive(Debug, Serialize)]
pub struct RecipeIdentity<'a> {
  pub name: &'a str,
  pub command: &'a Command,
  pub outputs: &'a [String],
  pub inputs: BTreeMap<&'a str, InputIdentity>,
}

impl Hashable for RecipeIdentity<'_> {}
