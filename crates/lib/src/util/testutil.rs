//! Test utilities for kiln-lib.
//!
//! Helpers for building shell recipes and small graphs. The sandbox hides the
//! host PATH, so recipes built here put the standard tool directories back.

use std::collections::BTreeMap;

use crate::recipe::{Command, GraphSpec, InputRef, Recipe, RecipeGraph, RecipeId};
use crate::store::StorePath;

/// PATH handed to test builders.
pub const TEST_PATH: &str = "/usr/bin:/bin";

/// A `/bin/sh -c <script>` command with a usable PATH.
pub fn shell_command(script: &str) -> Command {
  Command {
    builder: "/bin/sh".to_string(),
    args: vec!["-c".to_string(), script.to_string()],
    env: BTreeMap::from([("PATH".to_string(), TEST_PATH.to_string())]),
  }
}

/// A single-output shell recipe depending on the `out` output of `deps`.
/// Each dependency is visible as `$input_<id>`.
pub fn shell_recipe(script: &str, deps: &[&str]) -> Recipe {
  Recipe {
    name: None,
    inputs: deps
      .iter()
      .map(|dep| {
        (
          dep.to_string(),
          InputRef::Recipe {
            recipe: RecipeId::from(*dep),
            output: "out".to_string(),
          },
        )
      })
      .collect(),
    command: shell_command(script),
    outputs: vec!["out".to_string()],
  }
}

/// Add a store path input to a recipe.
pub fn with_path_input(mut recipe: Recipe, alias: &str, path: &StorePath) -> Recipe {
  recipe
    .inputs
    .insert(alias.to_string(), InputRef::Path { path: path.clone() });
  recipe
}

/// Build a graph from `(id, recipe)` pairs in declaration order.
pub fn graph_of(recipes: Vec<(&str, Recipe)>) -> RecipeGraph {
  RecipeGraph::from_spec(GraphSpec {
    recipes: recipes.into_iter().map(|(id, r)| (RecipeId::from(id), r)).collect(),
  })
}

pub fn ids(names: &[&str]) -> Vec<RecipeId> {
  names.iter().map(|n| RecipeId::from(*n)).collect()
}
