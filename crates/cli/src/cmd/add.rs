use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

use kiln_lib::config::Settings;
use kiln_lib::gc::{RootGuard, TempRoots, add_root};
use kiln_lib::lock::LockManager;
use kiln_lib::store::Content;

use super::open_store;
use crate::output::{OutputFormat, print_json};

/// Copy `path` into the store and print the resulting store path.
pub fn cmd_add(settings: &Settings, path: &Path, name: Option<&str>, root: Option<&str>, output: OutputFormat) -> Result<()> {
  let store = open_store(settings)?;
  let name = match name {
    Some(name) => name.to_string(),
    None => path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .ok_or_else(|| anyhow!("Cannot derive a name from {}; pass --name", path.display()))?,
  };

  // Pinned until the root exists, so a concurrent gc cannot take it first.
  let guard = RootGuard::new(
    LockManager::new(&store).with_command("add"),
    Arc::new(TempRoots::new(&store)),
  );
  let store_path = guard
    .put(&store, &name, Content::Tree(path.to_path_buf()), &BTreeSet::new())
    .with_context(|| format!("Failed to add {}", path.display()))?;

  if let Some(root) = root {
    add_root(&store, root, &store_path).with_context(|| format!("Failed to add root '{}'", root))?;
  }
  drop(guard);

  if output.is_json() {
    return print_json(&serde_json::json!({
      "path": store_path,
      "location": store.object_path(&store_path),
      "root": root,
    }));
  }
  println!("{}", store.object_path(&store_path).display());
  Ok(())
}
