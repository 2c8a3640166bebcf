use anyhow::{Context, Result, bail};

use kiln_lib::config::Settings;
use kiln_lib::gc::{add_root, list_roots, remove_root};

use super::{open_store, parse_store_path};
use crate::output::{OutputFormat, print_info, print_json, print_success, symbols};

pub fn cmd_roots_list(settings: &Settings, output: OutputFormat) -> Result<()> {
  let store = open_store(settings)?;
  let roots = list_roots(&store).context("Failed to read GC roots")?;

  if output.is_json() {
    return print_json(&roots);
  }
  if roots.is_empty() {
    print_info("No GC roots");
  }
  for root in &roots {
    println!("{} {} {}", root.name, symbols::ARROW, root.path);
  }
  Ok(())
}

pub fn cmd_roots_add(settings: &Settings, name: &str, path: &str, output: OutputFormat) -> Result<()> {
  let store = open_store(settings)?;
  let path = parse_store_path(path)?;
  let link = add_root(&store, name, &path).with_context(|| format!("Failed to add root '{}'", name))?;

  if output.is_json() {
    return print_json(&serde_json::json!({ "name": name, "path": path, "link": link }));
  }
  print_success(&format!("{} {} {}", name, symbols::ARROW, path));
  Ok(())
}

pub fn cmd_roots_remove(settings: &Settings, name: &str, output: OutputFormat) -> Result<()> {
  let store = open_store(settings)?;
  if !remove_root(&store, name).with_context(|| format!("Failed to remove root '{}'", name))? {
    bail!("No GC root named '{}'", name);
  }

  if output.is_json() {
    return print_json(&serde_json::json!({ "removed": name }));
  }
  print_success(&format!("Removed root {}", name));
  Ok(())
}
