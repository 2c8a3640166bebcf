use anyhow::{Context, Result};

use kiln_lib::config::Settings;

use super::{open_store, parse_store_path};
use crate::output::{OutputFormat, format_bytes, print_json, print_stat};

pub fn cmd_info(settings: &Settings, path: &str, output: OutputFormat) -> Result<()> {
  let store = open_store(settings)?;
  let path = parse_store_path(path)?;
  let info = store.query_info(&path).with_context(|| format!("No valid store object {}", path))?;

  if output.is_json() {
    return print_json(&info);
  }

  println!("{}", store.object_path(&path).display());
  print_stat("Kind", &info.kind.to_string());
  print_stat("Size", &format_bytes(info.size));
  print_stat("Fingerprint", &info.fingerprint.to_string());
  if let Some(deriver) = &info.deriver {
    print_stat("Deriver", &deriver.to_string());
  }
  let registered = std::time::UNIX_EPOCH + std::time::Duration::from_secs(info.registered_at);
  print_stat("Registered", &humantime::format_rfc3339_seconds(registered).to_string());
  if info.references.is_empty() {
    print_stat("References", "none");
  } else {
    print_stat("References", &info.references.len().to_string());
    for reference in &info.references {
      println!("    {}", reference);
    }
  }

  Ok(())
}
