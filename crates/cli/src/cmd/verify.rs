use anyhow::{Result, bail};
use serde::Serialize;

use kiln_lib::config::Settings;
use kiln_lib::store::StorePath;

use super::{open_store, parse_store_path};
use crate::output::{OutputFormat, print_error, print_json, print_success};

#[derive(Serialize)]
struct Verified {
  path: StorePath,
  ok: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  error: Option<String>,
}

pub fn cmd_verify(settings: &Settings, paths: &[String], output: OutputFormat) -> Result<()> {
  let store = open_store(settings)?;
  let paths = if paths.is_empty() {
    store.list()?
  } else {
    paths.iter().map(|p| parse_store_path(p)).collect::<Result<Vec<_>>>()?
  };

  let results: Vec<Verified> = paths
    .into_iter()
    .map(|path| match store.verify(&path) {
      Ok(()) => Verified {
        path,
        ok: true,
        error: None,
      },
      Err(e) => Verified {
        path,
        ok: false,
        error: Some(e.to_string()),
      },
    })
    .collect();
  let bad = results.iter().filter(|r| !r.ok).count();

  if output.is_json() {
    print_json(&results)?;
  } else {
    for result in &results {
      match &result.error {
        None => print_success(&result.path.to_string()),
        Some(error) => print_error(&format!("{}: {}", result.path, error)),
      }
    }
  }

  if bad > 0 {
    bail!("{} of {} store paths failed verification", bad, results.len());
  }
  Ok(())
}
