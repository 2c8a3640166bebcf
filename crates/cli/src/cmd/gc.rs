use std::time::Instant;

use anyhow::{Context, Result};

use kiln_lib::config::Settings;
use kiln_lib::engine::Engine;
use kiln_lib::gc::GcOptions;

use super::open_store;
use crate::output::{OutputFormat, format_bytes, format_duration, print_info, print_json, print_stat, print_success};

pub fn cmd_gc(settings: &Settings, dry_run: bool, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let engine = Engine::new(open_store(settings)?);

  let options = GcOptions {
    dry_run,
    ..Default::default()
  };
  let result = engine.collect_garbage(&options).context("Garbage collection failed")?;

  if output.is_json() {
    print_json(&result)?;
  } else {
    if dry_run {
      for path in &result.deleted {
        println!("would delete {}", path);
      }
      print_info("Dry run - no changes made");
    } else {
      print_success("Garbage collection complete!");
    }
    print_stat("Roots", &result.stats.roots.to_string());
    print_stat("Live paths", &result.stats.live.to_string());
    print_stat("Paths removed", &result.stats.deleted.to_string());
    if result.stats.skipped_locked > 0 {
      print_stat("Skipped (in use)", &result.stats.skipped_locked.to_string());
    }
    print_stat("Space freed", &format_bytes(result.stats.bytes_freed));
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  Ok(())
}
