//! Implementation of the `kiln build` command.
//!
//! Loads a recipe graph, realizes the requested targets against the store and
//! prints one line per recipe in the targets' closure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use tracing::debug;

use kiln_lib::config::{Settings, parse_timeout};
use kiln_lib::engine::Engine;
use kiln_lib::gc::{TempRoots, add_root};
use kiln_lib::recipe::{GraphSpec, RecipeGraph, RecipeId};
use kiln_lib::scheduler::{BuildResult, BuildStatus, RealizeOptions, RealizeReport};
use kiln_lib::signal::InterruptScope;

use crate::output::{
  OutputFormat, format_duration, print_error, print_json, print_stat, print_status, print_success, print_warning,
  short_path, symbols,
};

/// Lines of a failed build's log shown in text output.
const LOG_TAIL_LINES: usize = 20;

pub struct BuildArgs {
  pub graph: PathBuf,
  pub targets: Vec<String>,
  pub jobs: Option<usize>,
  pub timeout: Option<String>,
  pub substituters: Vec<String>,
  pub fail_fast: bool,
  pub rebuild: bool,
  pub push: bool,
  pub root: bool,
}

pub async fn cmd_build(mut settings: Settings, args: BuildArgs, output: OutputFormat) -> Result<()> {
  let start = Instant::now();

  match args.jobs {
    Some(0) => bail!("--jobs must be at least 1"),
    Some(jobs) => settings.execute.max_jobs = jobs,
    None => {}
  }
  if let Some(timeout) = &args.timeout {
    settings.execute.build_timeout = parse_timeout("--timeout", timeout)?;
  }
  settings.substituters.extend(args.substituters);

  let spec = GraphSpec::from_file(&args.graph).context("Failed to load recipe graph")?;
  let graph = RecipeGraph::from_spec(spec);
  let targets: Vec<RecipeId> = if args.targets.is_empty() {
    graph.ids().cloned().collect()
  } else {
    args.targets.iter().map(|t| RecipeId::from(t.as_str())).collect()
  };

  debug!(graph = %args.graph.display(), recipes = graph.len(), targets = targets.len(), "loaded recipe graph");

  let engine = Engine::from_settings(&settings)
    .context("Failed to initialize engine")?
    .with_command("build");

  let options = RealizeOptions {
    stop_on_first_failure: args.fail_fast,
    rebuild: args.rebuild,
    push: args.push,
  };

  // Keeps the outputs pinned until their permanent roots exist.
  let pinned = Arc::new(TempRoots::new(engine.store()));

  let interrupt = InterruptScope::install(engine.cancellation().clone())?;
  let report = engine
    .realize_pinned(&graph, &targets, &options, pinned.clone())
    .await
    .context("Invalid recipe graph")?;
  let interrupted = interrupt.interrupted();
  drop(interrupt);

  let rooted = if args.root { register_roots(&engine, &report) } else { Vec::new() };
  drop(pinned);

  if output.is_json() {
    print_json(&report)?;
  } else {
    print_report(&engine, &report, &rooted);
    println!();
    if report.is_success() {
      print_success("Build complete!");
    }
    print_stat("Built", &report.count(|s| *s == BuildStatus::Built).to_string());
    print_stat("Substituted", &report.count(|s| *s == BuildStatus::Substituted).to_string());
    print_stat("Cached", &report.count(|s| *s == BuildStatus::Cached).to_string());
    print_stat("Failed", &report.failed().count().to_string());
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  if interrupted {
    print_warning("Interrupted");
  }
  if !report.is_success() {
    bail!("{} recipe(s) failed", report.failed().count());
  }
  Ok(())
}

fn print_report(engine: &Engine, report: &RealizeReport, rooted: &[String]) {
  for result in &report.results {
    print_status(result.recipe.as_str(), &result.status);
    for (slot, path) in &result.outputs {
      println!(
        "    {} {} {}",
        slot,
        symbols::ARROW,
        engine.store().object_path(path).display()
      );
    }
    if matches!(result.status, BuildStatus::Failed(_)) {
      print_log_tail(result);
    }
  }
  for root in rooted {
    println!("  rooted {}", root);
  }
}

fn print_log_tail(result: &BuildResult) {
  let Some(log) = result.log.as_deref() else {
    return;
  };
  let lines: Vec<&str> = log.lines().collect();
  let skip = lines.len().saturating_sub(LOG_TAIL_LINES);
  if skip > 0 {
    eprintln!("    ... {} earlier line(s)", skip);
  }
  for line in &lines[skip..] {
    eprintln!("    {}", line);
  }
}

/// Register a root for every output of every successful target. Roots are
/// named after the target, with `-<slot>` appended for slots other than `out`.
fn register_roots(engine: &Engine, report: &RealizeReport) -> Vec<String> {
  let store = engine.store();
  let mut rooted = Vec::new();
  for target in &report.targets {
    let Some(result) = report.get(target).filter(|r| r.status.is_success()) else {
      continue;
    };
    for (slot, path) in &result.outputs {
      let name = if slot == "out" {
        target.to_string()
      } else {
        format!("{}-{}", target, slot)
      };
      if let Err(e) = add_root(store, &name, path) {
        print_error(&format!("Failed to root {} as '{}': {}", short_path(path), name, e));
        continue;
      }
      rooted.push(name);
    }
  }
  rooted
}
