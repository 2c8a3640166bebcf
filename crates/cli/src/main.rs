mod cmd;
mod output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kiln_lib::config::Settings;

use crate::output::OutputFormat;

/// kiln - content-addressed package builds
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Store directory (defaults to $KILN_STORE, then $XDG_DATA_HOME/kiln/store)
  #[arg(long, global = true)]
  store: Option<PathBuf>,

  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Realize recipes from a graph file
  Build {
    /// Path to the recipe graph (JSON)
    graph: PathBuf,

    /// Recipes to realize (default: every recipe in the graph)
    targets: Vec<String>,

    /// Maximum number of concurrent builds
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Per-build time limit, e.g. `10m` or `1h 30m`
    #[arg(long)]
    timeout: Option<String>,

    /// Additional substituter URL, tried after the configured ones
    #[arg(long = "substituter", value_name = "URL")]
    substituters: Vec<String>,

    /// Stop scheduling new builds after the first failure
    #[arg(long)]
    fail_fast: bool,

    /// Ignore earlier results and substituters
    #[arg(long)]
    rebuild: bool,

    /// Copy built outputs to writable substituters
    #[arg(long)]
    push: bool,

    /// Register each target's outputs as a GC root
    #[arg(long)]
    root: bool,
  },

  /// Delete store objects no root reaches
  Gc {
    /// Show what would be deleted without deleting
    #[arg(long)]
    dry_run: bool,
  },

  /// Manage GC roots
  Roots {
    #[command(subcommand)]
    command: RootsCommand,
  },

  /// Add a file or directory to the store
  Add {
    /// File or directory to add
    path: PathBuf,

    /// Name of the store path (default: the file name)
    #[arg(long)]
    name: Option<String>,

    /// Register the result as a GC root with this name
    #[arg(long)]
    root: Option<String>,
  },

  /// Check store objects against their recorded fingerprints
  Verify {
    /// Store paths to check (default: every object)
    paths: Vec<String>,
  },

  /// Show metadata of a store path
  Info {
    /// Store path (`<hash>-<name>` or a full path into the store)
    path: String,
  },
}

#[derive(Subcommand)]
enum RootsCommand {
  /// List GC roots
  List,
  /// Add or replace a GC root
  Add {
    name: String,
    /// Store path the root points to
    path: String,
  },
  /// Remove a GC root
  Remove { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();

  let filter = if cli.verbose {
    EnvFilter::new("kiln=debug,kiln_lib=debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
  };
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let mut settings = Settings::from_env().context("Invalid configuration")?;
  if let Some(store) = cli.store {
    settings.store = store;
  }

  match cli.command {
    Commands::Build {
      graph,
      targets,
      jobs,
      timeout,
      substituters,
      fail_fast,
      rebuild,
      push,
      root,
    } => {
      let args = cmd::BuildArgs {
        graph,
        targets,
        jobs,
        timeout,
        substituters,
        fail_fast,
        rebuild,
        push,
        root,
      };
      cmd::cmd_build(settings, args, cli.output).await
    }
    Commands::Gc { dry_run } => cmd::cmd_gc(&settings, dry_run, cli.output),
    Commands::Roots { command } => match command {
      RootsCommand::List => cmd::cmd_roots_list(&settings, cli.output),
      RootsCommand::Add { name, path } => cmd::cmd_roots_add(&settings, &name, &path, cli.output),
      RootsCommand::Remove { name } => cmd::cmd_roots_remove(&settings, &name, cli.output),
    },
    Commands::Add { path, name, root } => cmd::cmd_add(&settings, &path, name.as_deref(), root.as_deref(), cli.output),
    Commands::Verify { paths } => cmd::cmd_verify(&settings, &paths, cli.output),
    Commands::Info { path } => cmd::cmd_info(&settings, &path, cli.output),
  }
}
