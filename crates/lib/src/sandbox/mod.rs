//! Sandboxed execution of a single recipe.
//!
//! Each build gets a private directory under the store's `tmp/`:
//!
//! ```text
//! tmp/build-<hash>-<pid>-<random>/
//! ├── inputs/<alias>   # copies of the declared inputs, nothing else
//! ├── out/<slot>       # where the builder must create each output
//! ├── tmp/             # TMPDIR
//! └── home/            # HOME
//! ```
//!
//! The builder runs with a cleared environment in its own process group, with
//! the sandbox as working directory. On Linux it also gets private user and
//! mount namespaces (see [`isolate`]): the sandbox and read-only system
//! directories are all it can see. Outputs are fingerprinted only after the
//! builder succeeds and committed only once every output has been staged, so a
//! failed build never writes to the store. With a [`RootGuard`] the outputs
//! are committed under their path locks and pinned as temp roots.

mod capture;
#[cfg(target_os = "linux")]
pub mod isolate;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use indexmap::IndexMap;
use tokio::process::{Child, Command as ProcessCommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ExecuteConfig, Isolation};
use crate::gc::{RootGuard, commit_staged};
use crate::placeholder::{self, Placeholder, PlaceholderError, Resolver};
use crate::platform::immutable::unseal;
use crate::recipe::{Command, RecipeId};
use crate::scheduler::BuildFailure;
use crate::store::{StagedObject, Store, StorePath, staging_prefix};
use crate::util::fs::copy_path;
use crate::util::hash::Fingerprint;

use capture::BoundedCapture;

/// PATH inside the sandbox; builders must bring their own tools as inputs.
const SANDBOX_PATH: &str = "/path-not-set";

/// January 1, 1980 00:00:00 UTC.
const SOURCE_DATE_EPOCH: &str = "315532800";

/// One output slot of a job and the name its store path will carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSlot {
  pub slot: String,
  pub name: String,
}

/// A recipe with its inputs resolved to store paths, ready to run.
#[derive(Debug, Clone)]
pub struct BuildJob {
  pub recipe: RecipeId,
  pub fingerprint: Fingerprint,
  pub command: Command,
  pub inputs: IndexMap<String, StorePath>,
  pub outputs: Vec<OutputSlot>,
}

impl BuildJob {
  /// The store paths every output of this job references.
  pub fn references(&self) -> BTreeSet<StorePath> {
    self.inputs.values().cloned().collect()
  }
}

/// What a sandboxed run produced.
#[derive(Debug)]
pub struct ExecOutcome {
  pub result: Result<BTreeMap<String, StorePath>, BuildFailure>,
  /// Captured stdout followed by stderr.
  pub log: String,
}

impl ExecOutcome {
  fn failed(failure: BuildFailure, log: String) -> Self {
    Self {
      result: Err(failure),
      log,
    }
  }
}

/// Runs build jobs against one store.
#[derive(Debug, Clone)]
pub struct SandboxedExecutor {
  store: Store,
  config: ExecuteConfig,
  guard: Option<RootGuard>,
}

impl SandboxedExecutor {
  pub fn new(store: Store, config: ExecuteConfig) -> Self {
    Self {
      store,
      config,
      guard: None,
    }
  }

  /// Commit outputs through `guard` so a concurrent collection cannot
  /// remove them before the caller records them.
  pub fn with_guard(mut self, guard: RootGuard) -> Self {
    self.guard = Some(guard);
    self
  }

  pub fn config(&self) -> &ExecuteConfig {
    &self.config
  }

  /// Run a job to completion, timeout or cancellation.
  ///
  /// The captured log is written to the store's log directory whatever the
  /// outcome.
  pub async fn run(&self, job: &BuildJob, cancel: &CancellationToken) -> ExecOutcome {
    info!(recipe = %job.recipe, fingerprint = %job.fingerprint.short(), "building");

    let outcome = self.run_in_sandbox(job, cancel).await;

    if let Err(e) = self.store.write_log(&job.fingerprint, outcome.log.as_bytes()) {
      warn!(recipe = %job.recipe, error = %e, "failed to write build log");
    }

    match &outcome.result {
      Ok(outputs) => info!(recipe = %job.recipe, outputs = outputs.len(), "build succeeded"),
      Err(failure) => warn!(recipe = %job.recipe, %failure, "build failed"),
    }

    outcome
  }

  async fn run_in_sandbox(&self, job: &BuildJob, cancel: &CancellationToken) -> ExecOutcome {
    for path in job.inputs.values() {
      if !self.store.exists(path) {
        return ExecOutcome::failed(BuildFailure::InputMissing { path: path.clone() }, String::new());
      }
    }

    let sandbox = match Sandbox::create(&self.store, job, self.isolated()) {
      Ok(sandbox) => sandbox,
      Err(e) => return ExecOutcome::failed(io_failure(e), String::new()),
    };

    let mut command = match sandbox.command(&job.command) {
      Ok(command) => command,
      Err(e) => {
        return ExecOutcome::failed(
          BuildFailure::InvalidCommand { message: e.to_string() },
          String::new(),
        );
      }
    };

    let mut child = match command.spawn() {
      Ok(child) => child,
      Err(e) => {
        let message = format!("failed to spawn '{}': {}", job.command.builder, e);
        return ExecOutcome::failed(BuildFailure::InvalidCommand { message }, String::new());
      }
    };
    let pid = child.id();
    debug!(recipe = %job.recipe, ?pid, sandbox = %sandbox.root().display(), "spawned builder");

    let stdout = BoundedCapture::spawn(child.stdout.take(), self.config.max_log_bytes);
    let stderr = BoundedCapture::spawn(child.stderr.take(), self.config.max_log_bytes);

    let waited = self.wait(&mut child, pid, cancel).await;

    // Background processes left by the builder would keep the pipes open.
    if let Some(pid) = pid {
      signal_group(pid, Signal::Kill);
    }

    let mut log = stdout.finish().await;
    log.push_str(&stderr.finish().await);

    let status = match waited {
      Ok(Wait::Exited(status)) => status,
      Ok(Wait::TimedOut(after)) => return ExecOutcome::failed(BuildFailure::Timeout { seconds: after.as_secs() }, log),
      Ok(Wait::Cancelled) => return ExecOutcome::failed(BuildFailure::Cancelled, log),
      Err(e) => return ExecOutcome::failed(io_failure(e), log),
    };

    if let Some(failure) = exit_failure(status) {
      return ExecOutcome::failed(failure, log);
    }

    match self.collect_outputs(job, &sandbox).await {
      Ok(outputs) => ExecOutcome { result: Ok(outputs), log },
      Err(failure) => ExecOutcome::failed(failure, log),
    }
  }

  /// Whether builders get their own namespaces.
  fn isolated(&self) -> bool {
    #[cfg(target_os = "linux")]
    {
      self.config.isolation == Isolation::Auto && isolate::available()
    }
    #[cfg(not(target_os = "linux"))]
    {
      if self.config.isolation == Isolation::Auto {
        debug!("filesystem isolation is only available on Linux");
      }
      false
    }
  }

  async fn wait(&self, child: &mut Child, pid: Option<u32>, cancel: &CancellationToken) -> std::io::Result<Wait> {
    let timeout = self.config.build_timeout;
    let deadline = async {
      match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
      }
    };

    let reason = tokio::select! {
      status = child.wait() => return status.map(Wait::Exited),
      _ = deadline => Wait::TimedOut(timeout.unwrap_or_default()),
      _ = cancel.cancelled() => Wait::Cancelled,
    };

    self.terminate(child, pid).await?;
    Ok(reason)
  }

  /// SIGTERM the process group, then SIGKILL after the grace period.
  async fn terminate(&self, child: &mut Child, pid: Option<u32>) -> std::io::Result<()> {
    let Some(pid) = pid else {
      child.wait().await?;
      return Ok(());
    };

    debug!(pid, "terminating builder process group");
    signal_group(pid, Signal::Term);

    if tokio::time::timeout(self.config.kill_grace, child.wait()).await.is_err() {
      warn!(pid, "builder ignored SIGTERM, killing");
      signal_group(pid, Signal::Kill);
      child.wait().await?;
    }
    Ok(())
  }

  /// Fingerprint every declared output, then commit them all.
  async fn collect_outputs(
    &self,
    job: &BuildJob,
    sandbox: &Sandbox,
  ) -> Result<BTreeMap<String, StorePath>, BuildFailure> {
    let references = job.references();
    let mut slots = Vec::with_capacity(job.outputs.len());
    let mut staged: Vec<StagedObject> = Vec::with_capacity(job.outputs.len());

    for output in &job.outputs {
      let location = sandbox.output_path(&output.slot);
      if location.symlink_metadata().is_err() {
        return Err(BuildFailure::OutputMissing {
          output: output.slot.clone(),
        });
      }
      let object = self
        .store
        .fingerprint_staged(&output.name, &location, &references)
        .map_err(io_failure)?;
      slots.push(output.slot.clone());
      staged.push(object);
    }

    // Committing may wait on path locks and the store lock.
    let store = self.store.clone();
    let guard = self.guard.clone();
    let deriver = Some(job.fingerprint.clone());
    let infos = tokio::task::spawn_blocking(move || commit_staged(&store, guard.as_ref(), staged, deriver))
      .await
      .map_err(io_failure)?
      .map_err(io_failure)?;

    Ok(slots.into_iter().zip(infos).map(|(slot, info)| (slot, info.path)).collect())
  }
}

enum Wait {
  Exited(ExitStatus),
  TimedOut(Duration),
  Cancelled,
}

fn io_failure(e: impl std::fmt::Display) -> BuildFailure {
  BuildFailure::Io { message: e.to_string() }
}

#[cfg(unix)]
fn exit_failure(status: ExitStatus) -> Option<BuildFailure> {
  use std::os::unix::process::ExitStatusExt;

  match (status.code(), status.signal()) {
    (Some(0), _) => None,
    (Some(code), _) => Some(BuildFailure::ExitCode { code }),
    (None, Some(signal)) => Some(BuildFailure::Signal { signal }),
    (None, None) => Some(BuildFailure::ExitCode { code: -1 }),
  }
}

#[cfg(not(unix))]
fn exit_failure(status: ExitStatus) -> Option<BuildFailure> {
  match status.code() {
    Some(0) => None,
    code => Some(BuildFailure::ExitCode { code: code.unwrap_or(-1) }),
  }
}

#[derive(Clone, Copy)]
enum Signal {
  Term,
  Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
  use nix::sys::signal::{Signal as NixSignal, killpg};
  use nix::unistd::Pid;

  let Ok(raw) = i32::try_from(pid) else {
    return;
  };
  let signal = match signal {
    Signal::Term => NixSignal::SIGTERM,
    Signal::Kill => NixSignal::SIGKILL,
  };
  // ESRCH just means the group is already gone.
  let _ = killpg(Pid::from_raw(raw), signal);
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: Signal) {}

/// The on-disk sandbox of one build. Removed on drop.
struct Sandbox {
  dir: tempfile::TempDir,
  outputs: Vec<(String, String)>,
  inputs: IndexMap<String, String>,
  /// Mount point of the builder's private root, when isolated.
  _new_root: Option<tempfile::TempDir>,
  #[cfg(target_os = "linux")]
  plan: Option<std::sync::Arc<isolate::Plan>>,
}

impl Sandbox {
  fn create(store: &Store, job: &BuildJob, isolated: bool) -> std::io::Result<Self> {
    let short = job.fingerprint.short();
    let dir = tempfile::Builder::new()
      .prefix(&staging_prefix(&format!("build-{}-", short)))
      .tempdir_in(store.tmp_dir())?;
    let root = dir.path();

    for sub in ["inputs", "out", "tmp", "home"] {
      std::fs::create_dir(root.join(sub))?;
    }

    let mut inputs = IndexMap::new();
    for (alias, path) in &job.inputs {
      let target = root.join("inputs").join(alias);
      copy_path(&store.object_path(path), &target)?;
      inputs.insert(alias.clone(), target.to_string_lossy().into_owned());
    }

    let outputs = job
      .outputs
      .iter()
      .map(|o| (o.slot.clone(), root.join("out").join(&o.slot).to_string_lossy().into_owned()))
      .collect();

    let new_root = if isolated {
      Some(
        tempfile::Builder::new()
          .prefix(&staging_prefix(&format!("root-{}-", short)))
          .tempdir_in(store.tmp_dir())?,
      )
    } else {
      None
    };
    #[cfg(target_os = "linux")]
    let plan = new_root
      .as_ref()
      .map(|new_root| isolate::Plan::new(root, new_root.path()).map(std::sync::Arc::new))
      .transpose()?;

    Ok(Self {
      dir,
      outputs,
      inputs,
      _new_root: new_root,
      #[cfg(target_os = "linux")]
      plan,
    })
  }

  fn root(&self) -> &Path {
    self.dir.path()
  }

  fn output_path(&self, slot: &str) -> PathBuf {
    self.root().join("out").join(slot)
  }

  /// The process to spawn, with placeholders substituted and a scrubbed environment.
  fn command(&self, command: &Command) -> Result<ProcessCommand, PlaceholderError> {
    let builder = placeholder::substitute(&command.builder, self)?;
    let args = command
      .args
      .iter()
      .map(|arg| placeholder::substitute(arg, self))
      .collect::<Result<Vec<_>, _>>()?;

    let root = self.root();
    let tmp = root.join("tmp");

    let mut process = ProcessCommand::new(builder);
    process
      .args(args)
      .current_dir(root)
      .env_clear()
      .env("PATH", SANDBOX_PATH)
      .env("HOME", root.join("home"))
      .env("TMPDIR", &tmp)
      .env("TMP", &tmp)
      .env("TEMP", &tmp)
      .env("TEMPDIR", &tmp)
      .env("LANG", "C")
      .env("LC_ALL", "C")
      .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH)
      .env("KILN_BUILD_TOP", root)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);

    if let Some((_, first)) = self.outputs.first() {
      process.env("out", first);
    }
    for (slot, path) in &self.outputs {
      process.env(slot, path);
    }
    for (alias, path) in &self.inputs {
      process.env(format!("input_{}", alias), path);
    }
    for (key, value) in &command.env {
      process.env(key, placeholder::substitute(value, self)?);
    }

    #[cfg(unix)]
    process.process_group(0);

    #[cfg(target_os = "linux")]
    if let Some(plan) = self.plan.clone() {
      // SAFETY: `enter` only makes syscalls on memory prepared before the fork.
      unsafe {
        process.pre_exec(move || plan.enter());
      }
    }

    Ok(process)
  }
}

impl Resolver for Sandbox {
  fn resolve(&self, placeholder: &Placeholder) -> Option<&str> {
    let path = match placeholder {
      Placeholder::Output(None) => self.outputs.first().map(|(_, path)| path),
      Placeholder::Output(Some(slot)) => self.outputs.iter().find(|(s, _)| s == slot).map(|(_, path)| path),
      Placeholder::Input(alias) => self.inputs.get(alias),
    };
    path.map(|path| path.as_str())
  }
}

impl Drop for Sandbox {
  fn drop(&mut self) {
    // Copied inputs are read-only; restore write bits so the directory can go.
    if let Err(e) = unseal(self.dir.path()) {
      warn!(sandbox = %self.dir.path().display(), error = %e, "failed to clean up sandbox");
    }
  }
}
