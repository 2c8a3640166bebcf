//! Parallel realization of a recipe graph.
//!
//! The scheduler walks the targets' closure dependencies-first. A recipe is
//! dispatched as soon as every recipe it depends on has succeeded, in
//! declaration order among those ready, with at most `max_jobs` in flight.
//! Each worker tries, in order:
//!
//! 1. a valid recorded result for the recipe fingerprint,
//! 2. the same, again, after taking the recipe's exclusive path lock (another
//!    process may have finished it while we waited),
//! 3. each substituter in turn,
//! 4. a sandboxed build.
//!
//! A failure marks every transitive dependent as failed without running it;
//! independent branches keep going unless `stop_on_first_failure` is set.

mod board;
mod types;

pub use board::StatusBoard;
pub use types::*;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::task::{Id as TaskId, JoinSet};
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::gc::{RootGuard, TempRoots};
use crate::lock::LockMode;
use crate::recipe::{InputRef, RecipeGraph, RecipeId};
use crate::sandbox::{BuildJob, OutputSlot, SandboxedExecutor};
use crate::store::{ResultOrigin, ResultRecord, StorePath};
use crate::util::hash::Fingerprint;

/// Realize `targets` with `engine`. See [`Engine::realize`].
pub(crate) async fn realize(
  engine: &Engine,
  graph: &RecipeGraph,
  targets: &[RecipeId],
  options: &RealizeOptions,
  board: &StatusBoard,
  roots: Arc<TempRoots>,
) -> Result<RealizeReport, RealizeError> {
  graph.validate()?;
  let closure = graph.closure(targets)?;
  let fingerprints = graph.fingerprints()?;

  let mut recipe_paths = HashMap::with_capacity(closure.len());
  for id in &closure {
    let path = graph
      .recipe_path(id, &fingerprints[id])
      .map_err(|e| RealizeError::RecipePath {
        recipe: id.clone(),
        message: e.to_string(),
      })?;
    recipe_paths.insert(id.clone(), path);
  }

  info!(targets = targets.len(), recipes = closure.len(), "realizing");

  let guard = RootGuard::new(engine.locks().clone(), roots);
  pin_path_inputs(engine, graph, &closure, &guard).await;

  let worker = Arc::new(Worker {
    engine: engine.clone(),
    executor: SandboxedExecutor::new(engine.store().clone(), engine.config().clone()).with_guard(guard.clone()),
    guard,
    options: options.clone(),
  });

  board.reset(&closure);
  let mut run = Run::new(graph, board, &fingerprints, &closure, options.stop_on_first_failure);
  let max_jobs = engine.config().max_jobs.max(1);
  let cancel = engine.cancellation();

  let mut join_set = JoinSet::new();
  let mut in_flight: HashMap<TaskId, RecipeId> = HashMap::new();

  loop {
    while !run.halted && !cancel.is_cancelled() && join_set.len() < max_jobs {
      let Some(id) = run.next_ready() else {
        break;
      };
      match run.prepare(&id, &recipe_paths[&id]) {
        Ok(task) => {
          board.set(&id, RecipeState::Running);
          debug!(recipe = %id, "dispatching");
          let handle = join_set.spawn(worker.clone().realize(task));
          in_flight.insert(handle.id(), id);
        }
        Err(failure) => {
          let fingerprint = run.fingerprint(&id);
          run.finish(failed(id, fingerprint, failure, None));
        }
      }
    }

    let Some(joined) = join_set.join_next_with_id().await else {
      break;
    };

    let result = match joined {
      Ok((task, result)) => {
        in_flight.remove(&task);
        result
      }
      Err(e) => {
        let Some(id) = in_flight.remove(&e.id()) else {
          error!(error = %e, "unknown build task ended");
          continue;
        };
        error!(recipe = %id, error = %e, "build task panicked");
        let fingerprint = fingerprints[&id].clone();
        failed(id, fingerprint, BuildFailure::Io { message: e.to_string() }, None)
      }
    };
    run.finish(result);
  }

  // Whatever never ran was stopped by cancellation or an earlier failure.
  let leftover = if cancel.is_cancelled() {
    BuildFailure::Cancelled
  } else {
    BuildFailure::Aborted
  };
  for id in &closure {
    if !run.results.contains_key(id) {
      board.set(id, RecipeState::Failed);
      run
        .results
        .insert(id.clone(), failed(id.clone(), fingerprints[id].clone(), leftover.clone(), None));
    }
  }

  let mut results = run.results;
  let report = RealizeReport {
    targets: targets.to_vec(),
    results: closure.iter().filter_map(|id| results.remove(id)).collect(),
  };

  info!(
    built = report.count(|s| matches!(s, BuildStatus::Built)),
    substituted = report.count(|s| matches!(s, BuildStatus::Substituted)),
    cached = report.count(|s| matches!(s, BuildStatus::Cached)),
    failed = report.count(|s| !s.is_success()),
    "realize complete"
  );

  Ok(report)
}

/// Pin the store path inputs of the closure for the duration of the run.
/// Missing paths are left to fail the recipes that need them.
async fn pin_path_inputs(engine: &Engine, graph: &RecipeGraph, closure: &[RecipeId], guard: &RootGuard) {
  let paths: BTreeSet<StorePath> = closure
    .iter()
    .filter_map(|id| graph.recipe(id))
    .flat_map(|recipe| recipe.inputs.values())
    .filter_map(|input| match input {
      InputRef::Path { path } => Some(path.clone()),
      InputRef::Recipe { .. } => None,
    })
    .collect();
  if paths.is_empty() {
    return;
  }

  let store = engine.store().clone();
  let guard = guard.clone();
  let pinned = tokio::task::spawn_blocking(move || {
    paths
      .into_iter()
      .map(|path| guard.pin(&store, &BTreeSet::from([path])))
      .collect::<Result<Vec<_>, _>>()
  })
  .await;

  match pinned {
    Ok(Ok(_)) => {}
    Ok(Err(e)) => warn!(error = %e, "failed to pin input paths"),
    Err(e) => warn!(error = %e, "failed to pin input paths"),
  }
}

fn failed(recipe: RecipeId, fingerprint: Fingerprint, failure: BuildFailure, log: Option<String>) -> BuildResult {
  BuildResult {
    recipe,
    fingerprint,
    outputs: BTreeMap::new(),
    status: BuildStatus::Failed(failure),
    log,
  }
}

/// Bookkeeping of one realize call.
struct Run<'a> {
  graph: &'a RecipeGraph,
  board: &'a StatusBoard,
  fingerprints: &'a HashMap<RecipeId, Fingerprint>,
  members: HashSet<RecipeId>,
  /// Unfinished dependencies per recipe.
  waiting: HashMap<RecipeId, usize>,
  /// Ready recipes keyed by declaration position.
  ready: BTreeMap<usize, RecipeId>,
  outputs: HashMap<RecipeId, BTreeMap<String, StorePath>>,
  results: HashMap<RecipeId, BuildResult>,
  stop_on_first_failure: bool,
  halted: bool,
}

impl<'a> Run<'a> {
  fn new(
    graph: &'a RecipeGraph,
    board: &'a StatusBoard,
    fingerprints: &'a HashMap<RecipeId, Fingerprint>,
    closure: &[RecipeId],
    stop_on_first_failure: bool,
  ) -> Self {
    let mut run = Self {
      graph,
      board,
      fingerprints,
      members: closure.iter().cloned().collect(),
      waiting: HashMap::new(),
      ready: BTreeMap::new(),
      outputs: HashMap::new(),
      results: HashMap::new(),
      stop_on_first_failure,
      halted: false,
    };

    for id in closure {
      let deps = graph.dependencies(id).len();
      run.waiting.insert(id.clone(), deps);
      if deps == 0 {
        run.enqueue(id.clone());
      }
    }
    run
  }

  fn enqueue(&mut self, id: RecipeId) {
    let position = self.graph.position(&id).unwrap_or(usize::MAX);
    self.board.set(&id, RecipeState::Queued);
    self.ready.insert(position, id);
  }

  fn next_ready(&mut self) -> Option<RecipeId> {
    self.ready.pop_first().map(|(_, id)| id)
  }

  fn fingerprint(&self, id: &RecipeId) -> Fingerprint {
    self.fingerprints[id].clone()
  }

  /// Resolve a ready recipe's inputs into a runnable job.
  fn prepare(&self, id: &RecipeId, recipe_path: &StorePath) -> Result<Task, BuildFailure> {
    let recipe = self.graph.recipe(id).ok_or_else(|| BuildFailure::InvalidCommand {
      message: format!("recipe '{}' is not in the graph", id),
    })?;

    let mut inputs = IndexMap::with_capacity(recipe.inputs.len());
    for (alias, input) in &recipe.inputs {
      let path = match input {
        InputRef::Path { path } => path.clone(),
        InputRef::Recipe { recipe: dep, output } => self
          .outputs
          .get(dep)
          .and_then(|outputs| outputs.get(output))
          .cloned()
          .ok_or_else(|| BuildFailure::Io {
            message: format!("output '{}' of '{}' was not realized", output, dep),
          })?,
      };
      inputs.insert(alias.clone(), path);
    }

    let outputs = recipe
      .outputs
      .iter()
      .map(|slot| OutputSlot {
        slot: slot.clone(),
        name: self.graph.output_name(id, slot),
      })
      .collect();

    Ok(Task {
      recipe_path: recipe_path.clone(),
      job: BuildJob {
        recipe: id.clone(),
        fingerprint: self.fingerprint(id),
        command: recipe.command.clone(),
        inputs,
        outputs,
      },
    })
  }

  /// Record a finished recipe, then release or fail its dependents.
  fn finish(&mut self, result: BuildResult) {
    let id = result.recipe.clone();

    if result.status.is_success() {
      self.board.set(&id, RecipeState::Succeeded);
      self.outputs.insert(id.clone(), result.outputs.clone());
      self.results.insert(id.clone(), result);

      for dependent in self.graph.dependents(&id) {
        if !self.members.contains(&dependent) {
          continue;
        }
        if let Some(count) = self.waiting.get_mut(&dependent) {
          *count = count.saturating_sub(1);
          if *count == 0 {
            self.enqueue(dependent);
          }
        }
      }
      return;
    }

    let cancelled = result.status.failure() == Some(&BuildFailure::Cancelled);
    self.board.set(&id, RecipeState::Failed);
    self.results.insert(id.clone(), result);
    if self.stop_on_first_failure {
      self.halted = true;
    }
    self.fail_dependents(&id, cancelled);
  }

  /// Fail everything downstream of `failed_id` that has not finished.
  /// Downstream of a cancelled recipe is cancelled too.
  fn fail_dependents(&mut self, failed_id: &RecipeId, cancelled: bool) {
    let mut worklist = self.graph.dependents(failed_id);
    while let Some(id) = worklist.pop() {
      if !self.members.contains(&id) || self.results.contains_key(&id) {
        continue;
      }
      debug!(recipe = %id, dependency = %failed_id, "skipping, dependency failed");
      self.board.set(&id, RecipeState::Failed);
      worklist.extend(self.graph.dependents(&id));

      let failure = if cancelled {
        BuildFailure::Cancelled
      } else {
        BuildFailure::DependencyFailed {
          dependency: failed_id.clone(),
        }
      };
      let result = failed(id.clone(), self.fingerprint(&id), failure, None);
      self.results.insert(id, result);
    }
  }
}

struct Task {
  recipe_path: StorePath,
  job: BuildJob,
}

struct Realized {
  status: BuildStatus,
  outputs: BTreeMap<String, StorePath>,
  log: Option<String>,
}

impl Realized {
  fn ok(status: BuildStatus, outputs: BTreeMap<String, StorePath>, log: Option<String>) -> Self {
    Self { status, outputs, log }
  }

  fn failed(failure: BuildFailure, log: Option<String>) -> Self {
    Self {
      status: BuildStatus::Failed(failure),
      outputs: BTreeMap::new(),
      log,
    }
  }
}

/// State shared by the workers of one realize call.
struct Worker {
  engine: Engine,
  executor: SandboxedExecutor,
  guard: RootGuard,
  options: RealizeOptions,
}

impl Worker {
  async fn realize(self: Arc<Self>, task: Task) -> BuildResult {
    let realized = self.realize_job(&task).await;
    BuildResult {
      recipe: task.job.recipe,
      fingerprint: task.job.fingerprint,
      outputs: realized.outputs,
      status: realized.status,
      log: realized.log,
    }
  }

  async fn realize_job(&self, task: &Task) -> Realized {
    let job = &task.job;
    let cancel = self.engine.cancellation();

    if !self.options.rebuild
      && let Some(outputs) = self.cached(job).await
    {
      debug!(recipe = %job.recipe, "using recorded result");
      return Realized::ok(BuildStatus::Cached, outputs, None);
    }

    let lock = tokio::select! {
      lock = self.engine.locks().acquire_async(&task.recipe_path, LockMode::Exclusive) => lock,
      _ = cancel.cancelled() => return Realized::failed(BuildFailure::Cancelled, None),
    };
    let lock = match lock {
      Ok(lock) => lock,
      Err(e) => return Realized::failed(BuildFailure::Io { message: e.to_string() }, None),
    };
    if lock.recovered_stale() {
      info!(recipe = %job.recipe, "recovered lock abandoned by a crashed builder");
    }

    if !self.options.rebuild {
      // Someone else may have finished while we waited for the lock.
      if let Some(outputs) = self.cached(job).await {
        debug!(recipe = %job.recipe, "realized by another builder");
        return Realized::ok(BuildStatus::Cached, outputs, None);
      }

      if let Some(outputs) = self.substitute(job).await {
        if let Err(failure) = self.record(job, &outputs, ResultOrigin::Substituted) {
          return Realized::failed(failure, None);
        }
        return Realized::ok(BuildStatus::Substituted, outputs, None);
      }
    }

    if cancel.is_cancelled() {
      return Realized::failed(BuildFailure::Cancelled, None);
    }

    let outcome = self.executor.run(job, cancel).await;
    let log = Some(outcome.log);
    match outcome.result {
      Ok(outputs) => {
        // Recorded before the recipe lock is released.
        if let Err(failure) = self.record(job, &outputs, ResultOrigin::Built) {
          return Realized::failed(failure, log);
        }
        drop(lock);
        if self.options.push {
          self.push(job, &outputs).await;
        }
        Realized::ok(BuildStatus::Built, outputs, log)
      }
      Err(failure) => Realized::failed(failure, log),
    }
  }

  /// A valid recorded result covering every output slot, pinned.
  async fn cached(&self, job: &BuildJob) -> Option<BTreeMap<String, StorePath>> {
    let store = self.engine.store();
    let record = store.valid_result(&job.fingerprint)?;
    if let Some(missing) = job.outputs.iter().find(|o| !record.outputs.contains_key(&o.slot)) {
      warn!(recipe = %job.recipe, slot = %missing.slot, "recorded result lacks an output");
      return None;
    }

    let paths: BTreeSet<StorePath> = record.outputs.values().cloned().collect();
    let store = store.clone();
    let guard = self.guard.clone();
    match tokio::task::spawn_blocking(move || guard.pin(&store, &paths)).await {
      Ok(Ok(true)) => Some(record.outputs),
      Ok(Ok(false)) => None,
      Ok(Err(e)) => {
        warn!(recipe = %job.recipe, error = %e, "failed to pin recorded outputs");
        None
      }
      Err(e) => {
        warn!(recipe = %job.recipe, error = %e, "failed to pin recorded outputs");
        None
      }
    }
  }

  /// Try each substituter in order. Errors fall through to the next one.
  async fn substitute(&self, job: &BuildJob) -> Option<BTreeMap<String, StorePath>> {
    let slots: Vec<String> = job.outputs.iter().map(|o| o.slot.clone()).collect();

    for substituter in self.engine.substituters() {
      if self.engine.cancellation().is_cancelled() {
        return None;
      }
      match substituter
        .substitute(self.engine.store(), &job.fingerprint, &slots, Some(&self.guard))
        .await
      {
        Ok(Some(outputs)) => return Some(outputs),
        Ok(None) => {}
        Err(e) => warn!(
          recipe = %job.recipe,
          substituter = %substituter.url(),
          error = %e,
          "substitution failed, trying next source"
        ),
      }
    }
    None
  }

  fn record(
    &self,
    job: &BuildJob,
    outputs: &BTreeMap<String, StorePath>,
    origin: ResultOrigin,
  ) -> Result<(), BuildFailure> {
    let record = ResultRecord::new(job.fingerprint.clone(), job.recipe.as_str(), outputs.clone(), origin);
    self
      .engine
      .store()
      .write_result(&record)
      .map_err(|e| BuildFailure::Io { message: e.to_string() })
  }

  async fn push(&self, job: &BuildJob, outputs: &BTreeMap<String, StorePath>) {
    for substituter in self.engine.substituters().iter().filter(|s| s.is_writable()) {
      match substituter.push(self.engine.store(), &job.fingerprint, outputs).await {
        Ok(()) => debug!(recipe = %job.recipe, substituter = %substituter.url(), "pushed outputs"),
        Err(e) => warn!(recipe = %job.recipe, substituter = %substituter.url(), error = %e, "failed to push outputs"),
      }
    }
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::config::{ExecuteConfig, Isolation};
  use crate::recipe::GraphError;
  use crate::store::{Content, Store};
  use crate::substitute::{LocalCache, Substituter};
  use crate::util::testutil::{graph_of, ids, shell_recipe, with_path_input};
  use std::path::{Path, PathBuf};
  use std::time::Duration;
  use tempfile::TempDir;
  use tokio_util::sync::CancellationToken;

  /// Builders here count their runs in a host file, so they run unisolated.
  fn engine_at(root: &Path) -> Engine {
    Engine::new(Store::open(root).unwrap()).with_config(ExecuteConfig {
      max_jobs: 4,
      isolation: Isolation::Off,
      ..ExecuteConfig::default()
    })
  }

  /// A script that counts its executions in `counter` before writing `$out`.
  fn counted(counter: &Path, body: &str) -> String {
    format!("echo run >> {}; {}", counter.display(), body)
  }

  fn runs(counter: &Path) -> usize {
    std::fs::read_to_string(counter)
      .map(|s| s.lines().count())
      .unwrap_or(0)
  }

  fn status<'a>(report: &'a RealizeReport, id: &str) -> &'a BuildStatus {
    &report.get(&RecipeId::from(id)).unwrap().status
  }

  fn output(report: &RealizeReport, id: &str) -> StorePath {
    report.get(&RecipeId::from(id)).unwrap().outputs["out"].clone()
  }

  #[tokio::test]
  async fn builds_dependencies_first() {
    let temp = TempDir::new().unwrap();
    let engine = engine_at(&temp.path().join("store"));
    let graph = graph_of(vec![
      ("a", shell_recipe("echo A > $out", &[])),
      ("b", shell_recipe("cat $input_a > $out; echo B >> $out", &["a"])),
    ]);

    let report = engine
      .realize(&graph, &ids(&["b"]), &RealizeOptions::default())
      .await
      .unwrap();

    assert!(report.is_success());
    assert_eq!(status(&report, "a"), &BuildStatus::Built);
    assert_eq!(status(&report, "b"), &BuildStatus::Built);

    let b = engine.store().get(&output(&report, "b")).unwrap();
    assert_eq!(b.read_bytes().unwrap(), b"A\nB\n");
    assert_eq!(b.info.references, BTreeSet::from([output(&report, "a")]));
    assert_eq!(b.path().name(), "b");
  }

  #[tokio::test]
  async fn realized_recipes_are_cached() {
    let temp = TempDir::new().unwrap();
    let counter = temp.path().join("count");
    let engine = engine_at(&temp.path().join("store"));
    let graph = graph_of(vec![("a", shell_recipe(&counted(&counter, "echo A > $out"), &[]))]);

    let first = engine
      .realize(&graph, &ids(&["a"]), &RealizeOptions::default())
      .await
      .unwrap();
    let second = engine
      .realize(&graph, &ids(&["a"]), &RealizeOptions::default())
      .await
      .unwrap();

    assert_eq!(runs(&counter), 1);
    assert_eq!(status(&second, "a"), &BuildStatus::Cached);
    assert_eq!(output(&first, "a"), output(&second, "a"));
  }

  #[tokio::test]
  async fn rebuild_ignores_cache() {
    let temp = TempDir::new().unwrap();
    let counter = temp.path().join("count");
    let engine = engine_at(&temp.path().join("store"));
    let graph = graph_of(vec![("a", shell_recipe(&counted(&counter, "echo A > $out"), &[]))]);

    engine
      .realize(&graph, &ids(&["a"]), &RealizeOptions::default())
      .await
      .unwrap();
    let again = engine
      .realize(
        &graph,
        &ids(&["a"]),
        &RealizeOptions {
          rebuild: true,
          ..RealizeOptions::default()
        },
      )
      .await
      .unwrap();

    assert_eq!(runs(&counter), 2);
    assert_eq!(status(&again, "a"), &BuildStatus::Built);
  }

  #[tokio::test]
  async fn deleted_outputs_invalidate_the_cache() {
    let temp = TempDir::new().unwrap();
    let counter = temp.path().join("count");
    let engine = engine_at(&temp.path().join("store"));
    let graph = graph_of(vec![("a", shell_recipe(&counted(&counter, "echo A > $out"), &[]))]);

    let first = engine
      .realize(&graph, &ids(&["a"]), &RealizeOptions::default())
      .await
      .unwrap();
    engine.store().delete(&output(&first, "a")).unwrap();

    let second = engine
      .realize(&graph, &ids(&["a"]), &RealizeOptions::default())
      .await
      .unwrap();
    assert_eq!(runs(&counter), 2);
    assert_eq!(status(&second, "a"), &BuildStatus::Built);
    assert!(engine.store().exists(&output(&second, "a")));
  }

  #[tokio::test]
  async fn changed_dependency_changes_dependent_output() {
    let temp = TempDir::new().unwrap();
    let engine = engine_at(&temp.path().join("store"));
    let downstream = "cat $input_a > $out";

    let one = graph_of(vec![
      ("a", shell_recipe("echo 1 > $out", &[])),
      ("b", shell_recipe(downstream, &["a"])),
    ]);
    let two = graph_of(vec![
      ("a", shell_recipe("echo 2 > $out", &[])),
      ("b", shell_recipe(downstream, &["a"])),
    ]);

    let r1 = engine.realize(&one, &ids(&["b"]), &RealizeOptions::default()).await.unwrap();
    let r2 = engine.realize(&two, &ids(&["b"]), &RealizeOptions::default()).await.unwrap();

    assert_ne!(output(&r1, "b"), output(&r2, "b"));
    assert_ne!(
      r1.get(&RecipeId::from("b")).unwrap().fingerprint,
      r2.get(&RecipeId::from("b")).unwrap().fingerprint
    );
  }

  #[tokio::test]
  async fn failure_propagates_only_downstream() {
    let temp = TempDir::new().unwrap();
    let engine = engine_at(&temp.path().join("store"));
    let graph = graph_of(vec![
      ("a", shell_recipe("echo broken >&2; exit 1", &[])),
      ("b", shell_recipe("cat $input_a > $out", &["a"])),
      ("c", shell_recipe("touch $out", &["b"])),
      ("d", shell_recipe("echo ok > $out", &[])),
    ]);

    let report = engine
      .realize(&graph, &ids(&["c", "d"]), &RealizeOptions::default())
      .await
      .unwrap();

    assert!(!report.is_success());
    assert_eq!(
      status(&report, "a"),
      &BuildStatus::Failed(BuildFailure::ExitCode { code: 1 })
    );
    let dependency_failed = BuildStatus::Failed(BuildFailure::DependencyFailed {
      dependency: RecipeId::from("a"),
    });
    assert_eq!(status(&report, "b"), &dependency_failed);
    assert_eq!(status(&report, "c"), &dependency_failed);
    assert_eq!(status(&report, "d"), &BuildStatus::Built);
    assert!(report.get(&RecipeId::from("a")).unwrap().log.as_deref().unwrap().contains("broken"));
  }

  #[tokio::test]
  async fn stop_on_first_failure_aborts_the_rest() {
    let temp = TempDir::new().unwrap();
    let engine = engine_at(&temp.path().join("store")).with_config(ExecuteConfig {
      max_jobs: 1,
      ..ExecuteConfig::default()
    });
    let graph = graph_of(vec![
      ("a", shell_recipe("exit 1", &[])),
      ("b", shell_recipe("echo ok > $out", &[])),
    ]);

    let report = engine
      .realize(
        &graph,
        &ids(&["a", "b"]),
        &RealizeOptions {
          stop_on_first_failure: true,
          ..RealizeOptions::default()
        },
      )
      .await
      .unwrap();

    assert_eq!(status(&report, "b"), &BuildStatus::Failed(BuildFailure::Aborted));
    assert!(engine.store().list().unwrap().is_empty());
  }

  #[tokio::test]
  async fn cycles_are_rejected_before_anything_runs() {
    let temp = TempDir::new().unwrap();
    let counter = temp.path().join("count");
    let engine = engine_at(&temp.path().join("store"));
    let graph = graph_of(vec![
      ("a", shell_recipe(&counted(&counter, "touch $out"), &["b"])),
      ("b", shell_recipe(&counted(&counter, "touch $out"), &["a"])),
      ("c", shell_recipe(&counted(&counter, "touch $out"), &[])),
    ]);

    let err = engine
      .realize(&graph, &ids(&["c"]), &RealizeOptions::default())
      .await
      .unwrap_err();

    assert!(matches!(err, RealizeError::Graph(GraphError::CycleDetected { .. })));
    assert_eq!(runs(&counter), 0);
  }

  #[tokio::test]
  async fn unknown_target_is_rejected() {
    let temp = TempDir::new().unwrap();
    let engine = engine_at(&temp.path().join("store"));
    let graph = graph_of(vec![("a", shell_recipe("touch $out", &[]))]);

    let err = engine
      .realize(&graph, &ids(&["nope"]), &RealizeOptions::default())
      .await
      .unwrap_err();
    assert!(matches!(err, RealizeError::Graph(GraphError::UnknownTarget(_))));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_realizations_build_once() {
    let temp = TempDir::new().unwrap();
    let counter = temp.path().join("count");
    let store_root = temp.path().join("store");
    let graph = graph_of(vec![(
      "slow",
      shell_recipe(&counted(&counter, "sleep 1; echo done > $out"), &[]),
    )]);

    // Two engines stand in for two processes sharing the store.
    let first = engine_at(&store_root);
    let second = engine_at(&store_root);
    let targets = ids(&["slow"]);
    let options = RealizeOptions::default();

    let (r1, r2) = tokio::join!(
      first.realize(&graph, &targets, &options),
      second.realize(&graph, &targets, &options)
    );
    let (r1, r2) = (r1.unwrap(), r2.unwrap());

    assert_eq!(runs(&counter), 1);
    assert_eq!(output(&r1, "slow"), output(&r2, "slow"));
    let statuses = [status(&r1, "slow").clone(), status(&r2, "slow").clone()];
    assert!(statuses.contains(&BuildStatus::Built));
    assert!(statuses.contains(&BuildStatus::Cached));
  }

  #[tokio::test]
  async fn missing_path_input_fails_the_recipe() {
    let temp = TempDir::new().unwrap();
    let engine = engine_at(&temp.path().join("store"));
    let ghost: StorePath = "0123456789abcdef0123456789abcdef-ghost".parse().unwrap();
    let graph = graph_of(vec![(
      "a",
      with_path_input(shell_recipe("cat $input_src > $out", &[]), "src", &ghost),
    )]);

    let report = engine
      .realize(&graph, &ids(&["a"]), &RealizeOptions::default())
      .await
      .unwrap();
    assert_eq!(
      status(&report, "a"),
      &BuildStatus::Failed(BuildFailure::InputMissing { path: ghost })
    );
  }

  #[tokio::test]
  async fn path_inputs_are_available() {
    let temp = TempDir::new().unwrap();
    let engine = engine_at(&temp.path().join("store"));
    let src = engine
      .store()
      .put("src", Content::bytes("source"), &BTreeSet::new())
      .unwrap();
    let graph = graph_of(vec![(
      "a",
      with_path_input(shell_recipe("cat $input_src > $out", &[]), "src", &src),
    )]);

    let report = engine
      .realize(&graph, &ids(&["a"]), &RealizeOptions::default())
      .await
      .unwrap();
    let artifact = engine.store().get(&output(&report, "a")).unwrap();
    assert_eq!(artifact.read_bytes().unwrap(), b"source");
  }

  struct CacheFixture {
    _temp: TempDir,
    counter: PathBuf,
    cache_dir: PathBuf,
    graph: RecipeGraph,
    builder: Engine,
    consumer: Engine,
  }

  /// One engine builds and pushes to a local cache; another shares the cache.
  async fn pushed_to_cache() -> CacheFixture {
    let temp = TempDir::new().unwrap();
    let counter = temp.path().join("count");
    let cache_dir = temp.path().join("cache");
    let cache = || vec![Substituter::Local(LocalCache::new(&cache_dir))];

    let graph = graph_of(vec![("a", shell_recipe(&counted(&counter, "echo A > $out"), &[]))]);
    let builder = engine_at(&temp.path().join("builder")).with_substituters(cache());
    let consumer = engine_at(&temp.path().join("consumer")).with_substituters(cache());

    let report = builder
      .realize(
        &graph,
        &ids(&["a"]),
        &RealizeOptions {
          push: true,
          ..RealizeOptions::default()
        },
      )
      .await
      .unwrap();
    assert_eq!(status(&report, "a"), &BuildStatus::Built);

    CacheFixture {
      _temp: temp,
      counter,
      cache_dir,
      graph,
      builder,
      consumer,
    }
  }

  #[tokio::test]
  async fn substitutes_pushed_outputs() {
    let f = pushed_to_cache().await;

    let report = f
      .consumer
      .realize(&f.graph, &ids(&["a"]), &RealizeOptions::default())
      .await
      .unwrap();

    assert_eq!(status(&report, "a"), &BuildStatus::Substituted);
    assert_eq!(runs(&f.counter), 1);
    let artifact = f.consumer.store().get(&output(&report, "a")).unwrap();
    assert_eq!(artifact.read_bytes().unwrap(), b"A\n");

    // Recorded, so the next run is a cache hit.
    let again = f
      .consumer
      .realize(&f.graph, &ids(&["a"]), &RealizeOptions::default())
      .await
      .unwrap();
    assert_eq!(status(&again, "a"), &BuildStatus::Cached);
  }

  #[tokio::test]
  async fn corrupt_substitute_falls_back_to_building() {
    let f = pushed_to_cache().await;

    // Swap the cached archive for one with different content.
    let built = f.builder.store().list().unwrap();
    let evil = f
      .builder
      .store()
      .put("a", Content::bytes("evil\n"), &BTreeSet::new())
      .unwrap();
    let archive = crate::store::archive::export_archive(f.builder.store(), &evil).unwrap();
    let cache = LocalCache::new(&f.cache_dir);
    std::fs::write(cache.object_file(&built[0]), archive).unwrap();

    let report = f
      .consumer
      .realize(&f.graph, &ids(&["a"]), &RealizeOptions::default())
      .await
      .unwrap();

    assert_eq!(status(&report, "a"), &BuildStatus::Built);
    assert_eq!(runs(&f.counter), 2);
    assert!(!f.consumer.store().exists(&evil));
    let artifact = f.consumer.store().get(&output(&report, "a")).unwrap();
    assert_eq!(artifact.read_bytes().unwrap(), b"A\n");
  }

  #[tokio::test]
  async fn cancellation_stops_running_and_queued_recipes() {
    let temp = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    let engine = engine_at(&temp.path().join("store")).with_cancellation(cancel.clone());
    let graph = graph_of(vec![
      ("slow", shell_recipe("sleep 30; touch $out", &[])),
      ("after", shell_recipe("cat $input_slow > $out", &["slow"])),
    ]);

    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(300)).await;
      trigger.cancel();
    });

    let report = engine
      .realize(&graph, &ids(&["after"]), &RealizeOptions::default())
      .await
      .unwrap();

    assert_eq!(status(&report, "slow"), &BuildStatus::Failed(BuildFailure::Cancelled));
    assert_eq!(status(&report, "after"), &BuildStatus::Failed(BuildFailure::Cancelled));
  }

  #[tokio::test]
  async fn board_ends_in_terminal_states() {
    let temp = TempDir::new().unwrap();
    let engine = engine_at(&temp.path().join("store"));
    let graph = graph_of(vec![
      ("a", shell_recipe("touch $out", &[])),
      ("b", shell_recipe("exit 2", &["a"])),
      ("c", shell_recipe("touch $out", &["b"])),
    ]);
    let board = StatusBoard::new();

    engine
      .realize_with_board(&graph, &ids(&["c"]), &RealizeOptions::default(), &board)
      .await
      .unwrap();

    assert_eq!(
      board.snapshot(),
      vec![
        (RecipeId::from("a"), RecipeState::Succeeded),
        (RecipeId::from("b"), RecipeState::Failed),
        (RecipeId::from("c"), RecipeState::Failed),
      ]
    );
  }

  #[tokio::test]
  async fn temp_roots_are_released_after_realize() {
    let temp = TempDir::new().unwrap();
    let engine = engine_at(&temp.path().join("store"));
    let graph = graph_of(vec![("a", shell_recipe("touch $out", &[]))]);

    engine
      .realize(&graph, &ids(&["a"]), &RealizeOptions::default())
      .await
      .unwrap();

    let remaining = std::fs::read_dir(engine.store().temp_roots_dir()).unwrap().count();
    assert_eq!(remaining, 0);
    // Nothing roots the output any more.
    let gc = engine.collect_garbage(&crate::gc::GcOptions::default()).unwrap();
    assert_eq!(gc.deleted.len(), 1);
  }
}
