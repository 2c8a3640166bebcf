//! Types for realizing a recipe graph.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::recipe::{GraphError, RecipeId};
use crate::store::StorePath;
use crate::util::hash::Fingerprint;

/// Why a recipe did not produce its outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildFailure {
  /// The builder exited with a nonzero code.
  ExitCode { code: i32 },
  /// The builder was killed by a signal.
  Signal { signal: i32 },
  /// The builder exceeded the wall-clock limit.
  Timeout { seconds: u64 },
  /// The builder succeeded but did not create a declared output.
  OutputMissing { output: String },
  /// A declared input is not a valid store path.
  InputMissing { path: StorePath },
  /// The command could not be prepared (bad placeholder, unknown builder).
  InvalidCommand { message: String },
  /// Filesystem or store error while staging, running or committing.
  Io { message: String },
  /// The realize call was cancelled while this recipe was running.
  Cancelled,
  /// A recipe this one depends on failed; this one never ran.
  DependencyFailed { dependency: RecipeId },
  /// Scheduling stopped after an earlier failure.
  Aborted,
}

impl fmt::Display for BuildFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BuildFailure::ExitCode { code } => write!(f, "builder exited with code {}", code),
      BuildFailure::Signal { signal } => write!(f, "builder killed by signal {}", signal),
      BuildFailure::Timeout { seconds } => write!(f, "builder timed out after {}s", seconds),
      BuildFailure::OutputMissing { output } => write!(f, "builder did not produce output '{}'", output),
      BuildFailure::InputMissing { path } => write!(f, "input {} is not in the store", path),
      BuildFailure::InvalidCommand { message } => write!(f, "invalid command: {}", message),
      BuildFailure::Io { message } => write!(f, "i/o error: {}", message),
      BuildFailure::Cancelled => write!(f, "cancelled"),
      BuildFailure::DependencyFailed { dependency } => write!(f, "dependency '{}' failed", dependency),
      BuildFailure::Aborted => write!(f, "aborted after an earlier failure"),
    }
  }
}

/// Terminal status of a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum BuildStatus {
  /// Executed locally in the sandbox.
  Built,
  /// Fetched from a substituter.
  Substituted,
  /// A valid earlier result was reused.
  Cached,
  Failed(BuildFailure),
}

impl BuildStatus {
  pub fn is_success(&self) -> bool {
    !matches!(self, BuildStatus::Failed(_))
  }

  pub fn failure(&self) -> Option<&BuildFailure> {
    match self {
      BuildStatus::Failed(failure) => Some(failure),
      _ => None,
    }
  }
}

impl fmt::Display for BuildStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      BuildStatus::Built => write!(f, "built"),
      BuildStatus::Substituted => write!(f, "substituted"),
      BuildStatus::Cached => write!(f, "cached"),
      BuildStatus::Failed(failure) => write!(f, "failed: {}", failure),
    }
  }
}

/// Outcome of realizing one recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildResult {
  pub recipe: RecipeId,
  pub fingerprint: Fingerprint,
  /// Output slot to store path. Empty for failed recipes.
  pub outputs: BTreeMap<String, StorePath>,
  pub status: BuildStatus,
  /// Captured stdout and stderr of the builder, when it ran.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub log: Option<String>,
}

/// Per-recipe scheduling state.
///
/// `Succeeded` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeState {
  Pending,
  Queued,
  Running,
  Succeeded,
  Failed,
}

impl RecipeState {
  pub fn is_terminal(self) -> bool {
    matches!(self, RecipeState::Succeeded | RecipeState::Failed)
  }
}

#[derive(Debug, Clone, Default)]
pub struct RealizeOptions {
  /// Stop dispatching after the first failure.
  pub stop_on_first_failure: bool,
  /// Skip the result cache and substituters; always build locally.
  pub rebuild: bool,
  /// Push locally built outputs to writable substituters.
  pub push: bool,
}

/// Results of a realize call, one per recipe in the targets' closure, in
/// declaration order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RealizeReport {
  pub targets: Vec<RecipeId>,
  pub results: Vec<BuildResult>,
}

impl RealizeReport {
  pub fn get(&self, id: &RecipeId) -> Option<&BuildResult> {
    self.results.iter().find(|r| &r.recipe == id)
  }

  /// Whether every target succeeded.
  pub fn is_success(&self) -> bool {
    self
      .targets
      .iter()
      .all(|t| self.get(t).is_some_and(|r| r.status.is_success()))
  }

  pub fn failed(&self) -> impl Iterator<Item = &BuildResult> {
    self.results.iter().filter(|r| !r.status.is_success())
  }

  pub fn count(&self, predicate: impl Fn(&BuildStatus) -> bool) -> usize {
    self.results.iter().filter(|r| predicate(&r.status)).count()
  }
}

/// Errors that abort a realize call before any recipe runs.
#[derive(Debug, Error)]
pub enum RealizeError {
  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error("invalid recipe path for '{recipe}': {message}")]
  RecipePath { recipe: RecipeId, message: String },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_serializes_with_reason() {
    let failed = BuildStatus::Failed(BuildFailure::ExitCode { code: 2 });
    let json = serde_json::to_value(&failed).unwrap();
    assert_eq!(
      json,
      serde_json::json!({"status": "failed", "reason": {"kind": "exit_code", "code": 2}})
    );

    let built = serde_json::to_value(BuildStatus::Built).unwrap();
    assert_eq!(built, serde_json::json!({"status": "built"}));
  }

  #[test]
  fn report_success_only_considers_targets() {
    let fp = crate::util::hash::hash_bytes(b"x");
    let result = |id: &str, status| BuildResult {
      recipe: RecipeId::from(id),
      fingerprint: fp.clone(),
      outputs: BTreeMap::new(),
      status,
      log: None,
    };

    let report = RealizeReport {
      targets: vec![RecipeId::from("ok")],
      results: vec![
        result("ok", BuildStatus::Built),
        result("other", BuildStatus::Failed(BuildFailure::Aborted)),
      ],
    };

    assert!(report.is_success());
    assert_eq!(report.failed().count(), 1);
    assert_eq!(report.count(|s| matches!(s, BuildStatus::Built)), 1);
  }
}
