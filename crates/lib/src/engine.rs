//! The engine: one store plus everything needed to realize graphs against it.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{ExecuteConfig, Settings};
use crate::gc::{self, GcError, GcOptions, GcResult, TempRoots};
use crate::lock::LockManager;
use crate::recipe::{RecipeGraph, RecipeId};
use crate::scheduler::{self, RealizeError, RealizeOptions, RealizeReport, StatusBoard};
use crate::store::{Store, StoreError};
use crate::substitute::{SubstituteError, Substituter};

#[derive(Debug, Error)]
pub enum EngineError {
  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Substituter(#[from] SubstituteError),
}

/// Realizes recipe graphs against one store. Cheap to clone; clones share
/// the cancellation token.
#[derive(Debug, Clone)]
pub struct Engine {
  store: Store,
  locks: LockManager,
  config: ExecuteConfig,
  substituters: Arc<[Substituter]>,
  cancel: CancellationToken,
}

impl Engine {
  pub fn new(store: Store) -> Self {
    let locks = LockManager::new(&store);
    Self {
      store,
      locks,
      config: ExecuteConfig::default(),
      substituters: Arc::from(Vec::new()),
      cancel: CancellationToken::new(),
    }
  }

  /// Open the configured store and parse the configured substituters.
  pub fn from_settings(settings: &Settings) -> Result<Self, EngineError> {
    let store = Store::open(&settings.store)?;
    let substituters = settings
      .substituters
      .iter()
      .map(|url| Substituter::from_url(url))
      .collect::<Result<Vec<_>, _>>()?;
    debug!(store = %store.root().display(), substituters = substituters.len(), "engine configured");

    Ok(
      Self::new(store)
        .with_config(settings.execute.clone())
        .with_substituters(substituters),
    )
  }

  pub fn with_config(mut self, config: ExecuteConfig) -> Self {
    self.config = config;
    self
  }

  /// Substituters, tried in this order.
  pub fn with_substituters(mut self, substituters: Vec<Substituter>) -> Self {
    self.substituters = Arc::from(substituters);
    self
  }

  /// Use `cancel` to stop realizations, e.g. on Ctrl-C.
  pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
    self.cancel = cancel;
    self
  }

  /// Label recorded in lock metadata for locks this engine takes.
  pub fn with_command(mut self, command: &str) -> Self {
    self.locks = self.locks.with_command(command);
    self
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn locks(&self) -> &LockManager {
    &self.locks
  }

  pub fn config(&self) -> &ExecuteConfig {
    &self.config
  }

  pub fn substituters(&self) -> &[Substituter] {
    &self.substituters
  }

  pub fn cancellation(&self) -> &CancellationToken {
    &self.cancel
  }

  /// Realize `targets` and everything they depend on.
  ///
  /// Per-recipe failures are reported in the returned report; `Err` means
  /// the graph was rejected and nothing ran.
  pub async fn realize(
    &self,
    graph: &RecipeGraph,
    targets: &[RecipeId],
    options: &RealizeOptions,
  ) -> Result<RealizeReport, RealizeError> {
    self
      .realize_with_board(graph, targets, options, &StatusBoard::new())
      .await
  }

  /// [`Engine::realize`], publishing per-recipe state to `board`.
  pub async fn realize_with_board(
    &self,
    graph: &RecipeGraph,
    targets: &[RecipeId],
    options: &RealizeOptions,
    board: &StatusBoard,
  ) -> Result<RealizeReport, RealizeError> {
    let roots = Arc::new(TempRoots::new(&self.store));
    scheduler::realize(self, graph, targets, options, board, roots).await
  }

  /// [`Engine::realize`], recording every path it uses in `roots`.
  ///
  /// The outputs stay safe from collection for as long as the caller keeps
  /// `roots`, which leaves room to register permanent roots for them.
  pub async fn realize_pinned(
    &self,
    graph: &RecipeGraph,
    targets: &[RecipeId],
    options: &RealizeOptions,
    roots: Arc<TempRoots>,
  ) -> Result<RealizeReport, RealizeError> {
    scheduler::realize(self, graph, targets, options, &StatusBoard::new(), roots).await
  }

  /// Delete everything not reachable from a root. Waits while realizations
  /// are registering temp roots.
  pub fn collect_garbage(&self, options: &GcOptions) -> Result<GcResult, GcError> {
    gc::collect_garbage(&self.store, &self.locks.clone().with_command("gc"), options)
  }
}
