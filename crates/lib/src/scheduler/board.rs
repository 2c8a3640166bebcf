use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;
use tracing::warn;

use super::RecipeState;
use crate::recipe::RecipeId;

/// Shared view of every recipe's scheduling state during a realize call.
///
/// Clones share the same board, so an observer can poll it while the
/// scheduler runs. Terminal states are final.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
  states: Arc<Mutex<IndexMap<RecipeId, RecipeState>>>,
}

impl StatusBoard {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, IndexMap<RecipeId, RecipeState>> {
    self.states.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Start tracking `ids`, all pending. Clears any earlier run.
  pub(crate) fn reset(&self, ids: &[RecipeId]) {
    let mut states = self.lock();
    states.clear();
    states.extend(ids.iter().map(|id| (id.clone(), RecipeState::Pending)));
  }

  /// Move `id` to `state`. Returns `false` (and changes nothing) if the
  /// recipe already reached a terminal state.
  pub(crate) fn set(&self, id: &RecipeId, state: RecipeState) -> bool {
    let mut states = self.lock();
    let current = states.entry(id.clone()).or_insert(RecipeState::Pending);
    if current.is_terminal() {
      warn!(recipe = %id, from = ?current, to = ?state, "ignoring transition out of terminal state");
      return false;
    }
    *current = state;
    true
  }

  pub fn get(&self, id: &RecipeId) -> Option<RecipeState> {
    self.lock().get(id).copied()
  }

  /// Every tracked recipe and its state, in the order they were added.
  pub fn snapshot(&self) -> Vec<(RecipeId, RecipeState)> {
    self.lock().iter().map(|(id, state)| (id.clone(), *state)).collect()
  }

  pub fn count(&self, state: RecipeState) -> usize {
    self.lock().values().filter(|s| **s == state).count()
  }
}
