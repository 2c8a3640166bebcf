//! The recipe dependency graph.
//!
//! Recipes are nodes in a petgraph arena, added in declaration order so node
//! indices double as the tie-breaking order. Edges point from a dependency to
//! its dependent. All traversals use explicit worklists.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::path::PathBuf;

use indexmap::IndexMap;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use super::{GraphSpec, InputIdentity, InputRef, Recipe, RecipeId, RecipeIdentity};
use crate::consts::{MAX_NAME_LEN, RECIPE_PATH_SUFFIX};
use crate::store::{StorePath, StorePathError, path::sanitize_name};
use crate::util::hash::{Fingerprint, Hashable};

#[derive(Debug, Error)]
pub enum GraphError {
  #[error("dependency cycle detected: {}", format_cycle(.cycle))]
  CycleDetected { cycle: Vec<RecipeId> },

  #[error("recipe '{recipe}' input '{input}' references unknown recipe '{target}'")]
  UnresolvedReference {
    recipe: RecipeId,
    input: String,
    target: RecipeId,
  },

  #[error("recipe '{recipe}' input '{input}' references output '{output}' which '{dependency}' does not declare")]
  UnknownOutput {
    recipe: RecipeId,
    input: String,
    dependency: RecipeId,
    output: String,
  },

  #[error("recipe '{0}' declares no outputs")]
  NoOutputs(RecipeId),

  #[error("recipe '{recipe}' declares output '{output}' more than once")]
  DuplicateOutput { recipe: RecipeId, output: String },

  #[error("recipe '{recipe}' has an invalid name: {source}")]
  InvalidName {
    recipe: RecipeId,
    #[source]
    source: StorePathError,
  },

  #[error("recipe '{recipe}' has invalid {kind} name '{name}': use letters, digits, '_' and '-'")]
  InvalidIdentifier {
    recipe: RecipeId,
    kind: &'static str,
    name: String,
  },

  #[error("unknown target recipe '{0}'")]
  UnknownTarget(RecipeId),

  #[error("failed to fingerprint recipe '{recipe}': {source}")]
  Fingerprint {
    recipe: RecipeId,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to read recipe graph {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse recipe graph {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
}

/// Input aliases and output slots become file and variable names in the sandbox.
fn check_identifier(recipe: &RecipeId, kind: &'static str, name: &str) -> Result<(), GraphError> {
  let valid = !name.is_empty()
    && !name.starts_with('-')
    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
  if valid {
    Ok(())
  } else {
    Err(GraphError::InvalidIdentifier {
      recipe: recipe.clone(),
      kind,
      name: name.to_string(),
    })
  }
}

fn format_cycle(cycle: &[RecipeId]) -> String {
  cycle.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(" -> ")
}

/// An immutable graph of recipes.
#[derive(Debug, Clone)]
pub struct RecipeGraph {
  graph: DiGraph<RecipeId, ()>,
  nodes: HashMap<RecipeId, NodeIndex>,
  recipes: IndexMap<RecipeId, Recipe>,
}

impl RecipeGraph {
  /// Build the graph. References to unknown recipes get no edge; they are
  /// reported by [`RecipeGraph::validate`].
  pub fn from_spec(spec: GraphSpec) -> Self {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();

    for id in spec.recipes.keys() {
      let idx = graph.add_node(id.clone());
      nodes.insert(id.clone(), idx);
    }

    for (id, recipe) in &spec.recipes {
      let dependent = nodes[id];
      for input in recipe.inputs.values() {
        if let InputRef::Recipe { recipe: dep, .. } = input
          && let Some(&dependency) = nodes.get(dep)
          && graph.find_edge(dependency, dependent).is_none()
        {
          graph.add_edge(dependency, dependent, ());
        }
      }
    }

    Self {
      graph,
      nodes,
      recipes: spec.recipes,
    }
  }

  /// Check that the graph can be scheduled.
  ///
  /// Structural errors are reported before cycles, in declaration order.
  pub fn validate(&self) -> Result<(), GraphError> {
    for (id, recipe) in &self.recipes {
      sanitize_name(self.name(id)).map_err(|source| GraphError::InvalidName {
        recipe: id.clone(),
        source,
      })?;

      if recipe.outputs.is_empty() {
        return Err(GraphError::NoOutputs(id.clone()));
      }

      let mut seen = HashSet::new();
      for output in &recipe.outputs {
        check_identifier(id, "output", output)?;
        if !seen.insert(output.as_str()) {
          return Err(GraphError::DuplicateOutput {
            recipe: id.clone(),
            output: output.clone(),
          });
        }
      }

      for (alias, input) in &recipe.inputs {
        check_identifier(id, "input", alias)?;
        let InputRef::Recipe { recipe: dep, output } = input else {
          continue;
        };
        let Some(dependency) = self.recipes.get(dep) else {
          return Err(GraphError::UnresolvedReference {
            recipe: id.clone(),
            input: alias.clone(),
            target: dep.clone(),
          });
        };
        if !dependency.outputs.contains(output) {
          return Err(GraphError::UnknownOutput {
            recipe: id.clone(),
            input: alias.clone(),
            dependency: dep.clone(),
            output: output.clone(),
          });
        }
      }
    }

    if let Some(cycle) = self.find_cycle() {
      return Err(GraphError::CycleDetected { cycle });
    }

    Ok(())
  }

  /// Depth-first search over dependency edges with an explicit stack.
  ///
  /// Returns the ids along one cycle, with the first id repeated at the end.
  fn find_cycle(&self) -> Option<Vec<RecipeId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
      New,
      OnPath,
      Done,
    }

    let mut marks = vec![Mark::New; self.graph.node_count()];

    for start in self.graph.node_indices() {
      if marks[start.index()] != Mark::New {
        continue;
      }

      // Each frame is a node and its not-yet-visited dependencies.
      let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = vec![(start, self.sorted_neighbors(start, Direction::Incoming))];
      marks[start.index()] = Mark::OnPath;

      while let Some((node, pending)) = stack.last_mut() {
        let node = *node;
        match pending.pop() {
          Some(next) => match marks[next.index()] {
            Mark::New => {
              marks[next.index()] = Mark::OnPath;
              let neighbors = self.sorted_neighbors(next, Direction::Incoming);
              stack.push((next, neighbors));
            }
            Mark::OnPath => {
              let from = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
              let mut cycle: Vec<RecipeId> = stack[from..].iter().map(|(n, _)| self.graph[*n].clone()).collect();
              cycle.push(self.graph[next].clone());
              return Some(cycle);
            }
            Mark::Done => {}
          },
          None => {
            marks[node.index()] = Mark::Done;
            stack.pop();
          }
        }
      }
    }

    None
  }

  /// Neighbors in reverse declaration order, so popping yields declaration order.
  fn sorted_neighbors(&self, node: NodeIndex, direction: Direction) -> Vec<NodeIndex> {
    let mut neighbors: Vec<_> = self.graph.neighbors_directed(node, direction).collect();
    neighbors.sort_by_key(|n| std::cmp::Reverse(n.index()));
    neighbors
  }

  fn ids_of(&self, mut indices: Vec<NodeIndex>) -> Vec<RecipeId> {
    indices.sort();
    indices.into_iter().map(|n| self.graph[n].clone()).collect()
  }

  pub fn len(&self) -> usize {
    self.recipes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.recipes.is_empty()
  }

  pub fn contains(&self, id: &RecipeId) -> bool {
    self.recipes.contains_key(id)
  }

  pub fn recipe(&self, id: &RecipeId) -> Option<&Recipe> {
    self.recipes.get(id)
  }

  /// Recipe ids in declaration order.
  pub fn ids(&self) -> impl Iterator<Item = &RecipeId> {
    self.recipes.keys()
  }

  /// Position of a recipe in declaration order.
  pub fn position(&self, id: &RecipeId) -> Option<usize> {
    self.nodes.get(id).map(|n| n.index())
  }

  /// The name used for a recipe's outputs.
  pub fn name<'a>(&'a self, id: &'a RecipeId) -> &'a str {
    self
      .recipes
      .get(id)
      .and_then(|r| r.name.as_deref())
      .unwrap_or(id.as_str())
  }

  /// Recipes that `id` directly depends on, in declaration order.
  pub fn dependencies(&self, id: &RecipeId) -> Vec<RecipeId> {
    match self.nodes.get(id) {
      Some(&n) => self.ids_of(self.graph.neighbors_directed(n, Direction::Incoming).collect()),
      None => Vec::new(),
    }
  }

  /// Recipes that directly depend on `id`, in declaration order.
  pub fn dependents(&self, id: &RecipeId) -> Vec<RecipeId> {
    match self.nodes.get(id) {
      Some(&n) => self.ids_of(self.graph.neighbors_directed(n, Direction::Outgoing).collect()),
      None => Vec::new(),
    }
  }

  /// Recipes not in `completed` whose recipe inputs are all in `completed`.
  pub fn ready_children(&self, completed: &HashSet<RecipeId>) -> Vec<RecipeId> {
    self
      .recipes
      .keys()
      .filter(|id| !completed.contains(*id))
      .filter(|id| self.dependencies(id).iter().all(|dep| completed.contains(dep)))
      .cloned()
      .collect()
  }

  /// The targets and everything they transitively depend on, in declaration order.
  pub fn closure(&self, targets: &[RecipeId]) -> Result<Vec<RecipeId>, GraphError> {
    let mut seen = vec![false; self.graph.node_count()];
    let mut worklist = Vec::new();

    for target in targets {
      let &idx = self
        .nodes
        .get(target)
        .ok_or_else(|| GraphError::UnknownTarget(target.clone()))?;
      worklist.push(idx);
    }

    while let Some(node) = worklist.pop() {
      if std::mem::replace(&mut seen[node.index()], true) {
        continue;
      }
      worklist.extend(self.graph.neighbors_directed(node, Direction::Incoming));
    }

    Ok(
      self
        .graph
        .node_indices()
        .filter(|n| seen[n.index()])
        .map(|n| self.graph[n].clone())
        .collect(),
    )
  }

  /// Recipe ids ordered so dependencies come first. Kahn's algorithm, ties
  /// broken by declaration order.
  pub fn topological_order(&self) -> Result<Vec<RecipeId>, GraphError> {
    let mut in_degree: Vec<usize> = self
      .graph
      .node_indices()
      .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
      .collect();

    let mut ready: VecDeque<NodeIndex> = self.graph.node_indices().filter(|n| in_degree[n.index()] == 0).collect();
    let mut order = Vec::with_capacity(self.graph.node_count());

    while let Some(node) = ready.pop_front() {
      order.push(self.graph[node].clone());
      for dependent in self.sorted_neighbors(node, Direction::Outgoing).into_iter().rev() {
        in_degree[dependent.index()] -= 1;
        if in_degree[dependent.index()] == 0 {
          ready.push_back(dependent);
        }
      }
    }

    if order.len() != self.graph.node_count() {
      let cycle = self.find_cycle().unwrap_or_default();
      return Err(GraphError::CycleDetected { cycle });
    }

    Ok(order)
  }

  /// Compute every recipe's fingerprint.
  pub fn fingerprints(&self) -> Result<HashMap<RecipeId, Fingerprint>, GraphError> {
    let mut fingerprints: HashMap<RecipeId, Fingerprint> = HashMap::new();

    for id in self.topological_order()? {
      let recipe = &self.recipes[&id];
      let mut inputs = BTreeMap::new();

      for (alias, input) in &recipe.inputs {
        let identity = match input {
          InputRef::Path { path } => InputIdentity::Path(path.clone()),
          InputRef::Recipe { recipe: dep, output } => {
            let fingerprint = fingerprints
              .get(dep)
              .cloned()
              .ok_or_else(|| GraphError::UnresolvedReference {
                recipe: id.clone(),
                input: alias.clone(),
                target: dep.clone(),
              })?;
            InputIdentity::Recipe {
              fingerprint,
              output: output.clone(),
            }
          }
        };
        inputs.insert(alias.as_str(), identity);
      }

      let identity = RecipeIdentity {
        name: self.name(&id),
        command: &recipe.command,
        outputs: &recipe.outputs,
        inputs,
      };
      let fingerprint = identity.compute_hash().map_err(|source| GraphError::Fingerprint {
        recipe: id.clone(),
        source,
      })?;
      fingerprints.insert(id, fingerprint);
    }

    Ok(fingerprints)
  }

  /// The path whose lock guards a recipe's realization.
  pub fn recipe_path(&self, id: &RecipeId, fingerprint: &Fingerprint) -> Result<StorePath, StorePathError> {
    let name = sanitize_name(self.name(id))?;
    let name: String = name.chars().take(MAX_NAME_LEN - RECIPE_PATH_SUFFIX.len()).collect();
    StorePath::from_fingerprint(fingerprint, &format!("{}{}", name, RECIPE_PATH_SUFFIX))
  }

  /// Output path name for one slot of a recipe: `<name>` for `out`,
  /// `<name>-<slot>` otherwise.
  pub fn output_name(&self, id: &RecipeId, slot: &str) -> String {
    let name = self.name(id);
    if slot == "out" {
      name.to_string()
    } else {
      format!("{}-{}", name, slot)
    }
  }
}
