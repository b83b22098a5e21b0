//! Dependency graph construction and batch computation.
//!
//! Nodes are specs; edges point from dependent to dependency, labeled with
//! the declared kind. Edges whose endpoint is not part of the node set are
//! retained but flagged external and never gate scheduling. All traversals
//! iterate nodes and outgoing edges in insertion order, so cycle witnesses
//! and batch layouts are deterministic for a given input.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use sce_store::MetadataStore;
use sce_store::models::{DependencyKind, SpecStatus, SpecType};

/// Errors from graph construction.
#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("spec {0:?} has no metadata under .sce/specs")]
    SpecNotFound(String),

    #[error(transparent)]
    Store(#[from] sce_store::StoreError),
}

/// A node in the dependency graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub name: String,
    pub spec_type: SpecType,
    pub status: SpecStatus,
    pub assignee: Option<String>,
}

/// An outgoing edge from a dependent spec to one of its dependencies.
#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub target: String,
    pub kind: DependencyKind,
    /// True when the target is not part of the node set. External edges are
    /// surfaced as warnings and do not gate scheduling for this run.
    pub external: bool,
}

/// Immutable dependency graph over a set of specs.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
    /// Outgoing edges, parallel to `nodes`.
    edges: Vec<Vec<GraphEdge>>,
}

impl DependencyGraph {
    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter()
    }

    pub fn edges_of(&self, name: &str) -> &[GraphEdge] {
        self.index
            .get(name)
            .map(|&i| self.edges[i].as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Detect a dependency cycle with an iterative depth-first traversal.
    ///
    /// Considers every in-set edge regardless of kind (the metadata
    /// invariant requires the union of all dependencies to be acyclic).
    /// Returns the first witnessing cycle as an ordered list with the start
    /// vertex repeated at the end, e.g. `[a, b, a]`.
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        let n = self.nodes.len();
        let mut visited = vec![false; n];
        let mut on_stack = vec![false; n];

        for start in 0..n {
            if visited[start] {
                continue;
            }

            // Stack frames: (node index, next outgoing-edge position).
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            let mut path: Vec<usize> = vec![start];
            visited[start] = true;
            on_stack[start] = true;

            loop {
                let Some(&(node, edge_pos)) = stack.last() else {
                    break;
                };
                let next = self.edges[node][edge_pos..]
                    .iter()
                    .enumerate()
                    .find_map(|(offset, e)| {
                        if e.external {
                            return None;
                        }
                        self.index.get(&e.target).map(|&t| (offset, t))
                    });

                match next {
                    Some((offset, target)) => {
                        if let Some(frame) = stack.last_mut() {
                            frame.1 = edge_pos + offset + 1;
                        }
                        if on_stack[target] {
                            // Found a cycle: slice the path from the first
                            // occurrence of `target` and close the loop.
                            let from = path.iter().position(|&p| p == target)
                                .expect("on-stack node is always on the path");
                            let mut witness: Vec<String> = path[from..]
                                .iter()
                                .map(|&i| self.nodes[i].name.clone())
                                .collect();
                            witness.push(self.nodes[target].name.clone());
                            return Some(witness);
                        }
                        if !visited[target] {
                            visited[target] = true;
                            on_stack[target] = true;
                            stack.push((target, 0));
                            path.push(target);
                        }
                    }
                    None => {
                        stack.pop();
                        on_stack[node] = false;
                        path.pop();
                    }
                }
            }
        }

        None
    }

    /// Layered Kahn-style topological sort.
    ///
    /// Batch *k* contains every spec from `specs` whose blocking
    /// dependencies (in-set, non-optional) all sit in batches `0..k`.
    /// Order within a batch equals the order of `specs`. Terminates when no
    /// progress is possible; on cycle-free inputs every spec is placed.
    pub fn compute_batches(&self, specs: &[String]) -> Vec<Vec<String>> {
        let requested: HashSet<&str> = specs.iter().map(String::as_str).collect();
        let mut placed: HashSet<&str> = HashSet::new();
        let mut remaining: Vec<&str> = specs
            .iter()
            .map(String::as_str)
            .filter(|s| self.index.contains_key(*s))
            .collect();

        let mut batches = Vec::new();
        while !remaining.is_empty() {
            let ready: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|name| {
                    self.edges_of(name).iter().all(|e| {
                        e.external
                            || e.kind == DependencyKind::Optional
                            || !requested.contains(e.target.as_str())
                            || placed.contains(e.target.as_str())
                    })
                })
                .collect();

            if ready.is_empty() {
                // No progress possible (cycle among the remaining specs).
                break;
            }

            for name in &ready {
                placed.insert(*name);
            }
            remaining.retain(|name| !placed.contains(name));
            batches.push(ready.into_iter().map(str::to_owned).collect());
        }

        batches
    }

    /// Specs that are schedulable right now based on metadata statuses:
    /// not already completed, in-progress, or blocked, with every
    /// `requires-completion` dependency completed and every
    /// `requires-interface` dependency at least in-progress. Optional and
    /// external edges never block.
    pub fn get_ready(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|node| {
                !matches!(
                    node.status,
                    SpecStatus::Completed | SpecStatus::InProgress | SpecStatus::Blocked
                )
            })
            .filter(|node| {
                self.edges_of(&node.name).iter().all(|e| {
                    if e.external || e.kind == DependencyKind::Optional {
                        return true;
                    }
                    let Some(dep) = self.node(&e.target) else {
                        return true;
                    };
                    match e.kind {
                        DependencyKind::RequiresCompletion => dep.status == SpecStatus::Completed,
                        DependencyKind::RequiresInterface => matches!(
                            dep.status,
                            SpecStatus::InProgress | SpecStatus::Completed
                        ),
                        DependencyKind::Optional => true,
                    }
                })
            })
            .map(|node| node.name.clone())
            .collect()
    }

    /// All specs transitively dependent on `failed`, found by walking
    /// dependency edges in reverse. Deterministic for a given graph.
    pub fn transitive_dependents(&self, failed: &str) -> Vec<String> {
        // Reverse adjacency: dependency index -> dependent indices.
        let mut reverse: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (from, edges) in self.edges.iter().enumerate() {
            for edge in edges {
                if edge.external {
                    continue;
                }
                if let Some(&to) = self.index.get(&edge.target) {
                    reverse[to].push(from);
                }
            }
        }

        let Some(&start) = self.index.get(failed) else {
            return Vec::new();
        };

        let mut seen = vec![false; self.nodes.len()];
        seen[start] = true;
        let mut stack = vec![start];
        let mut out = Vec::new();
        while let Some(node) = stack.pop() {
            for &dependent in &reverse[node] {
                if !seen[dependent] {
                    seen[dependent] = true;
                    out.push(self.nodes[dependent].name.clone());
                    stack.push(dependent);
                }
            }
        }
        out.sort();
        out
    }
}

/// The immutable plan for a run, built once at `start`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    pub specs: Vec<String>,
    pub batches: Vec<Vec<String>>,
    pub has_cycle: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle_path: Option<Vec<String>>,
}

/// Builds [`DependencyGraph`]s from stored spec metadata.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    store: MetadataStore,
}

impl DependencyResolver {
    pub fn new(store: MetadataStore) -> Self {
        Self { store }
    }

    /// Build the graph over `specs`, or over every spec on disk when `None`.
    ///
    /// A requested spec without metadata is a hard failure. Dependency
    /// targets outside the node set become external edges and are surfaced
    /// as warnings.
    pub async fn build_graph(
        &self,
        specs: Option<&[String]>,
    ) -> Result<DependencyGraph, ResolverError> {
        let records: Vec<(String, sce_store::models::Collaboration)> = match specs {
            Some(names) => {
                let mut out = Vec::with_capacity(names.len());
                for name in names {
                    let collab = self
                        .store
                        .read(name)
                        .await?
                        .ok_or_else(|| ResolverError::SpecNotFound(name.clone()))?;
                    out.push((name.clone(), collab));
                }
                out
            }
            None => self.store.list_all().await?,
        };

        let mut graph = DependencyGraph::default();
        for (name, collab) in &records {
            graph.index.insert(name.clone(), graph.nodes.len());
            graph.nodes.push(GraphNode {
                name: name.clone(),
                spec_type: collab.spec_type,
                status: collab.status.current,
                assignee: collab.status.assignee.clone(),
            });
        }

        for (name, collab) in &records {
            let mut outgoing = Vec::with_capacity(collab.dependencies.len());
            for dep in &collab.dependencies {
                let external = !graph.index.contains_key(&dep.spec);
                if external {
                    warn!(
                        spec = %name,
                        dependency = %dep.spec,
                        "dependency target is outside this run; edge will not gate scheduling"
                    );
                }
                outgoing.push(GraphEdge {
                    target: dep.spec.clone(),
                    kind: dep.kind,
                    external,
                });
            }
            graph.edges.push(outgoing);
        }

        Ok(graph)
    }

    /// Build the full [`ExecutionPlan`] for a run.
    pub async fn plan(&self, specs: &[String]) -> Result<ExecutionPlan, ResolverError> {
        let graph = self.build_graph(Some(specs)).await?;
        let cycle = graph.detect_cycle();
        let batches = if cycle.is_some() {
            Vec::new()
        } else {
            graph.compute_batches(specs)
        };
        Ok(ExecutionPlan {
            specs: specs.to_vec(),
            batches,
            has_cycle: cycle.is_some(),
            cycle_path: cycle,
        })
    }
}
