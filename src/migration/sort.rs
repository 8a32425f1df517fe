//! Dependency resolution: reachability queries and a stable topological
//! sort over a migration collection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use itertools::Itertools;
use petgraph::Direction as EdgeDirection;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};

use crate::error::{Error, Result};
use crate::migration::{Migration, MigrationSet};

/// The dependency graph of one migration collection.
///
/// An edge runs from a dependency to its dependent. Edges referencing ids
/// outside the collection are ignored.
pub struct DependencyGraph {
    items: Vec<Arc<Migration>>,
    graph: DiGraph<usize, ()>,
    nodes: Vec<NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph. Every migration in `set` must already be loaded.
    pub fn new(set: &MigrationSet) -> Result<Self> {
        let items: Vec<Arc<Migration>> = set.items().to_vec();
        let index_of: HashMap<&str, usize> = items
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id(), i))
            .collect();

        let mut graph = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..items.len()).map(|i| graph.add_node(i)).collect();
        for (dependent, migration) in items.iter().enumerate() {
            for dep in migration.depends()? {
                if let Some(&dependency) = index_of.get(dep.as_str()) {
                    // update_edge keeps a repeated depends entry from
                    // inflating the in-degree
                    graph.update_edge(nodes[dependency], nodes[dependent], ());
                }
            }
        }

        Ok(DependencyGraph {
            items,
            graph,
            nodes,
        })
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|m| m.id() == id)
    }

    /// Transitive dependencies of `id` within the collection.
    pub fn ancestors(&self, id: &str) -> HashSet<String> {
        self.reachable(id, true)
    }

    /// Migrations that transitively depend on `id` within the collection.
    pub fn descendants(&self, id: &str) -> HashSet<String> {
        self.reachable(id, false)
    }

    fn reachable(&self, id: &str, backwards: bool) -> HashSet<String> {
        let Some(start) = self.index_of(id) else {
            return HashSet::new();
        };
        let mut found = HashSet::new();
        if backwards {
            let reversed = Reversed(&self.graph);
            let mut dfs = Dfs::new(reversed, self.nodes[start]);
            while let Some(node) = dfs.next(reversed) {
                found.insert(self.items[self.graph[node]].id().to_string());
            }
        } else {
            let mut dfs = Dfs::new(&self.graph, self.nodes[start]);
            while let Some(node) = dfs.next(&self.graph) {
                found.insert(self.items[self.graph[node]].id().to_string());
            }
        }
        found.remove(id);
        found
    }

    /// Migrations that nothing else in the collection depends on.
    pub fn heads(&self) -> Vec<Arc<Migration>> {
        self.items
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                self.graph
                    .neighbors_directed(self.nodes[*i], EdgeDirection::Outgoing)
                    .next()
                    .is_none()
            })
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Stable Kahn topological sort.
    ///
    /// Migrations that participate in the dependency graph come first, in
    /// an order where every dependency precedes its dependents and
    /// independent migrations keep their input order; migrations with no
    /// edges follow in their original relative order. Cycles are
    /// *BadMigration*.
    pub fn sorted(&self) -> Result<Vec<Arc<Migration>>> {
        let n = self.items.len();
        let participates: Vec<bool> = (0..n)
            .map(|i| {
                self.graph
                    .neighbors_undirected(self.nodes[i])
                    .next()
                    .is_some()
            })
            .collect();

        let mut remaining_in: Vec<usize> = (0..n)
            .map(|i| {
                self.graph
                    .neighbors_directed(self.nodes[i], EdgeDirection::Incoming)
                    .count()
            })
            .collect();

        // Seed with graph members that have no incoming edges, in input
        // order; always pop from the left to keep the sort stable.
        let mut ready: VecDeque<usize> = (0..n)
            .filter(|&i| participates[i] && remaining_in[i] == 0)
            .collect();

        let mut emitted: Vec<usize> = Vec::new();
        while let Some(current) = ready.pop_front() {
            emitted.push(current);
            // Outgoing targets in input order (edge insertion order).
            let mut targets: Vec<usize> = self
                .graph
                .neighbors_directed(self.nodes[current], EdgeDirection::Outgoing)
                .map(|node| self.graph[node])
                .collect();
            targets.sort_unstable();
            targets.dedup();
            for target in targets {
                remaining_in[target] -= 1;
                if remaining_in[target] == 0 {
                    ready.push_back(target);
                }
            }
        }

        let participant_count = participates.iter().filter(|p| **p).count();
        if emitted.len() != participant_count {
            let emitted_set: HashSet<usize> = emitted.iter().copied().collect();
            let cyclic = (0..n)
                .filter(|&i| participates[i] && !emitted_set.contains(&i))
                .map(|i| self.items[i].id())
                .join(", ");
            return Err(Error::BadMigration(format!(
                "circular dependencies among these migrations: {cyclic}"
            )));
        }

        let mut result: Vec<Arc<Migration>> =
            emitted.iter().map(|&i| self.items[i].clone()).collect();
        result.extend(
            (0..n)
                .filter(|&i| !participates[i])
                .map(|i| self.items[i].clone()),
        );
        Ok(result)
    }
}

/// Toposort `set`, returning the migrations in dependency order.
pub fn topological_sort(set: &MigrationSet) -> Result<Vec<Arc<Migration>>> {
    DependencyGraph::new(set)?.sorted()
}
