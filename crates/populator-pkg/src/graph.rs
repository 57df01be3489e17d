//! Dependency graph construction and deterministic topological ordering.
//!
//! Nodes are keyed by package name and carry the resolved version. An edge
//! records that one package depends on another; the scheduler places every
//! dependency strictly before its dependents. All internal collections are
//! ordered so the computed order never depends on insertion order.

use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Errors that can occur during graph construction or ordering.
#[derive(Error, Debug)]
pub enum GraphError {
    /// The same package name was resolved to two different versions.
    #[error(
        "package '{package}' already resolved at version {existing}, \
         requested conflicting version {requested}"
    )]
    VersionConflict {
        package: String,
        existing: String,
        requested: String,
    },

    /// The graph admits no topological order.
    #[error("circular dependency among packages: {}", .participants.join(", "))]
    Cycle { participants: Vec<String> },
}

/// A directed dependency graph over resolved packages.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Package name to resolved version.
    nodes: BTreeMap<String, String>,
    /// Package name to the set of packages it depends on.
    dependencies: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a package at its resolved version.
    ///
    /// Returns `true` if the package was newly inserted, `false` if it was
    /// already present at the same version (a no-op).
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::VersionConflict`] if the package is already
    /// present at a different version.
    pub fn add_package(&mut self, name: &str, version: &str) -> Result<bool, GraphError> {
        match self.nodes.get(name) {
            Some(existing) if existing == version => Ok(false),
            Some(existing) => Err(GraphError::VersionConflict {
                package: name.to_string(),
                existing: existing.clone(),
                requested: version.to_string(),
            }),
            None => {
                self.nodes.insert(name.to_string(), version.to_string());
                Ok(true)
            }
        }
    }

    /// Record that `package` depends on `dependency`.
    ///
    /// Both endpoints may be registered later; edges to names that never
    /// become nodes do not constrain the order.
    pub fn add_dependency(&mut self, package: &str, dependency: &str) {
        self.dependencies
            .entry(package.to_string())
            .or_default()
            .insert(dependency.to_string());
    }

    /// Whether a package is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// The resolved version of a registered package.
    #[must_use]
    pub fn version_of(&self, name: &str) -> Option<&str> {
        self.nodes.get(name).map(String::as_str)
    }

    /// Number of registered packages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no packages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over registered packages and their versions, in name order.
    pub fn packages(&self) -> impl Iterator<Item = (&str, &str)> {
        self.nodes.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Compute a total, deterministic topological order over all packages.
    ///
    /// Kahn's algorithm in rounds: each round removes every package whose
    /// remaining dependencies are all satisfied, in ascending lexicographic
    /// name order. Identical graphs always produce identical orders.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cycle`] if a round removes no package while
    /// packages remain; the residual subgraph contains a cycle.
    pub fn topo_order(&self) -> Result<Vec<String>, GraphError> {
        let mut pending: BTreeSet<&str> = self.nodes.keys().map(String::as_str).collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while !pending.is_empty() {
            // BTreeSet iteration yields the round in lexicographic order
            let ready: Vec<&str> = pending
                .iter()
                .filter(|name| {
                    self.dependencies.get(**name).map_or(true, |deps| {
                        deps.iter().all(|dep| !pending.contains(dep.as_str()))
                    })
                })
                .copied()
                .collect();

            if ready.is_empty() {
                return Err(GraphError::Cycle {
                    participants: self.cycle_participants(&pending),
                });
            }

            for name in ready {
                pending.remove(name);
                order.push(name.to_string());
            }
        }

        Ok(order)
    }

    /// Reduce a stuck residual to the packages actually on a cycle.
    ///
    /// Every residual package has an unsatisfied dependency, but some are
    /// merely dependents downstream of the cycle. Stripping packages that no
    /// other residual package depends on, to a fixpoint, leaves the cycle
    /// members; a cycle always survives because each member is depended on
    /// by another.
    fn cycle_participants(&self, pending: &BTreeSet<&str>) -> Vec<String> {
        let mut residual: BTreeSet<&str> = pending.clone();
        loop {
            let depended_on: BTreeSet<&str> = residual
                .iter()
                .filter_map(|name| self.dependencies.get(*name))
                .flatten()
                .map(String::as_str)
                .filter(|dep| residual.contains(dep))
                .collect();
            let stripped: Vec<&str> = residual
                .iter()
                .filter(|name| !depended_on.contains(*name))
                .copied()
                .collect();
            if stripped.is_empty() {
                break;
            }
            for name in stripped {
                residual.remove(name);
            }
        }
        residual.iter().map(ToString::to_string).collect()
    }
}
