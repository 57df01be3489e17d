//! Transitive package resolution.
//!
//! Drives resolution with an explicit worklist of package specifications and
//! a visited set keyed by name, drained to a fixpoint. No recursion, and the
//! fetch order does not depend on manifest traversal order beyond the queue
//! discipline itself.

use crate::{
    DependencyGraph, FetchDirs, FetchedPackage, GraphError, PackageSpec, RegistryClient,
    RegistryError, ResolvedSpec,
};
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;

/// Where packages come from: version resolution and tarball fetch.
///
/// The registry client is the production source; the seam keeps the walker
/// testable without a network.
pub trait PackageSource {
    /// Resolve a specification to a concrete version.
    ///
    /// # Errors
    ///
    /// Returns an error if the package is unknown or the source is
    /// unreachable.
    fn resolve(&self, spec: &PackageSpec) -> Result<ResolvedSpec, RegistryError>;

    /// Download and extract a resolved package.
    ///
    /// # Errors
    ///
    /// Returns an error if the package content cannot be obtained.
    fn fetch(&self, resolved: &ResolvedSpec, dirs: &FetchDirs)
        -> Result<FetchedPackage, RegistryError>;
}

impl PackageSource for RegistryClient {
    fn resolve(&self, spec: &PackageSpec) -> Result<ResolvedSpec, RegistryError> {
        RegistryClient::resolve(self, spec)
    }

    fn fetch(
        &self,
        resolved: &ResolvedSpec,
        dirs: &FetchDirs,
    ) -> Result<FetchedPackage, RegistryError> {
        RegistryClient::fetch(self, resolved, dirs)
    }
}

/// Errors that can occur while resolving a package set.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// A registry call failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Graph construction failed (version conflict).
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Options controlling a resolution walk.
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Whether to fetch declared dependencies transitively.
    pub transitive: bool,
    /// Dependency name prefixes that are never fetched.
    ///
    /// The FHIR core packages are preloaded on any useful server.
    pub ignored_prefixes: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            transitive: false,
            ignored_prefixes: vec!["hl7.fhir.r4".to_string()],
        }
    }
}

impl WalkOptions {
    /// Enable or disable transitive resolution.
    #[must_use]
    pub fn with_transitive(mut self, transitive: bool) -> Self {
        self.transitive = transitive;
        self
    }

    fn is_ignored(&self, name: &str) -> bool {
        self.ignored_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }
}

/// The frozen result of a resolution walk.
#[derive(Debug)]
pub struct ResolvedSet {
    /// The dependency graph over all fetched packages.
    pub graph: DependencyGraph,
    /// Fetched packages by name.
    pub packages: BTreeMap<String, FetchedPackage>,
}

/// Resolves and fetches a set of packages to a fixpoint.
pub struct Walker<'a, S: PackageSource> {
    registry: &'a S,
    options: WalkOptions,
}

impl<'a, S: PackageSource> Walker<'a, S> {
    /// Create a walker over the given package source.
    #[must_use]
    pub fn new(registry: &'a S, options: WalkOptions) -> Self {
        Self { registry, options }
    }

    /// Resolve and fetch `roots` and, when transitive resolution is enabled,
    /// every reachable dependency.
    ///
    /// # Errors
    ///
    /// Fails fast on registry errors and on a package name resolving to two
    /// different versions within the run.
    pub fn walk(&self, roots: &[PackageSpec], dirs: &FetchDirs) -> Result<ResolvedSet, ResolveError> {
        let mut graph = DependencyGraph::new();
        let mut packages = BTreeMap::new();
        let mut worklist: VecDeque<PackageSpec> = roots.iter().cloned().collect();

        while let Some(spec) = worklist.pop_front() {
            let resolved = self.registry.resolve(&spec)?;

            // Conflict check and dedup in one step: a second resolution of
            // the same name at the same version is a no-op, a different
            // version is fatal.
            if !graph.add_package(&resolved.name, &resolved.version)? {
                tracing::debug!(package = %resolved, "already fetched");
                continue;
            }

            tracing::info!(package = %resolved, "fetching package");
            let fetched = self.registry.fetch(&resolved, dirs)?;

            if self.options.transitive {
                for dep in fetched.manifest.dependency_specs() {
                    if self.options.is_ignored(&dep.name) {
                        tracing::debug!(dependency = %dep, "dependency ignored");
                        continue;
                    }
                    graph.add_dependency(&resolved.name, &dep.name);
                    worklist.push_back(dep);
                }
            } else {
                for (dep, dep_version) in &fetched.manifest.dependencies {
                    tracing::warn!(
                        package = %resolved.name,
                        dependency = %dep,
                        version = %dep_version,
                        "package declares a dependency that will not be fetched"
                    );
                }
            }

            packages.insert(resolved.name.clone(), fetched);
        }

        Ok(ResolvedSet { graph, packages })
    }
}
