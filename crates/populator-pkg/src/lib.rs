//! Package management for the FHIR populator.
//!
//! This crate provides:
//! - Parsing of package specifications (`name` or `name@version`)
//! - Parsing and validation of FHIR npm `package.json` manifests
//! - A registry client for resolving, downloading, and extracting packages
//! - Dependency graph construction with conflict detection
//! - Deterministic topological ordering of packages
//! - Transitive resolution of package dependencies to a fixpoint

mod graph;
mod manifest;
mod registry;
mod resolve;
mod slug;
mod spec;

pub use graph::{DependencyGraph, GraphError};
pub use manifest::{Manifest, ManifestError, MANIFEST_FILE};
pub use registry::{
    FetchDirs, FetchedPackage, RegistryClient, RegistryConfig, RegistryError,
    DEFAULT_REGISTRY_URL,
};
pub use resolve::{PackageSource, ResolveError, ResolvedSet, WalkOptions, Walker};
pub use slug::{slug, MAX_ID_LENGTH};
pub use spec::{PackageSpec, ResolvedSpec, SpecError};
