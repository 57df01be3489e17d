//! FHIR npm package manifest (`package.json`) parsing.

use crate::PackageSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The manifest filename within a package.
pub const MANIFEST_FILE: &str = "package.json";

/// Errors that can occur when working with manifests.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("no {MANIFEST_FILE} found under {0}")]
    NotFound(PathBuf),

    #[error("expected exactly one {MANIFEST_FILE} under {path}, found {found}")]
    Ambiguous { path: PathBuf, found: usize },
}

/// A FHIR npm package manifest.
///
/// Only the fields the populator consumes are modeled; registries attach
/// plenty of additional metadata which is tolerated and ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Package name (required).
    pub name: String,

    /// Package version (required).
    pub version: String,

    /// Short description.
    #[serde(default)]
    pub description: Option<String>,

    /// FHIR versions the package content conforms to.
    #[serde(default, rename = "fhirVersions")]
    pub fhir_versions: Vec<String>,

    /// Canonical URL of the package.
    #[serde(default)]
    pub canonical: Option<String>,

    /// Declared dependencies: package name to version constraint.
    ///
    /// FHIR npm constraints are exact versions in practice.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

impl Manifest {
    /// Parse a manifest from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or a required field is
    /// missing or empty.
    pub fn from_str(content: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_str(content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load a manifest from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self, ManifestError> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Locate the manifest within an extracted package tree.
    ///
    /// FHIR npm tarballs place it at `package/package.json`, but nesting
    /// varies; the tree must contain exactly one.
    ///
    /// # Errors
    ///
    /// Returns an error if no manifest or more than one is found.
    pub fn find_in_tree(root: &Path) -> Result<PathBuf, ManifestError> {
        let mut found = Vec::new();
        collect_manifests(root, &mut found)?;
        match found.len() {
            0 => Err(ManifestError::NotFound(root.to_path_buf())),
            1 => Ok(found.remove(0)),
            n => Err(ManifestError::Ambiguous {
                path: root.to_path_buf(),
                found: n,
            }),
        }
    }

    /// The declared dependencies as pinned package specifications.
    pub fn dependency_specs(&self) -> impl Iterator<Item = PackageSpec> + '_ {
        self.dependencies
            .iter()
            .map(|(name, version)| PackageSpec::pinned(name.clone(), version.clone()))
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if self.name.is_empty() {
            return Err(ManifestError::MissingField("name"));
        }
        if self.version.is_empty() {
            return Err(ManifestError::MissingField("version"));
        }
        Ok(())
    }
}

fn collect_manifests(dir: &Path, found: &mut Vec<PathBuf>) -> Result<(), ManifestError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_manifests(&path, found)?;
        } else if entry.file_name() == MANIFEST_FILE {
            found.push(path);
        }
    }
    Ok(())
}
