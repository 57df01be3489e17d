//! HTTP client for a FHIR npm package registry.
//!
//! This module provides functionality to:
//! - Resolve a package name to its latest published version
//! - Download package tarballs and extract them with sanitized file names
//! - Record a SHA-256 checksum for every downloaded archive
//! - Locate and parse the manifest within an extracted package

use crate::{slug, Manifest, ManifestError, ResolvedSpec};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// The default registry, Simplifier.
pub const DEFAULT_REGISTRY_URL: &str = "https://packages.simplifier.net";

/// Errors that can occur during registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Package name unknown to the registry.
    #[error("package '{package}' not found on the registry")]
    PackageNotFound { package: String },

    /// Package exists but the requested version does not.
    #[error("version '{version}' of package '{package}' not found on the registry")]
    VersionNotFound { package: String, version: String },

    /// Package metadata carries no published versions.
    #[error("package '{package}' has no published versions")]
    NoVersions { package: String },

    /// Registry metadata could not be interpreted.
    #[error("malformed registry metadata for '{package}': {reason}")]
    Metadata { package: String, reason: String },

    /// Network error during a registry call.
    #[error("network error: {0}")]
    Network(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The downloaded archive could not be extracted.
    #[error("invalid package archive for '{package}': {reason}")]
    InvalidArchive { package: String, reason: String },

    /// The extracted package carries no usable manifest.
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
}

/// Configuration for the registry client.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Base URL of the registry, without a trailing slash.
    pub base_url: String,
    /// Authorization header value passed through verbatim, if any.
    pub auth_header: Option<String>,
    /// User agent for HTTP requests.
    pub user_agent: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_REGISTRY_URL.to_string(),
            auth_header: None,
            user_agent: format!("fhir-populator/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl RegistryConfig {
    /// Create a configuration for a custom registry URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Attach an authorization header to every registry request.
    #[must_use]
    pub fn with_auth_header(mut self, header: Option<String>) -> Self {
        self.auth_header = header;
        self
    }
}

/// Directories a fetch writes into, owned by the run context.
#[derive(Debug, Clone)]
pub struct FetchDirs {
    /// Where downloaded tarballs are stored.
    pub download: PathBuf,
    /// Where packages are extracted.
    pub extract: PathBuf,
}

/// A successfully fetched and extracted package.
#[derive(Debug, Clone)]
pub struct FetchedPackage {
    /// Package name, per the resolved specification.
    pub name: String,
    /// The concrete version that was fetched.
    pub version: String,
    /// SHA-256 checksum of the downloaded tarball.
    pub checksum: String,
    /// Root directory of the extracted content.
    pub root: PathBuf,
    /// The parsed package manifest.
    pub manifest: Manifest,
}

/// Registry metadata returned by `GET {registry}/{name}`.
#[derive(Debug, Deserialize)]
struct PackageMetadata {
    #[serde(default, rename = "dist-tags")]
    dist_tags: BTreeMap<String, String>,
    #[serde(default)]
    versions: BTreeMap<String, serde_json::Value>,
}

/// Client for a FHIR npm package registry.
pub struct RegistryClient {
    config: RegistryConfig,
    http_client: reqwest::blocking::Client,
}

impl RegistryClient {
    /// Create a client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new() -> Result<Self, RegistryError> {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a client with custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_config(config: RegistryConfig) -> Result<Self, RegistryError> {
        let http_client = reqwest::blocking::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| RegistryError::Network(e.to_string()))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// The registry base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn build_request(&self, url: &str) -> reqwest::blocking::RequestBuilder {
        let mut req = self.http_client.get(url);
        if let Some(ref header) = self.config.auth_header {
            req = req.header("Authorization", header);
        }
        req
    }

    /// Resolve a package specification to a concrete version.
    ///
    /// A pinned version passes through untouched; existence is proven by the
    /// subsequent fetch. An unpinned name queries the registry for the latest
    /// published version.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is unknown to the registry or the
    /// registry is unreachable.
    pub fn resolve(&self, spec: &crate::PackageSpec) -> Result<ResolvedSpec, RegistryError> {
        let version = match spec.version {
            Some(ref version) => version.clone(),
            None => self.resolve_latest(&spec.name)?,
        };
        Ok(ResolvedSpec {
            name: spec.name.clone(),
            version,
        })
    }

    /// Query the registry for the latest published version of a package.
    ///
    /// # Errors
    ///
    /// Returns an error if the package is unknown or metadata is malformed.
    pub fn resolve_latest(&self, name: &str) -> Result<String, RegistryError> {
        let url = format!("{}/{name}", self.config.base_url);
        let response = self
            .build_request(&url)
            .send()
            .map_err(|e| RegistryError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryError::PackageNotFound {
                package: name.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(RegistryError::Network(format!(
                "registry returned status {} for '{name}'",
                response.status()
            )));
        }

        let metadata: PackageMetadata = response.json().map_err(|e| RegistryError::Metadata {
            package: name.to_string(),
            reason: e.to_string(),
        })?;

        let latest = metadata
            .dist_tags
            .get("latest")
            .cloned()
            .or_else(|| metadata.versions.keys().next_back().cloned())
            .ok_or_else(|| RegistryError::NoVersions {
                package: name.to_string(),
            })?;

        tracing::debug!(package = name, version = %latest, "resolved latest version");
        Ok(latest)
    }

    /// Download and extract a package.
    ///
    /// The tarball lands at `{download}/{name}_{version}.tar` and the content
    /// at `{extract}/{name}_{version}/`. Member file stems are slugged during
    /// extraction so generated resource ids stay stable across runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the download fails, the archive is unusable, or
    /// the extracted tree carries no single manifest.
    pub fn fetch(
        &self,
        resolved: &ResolvedSpec,
        dirs: &FetchDirs,
    ) -> Result<FetchedPackage, RegistryError> {
        let url = format!("{}/{}/{}", self.config.base_url, resolved.name, resolved.version);
        let response = self
            .build_request(&url)
            .send()
            .map_err(|e| RegistryError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryError::VersionNotFound {
                package: resolved.name.clone(),
                version: resolved.version.clone(),
            });
        }
        if !response.status().is_success() {
            return Err(RegistryError::Network(format!(
                "download of '{resolved}' failed with status {}",
                response.status()
            )));
        }

        let data = response
            .bytes()
            .map(|b| b.to_vec())
            .map_err(|e| RegistryError::Network(e.to_string()))?;
        let checksum = calculate_checksum(&data);

        let stem = format!("{}_{}", resolved.name, resolved.version);
        let tarball_path = dirs.download.join(format!("{stem}.tar"));
        fs::write(&tarball_path, &data)?;
        tracing::debug!(path = %tarball_path.display(), checksum, "downloaded package tarball");

        let extract_path = dirs.extract.join(&stem);
        extract_archive(&tarball_path, &extract_path).map_err(|e| match e {
            RegistryError::Io(io) => RegistryError::InvalidArchive {
                package: resolved.name.clone(),
                reason: io.to_string(),
            },
            other => other,
        })?;
        tracing::debug!(path = %extract_path.display(), "extracted package");

        let manifest_path = Manifest::find_in_tree(&extract_path)?;
        let manifest = Manifest::from_path(&manifest_path)?;

        Ok(FetchedPackage {
            name: resolved.name.clone(),
            version: resolved.version.clone(),
            checksum,
            root: extract_path,
            manifest,
        })
    }
}

/// Calculate the SHA-256 checksum of data.
fn calculate_checksum(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Extract a gzipped tarball, sanitizing member file stems.
///
/// Directory structure is preserved; each member file name is rewritten to
/// `slug(stem) + extension`. Members that fail to extract are logged and
/// skipped so one bad entry does not lose a whole package.
pub(crate) fn extract_archive(tarball_path: &Path, dest_dir: &Path) -> Result<(), RegistryError> {
    use flate2::read::GzDecoder;

    if dest_dir.exists() {
        fs::remove_dir_all(dest_dir)?;
    }
    fs::create_dir_all(dest_dir)?;

    let file = File::open(tarball_path)?;
    let decoder = GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable archive member");
                continue;
            }
        };
        if entry.header().entry_type().is_dir() {
            continue;
        }
        let path = match entry.path() {
            Ok(path) => path.into_owned(),
            Err(e) => {
                tracing::warn!(error = %e, "skipping archive member with invalid path");
                continue;
            }
        };

        // Drop anything that is not a plain path component
        let components: Vec<_> = path
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(PathBuf::from(part)),
                _ => None,
            })
            .collect();
        let Some((file_part, dir_parts)) = components.split_last() else {
            continue;
        };

        let mut dest = dest_dir.to_path_buf();
        for part in dir_parts {
            dest.push(part);
        }
        fs::create_dir_all(&dest)?;
        dest.push(sanitize_file_name(file_part));

        match File::create(&dest).and_then(|mut out| io::copy(&mut entry, &mut out)) {
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(path = %dest.display(), error = %e, "failed to extract archive member");
            }
        }
    }

    Ok(())
}

/// Rewrite a file name to `slug(stem) + extension`.
fn sanitize_file_name(name: &Path) -> String {
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.extension() {
        Some(ext) => format!("{}.{}", slug(&stem), ext.to_string_lossy()),
        None => slug(&stem),
    }
}
