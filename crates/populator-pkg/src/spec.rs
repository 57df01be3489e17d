//! Package specifications as given on the command line or drawn from a
//! manifest's dependency table.

use thiserror::Error;

/// Errors that can occur when parsing a package specification.
#[derive(Error, Debug)]
pub enum SpecError {
    /// Invalid package specification format.
    #[error("invalid package specification '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },
}

/// A reference to a package, optionally pinned to a version.
///
/// A missing version means "resolve to the latest version published on the
/// registry".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageSpec {
    /// Package name as published on the registry.
    pub name: String,
    /// Version specification, if pinned.
    pub version: Option<String>,
}

/// A package reference with its version fixed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedSpec {
    /// Package name as published on the registry.
    pub name: String,
    /// The concrete version to fetch.
    pub version: String,
}

impl PackageSpec {
    /// Parse a package specification.
    ///
    /// Supported formats:
    /// - `de.basisprofil.r4` - latest published version
    /// - `de.basisprofil.r4@1.5.0` - specific version
    ///
    /// # Errors
    ///
    /// Returns an error if the specification format is invalid.
    pub fn parse(spec: &str) -> Result<Self, SpecError> {
        let (name, version) = match spec.split_once('@') {
            Some((name, version)) => {
                if version.is_empty() {
                    return Err(SpecError::InvalidSpec {
                        spec: spec.to_string(),
                        reason: "version after '@' cannot be empty".to_string(),
                    });
                }
                if version.contains('@') {
                    return Err(SpecError::InvalidSpec {
                        spec: spec.to_string(),
                        reason: "at most one '@' is allowed".to_string(),
                    });
                }
                (name, Some(version.to_string()))
            }
            None => (spec, None),
        };

        if name.is_empty() || !is_valid_package_name(name) {
            return Err(SpecError::InvalidSpec {
                spec: spec.to_string(),
                reason: format!("invalid package name '{name}'"),
            });
        }

        Ok(Self {
            name: name.to_string(),
            version,
        })
    }

    /// Create a specification pinned to a concrete version.
    #[must_use]
    pub fn pinned(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(version.into()),
        }
    }

    /// Returns true if this specification carries a version.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.version.is_some()
    }
}

impl std::fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(ref v) = self.version {
            write!(f, "@{v}")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ResolvedSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Check if a string is a valid FHIR npm package name.
///
/// Names are dot-separated lowercase segments, e.g. `de.medizininformatikinitiative.kerndatensatz.person`.
fn is_valid_package_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 214 {
        return false;
    }
    // Dots separate segments; a name cannot start or end with one
    if name.starts_with('.') || name.ends_with('.') {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}
