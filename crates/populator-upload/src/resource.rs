//! FHIR resource files read from extracted packages.
//!
//! Resources come as JSON or XML; the format is sniffed from the first
//! non-whitespace byte. JSON fields are read with `serde_json`; XML fields
//! with XPath over the FHIR convention of `value` attributes, matching on
//! local names so namespaced and plain documents both work.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Priority rank for resource types absent from the fixed table.
pub const DEFAULT_TYPE_RANK: u32 = 50;

/// Errors that can occur when reading a resource file.
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("failed to read resource file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse resource as JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse resource as XML: {0}")]
    Xml(String),

    #[error("resource at {0} does not declare a resourceType")]
    MissingResourceType(PathBuf),
}

/// Serialization format of a resource file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceFormat {
    Json,
    Xml,
}

impl ResourceFormat {
    /// Sniff the format from the raw content.
    #[must_use]
    pub fn sniff(content: &str) -> Self {
        match content.trim_start().chars().next() {
            Some('<') => Self::Xml,
            _ => Self::Json,
        }
    }

    /// The HTTP content type for this format.
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Xml => "application/xml",
        }
    }
}

/// A single FHIR resource file, immutable once read.
#[derive(Debug, Clone)]
pub struct ResourceFile {
    /// Where the file came from.
    pub path: PathBuf,
    /// Bare file name, used for ordering and id generation.
    pub file_name: String,
    /// Serialization format.
    pub format: ResourceFormat,
    /// The FHIR resource type.
    pub resource_type: String,
    /// The id declared in the resource body, if any.
    pub declared_id: Option<String>,
    /// Raw file content.
    pub body: String,
    /// True for a `Bundle` of type `transaction`, which posts to the
    /// endpoint root.
    pub transaction_bundle: bool,
}

impl ResourceFile {
    /// Read a resource from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not parse as a
    /// FHIR resource.
    pub fn from_path(path: &Path) -> Result<Self, ResourceError> {
        let body = fs::read_to_string(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_source(path.to_path_buf(), file_name, body)
    }

    /// Build a resource from in-memory content.
    ///
    /// # Errors
    ///
    /// Returns an error if the content does not parse as a FHIR resource.
    pub fn from_source(
        path: PathBuf,
        file_name: String,
        body: String,
    ) -> Result<Self, ResourceError> {
        let format = ResourceFormat::sniff(&body);
        let resource_type = match format {
            ResourceFormat::Json => json_field(&body, "resourceType")?,
            ResourceFormat::Xml => xml_root_name(&body)?,
        }
        .ok_or_else(|| ResourceError::MissingResourceType(path.clone()))?;

        let declared_id = match format {
            ResourceFormat::Json => json_field(&body, "id")?,
            ResourceFormat::Xml => xml_field(&body, "id")?,
        };

        let transaction_bundle = resource_type == "Bundle" && {
            let bundle_type = match format {
                ResourceFormat::Json => json_field(&body, "type")?,
                ResourceFormat::Xml => xml_field(&body, "type")?,
            };
            bundle_type.as_deref() == Some("transaction")
        };

        Ok(Self {
            path,
            file_name,
            format,
            resource_type,
            declared_id,
            body,
            transaction_bundle,
        })
    }

    /// Priority rank of this resource's type; lower ranks upload first.
    #[must_use]
    pub fn type_rank(&self) -> u32 {
        type_rank(&self.resource_type)
    }

    /// The file name without its last extension.
    #[must_use]
    pub fn file_stem(&self) -> &str {
        Path::new(&self.file_name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&self.file_name)
    }

    /// The body with the declared version and/or id rewritten.
    ///
    /// A `version` rewrites the body's version field when one is declared;
    /// an `id` is written into the body unconditionally for JSON and into an
    /// existing `id` element for XML. `None` for both returns the body
    /// unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the body no longer parses.
    pub fn body_with(
        &self,
        version: Option<&str>,
        id: Option<&str>,
    ) -> Result<String, ResourceError> {
        if version.is_none() && id.is_none() {
            return Ok(self.body.clone());
        }
        match self.format {
            ResourceFormat::Json => rewrite_json(&self.body, version, id),
            ResourceFormat::Xml => rewrite_xml(&self.body, version, id),
        }
    }
}

/// The fixed resource-type priority table.
///
/// Terminology first, then conformance, then instance data; implementation
/// guides last.
#[must_use]
pub fn type_rank(resource_type: &str) -> u32 {
    match resource_type {
        "CodeSystem" => 1,
        "ValueSet" => 2,
        "ConceptMap" => 3,
        "StructureDefinition" => 4,
        "Bundle" => 100,
        "Patient" => 110,
        "Condition" | "Consent" | "DiagnosticReport" | "Immunization"
        | "MedicationStatement" | "Observation" | "Procedure" => 120,
        "ImplementationGuide" => 999,
        _ => DEFAULT_TYPE_RANK,
    }
}

/// Scan an extracted package tree for FHIR resource files.
///
/// Skips `package.json`, `index.json`, dotfiles, FHIR Shorthand (`.sch`)
/// files, anything under an `other/` directory, and anything under
/// `examples/` unless `include_examples` is set. Files that fail to parse
/// are logged and skipped.
#[must_use]
pub fn scan_package(root: &Path, include_examples: bool) -> Vec<ResourceFile> {
    let mut resources = Vec::new();
    scan_dir(root, include_examples, &mut resources);
    resources
}

fn scan_dir(dir: &Path, include_examples: bool, resources: &mut Vec<ResourceFile>) {
    let dir_name = dir.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    // The package spec reserves other/ for non-resource content
    if dir_name == "other" {
        return;
    }
    if dir_name == "examples" && !include_examples {
        tracing::debug!(path = %dir.display(), "skipping examples directory");
        return;
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(path = %dir.display(), error = %e, "failed to read package directory");
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            scan_dir(&path, include_examples, resources);
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        if file_name == "package.json"
            || file_name == "index.json"
            || file_name.starts_with('.')
            || file_name.ends_with(".sch")
        {
            continue;
        }
        match ResourceFile::from_path(&path) {
            Ok(resource) => resources.push(resource),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable resource");
            }
        }
    }
}

fn json_field(body: &str, field: &str) -> Result<Option<String>, ResourceError> {
    let value: serde_json::Value = serde_json::from_str(body)?;
    Ok(value
        .get(field)
        .and_then(serde_json::Value::as_str)
        .map(ToString::to_string))
}

fn rewrite_json(
    body: &str,
    version: Option<&str>,
    id: Option<&str>,
) -> Result<String, ResourceError> {
    let mut value: serde_json::Value = serde_json::from_str(body)?;
    if let Some(object) = value.as_object_mut() {
        if let Some(version) = version {
            if object.contains_key("version") {
                object.insert("version".to_string(), version.into());
            }
        }
        if let Some(id) = id {
            object.insert("id".to_string(), id.into());
        }
    }
    Ok(serde_json::to_string_pretty(&value)?)
}

/// Local name of the XML document element, which names the resource type in
/// FHIR XML.
fn xml_root_name(body: &str) -> Result<Option<String>, ResourceError> {
    let package = sxd_document::parser::parse(body).map_err(|e| ResourceError::Xml(e.to_string()))?;
    let document = package.as_document();
    let name = sxd_xpath::evaluate_xpath(&document, "local-name(/*)")
        .map_err(|e| ResourceError::Xml(e.to_string()))?
        .string();
    Ok(if name.is_empty() { None } else { Some(name) })
}

/// A top-level FHIR XML field: the `value` attribute of the named child.
fn xml_field(body: &str, field: &str) -> Result<Option<String>, ResourceError> {
    let package = sxd_document::parser::parse(body).map_err(|e| ResourceError::Xml(e.to_string()))?;
    let document = package.as_document();
    let expr = format!("string(/*/*[local-name()='{field}']/@value)");
    let value = sxd_xpath::evaluate_xpath(&document, &expr)
        .map_err(|e| ResourceError::Xml(e.to_string()))?
        .string();
    Ok(if value.is_empty() { None } else { Some(value) })
}

fn rewrite_xml(
    body: &str,
    version: Option<&str>,
    id: Option<&str>,
) -> Result<String, ResourceError> {
    use sxd_document::dom::{ChildOfElement, ChildOfRoot};

    let package = sxd_document::parser::parse(body).map_err(|e| ResourceError::Xml(e.to_string()))?;
    let document = package.as_document();

    let root_element = document.root().children().into_iter().find_map(|c| match c {
        ChildOfRoot::Element(e) => Some(e),
        _ => None,
    });
    if let Some(root_element) = root_element {
        for child in root_element.children() {
            let ChildOfElement::Element(element) = child else {
                continue;
            };
            match element.name().local_part() {
                "version" => {
                    if let Some(version) = version {
                        element.set_attribute_value("value", version);
                    }
                }
                "id" => {
                    if let Some(id) = id {
                        element.set_attribute_value("value", id);
                    }
                }
                _ => {}
            }
        }
    }

    let mut out = Vec::new();
    sxd_document::writer::format_document(&document, &mut out)
        .map_err(|e| ResourceError::Xml(e.to_string()))?;
    String::from_utf8(out).map_err(|e| ResourceError::Xml(e.to_string()))
}
