//! Building the ordered upload plan.
//!
//! Packages arrive in scheduler order; within each package, resources are
//! partitioned into priority buckets by the fixed resource-type table and
//! concatenated bucket-by-bucket, stable by file name within a bucket.
//! Package rank strictly dominates type rank. Identifier assignment happens
//! here, after type filtering, so excluded types never get id side effects.

use crate::resource::ResourceFile;
use populator_pkg::{slug, MAX_ID_LENGTH};
use std::collections::BTreeSet;

/// Separator between a versioned-id prefix and the base id.
const VERSIONED_ID_SEPARATOR: &str = "--";

/// HTTP method used to transmit a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Put,
    Post,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Put => write!(f, "PUT"),
            Self::Post => write!(f, "POST"),
        }
    }
}

/// Resource-type inclusion filter, case-insensitive.
///
/// Allow-list and deny-list are mutually exclusive by construction.
#[derive(Debug, Clone, Default)]
pub enum TypeFilter {
    /// Upload every resource type.
    #[default]
    All,
    /// Upload only the listed types.
    Only(BTreeSet<String>),
    /// Upload everything except the listed types.
    Exclude(BTreeSet<String>),
}

impl TypeFilter {
    /// Build an allow-list filter.
    #[must_use]
    pub fn only<I: IntoIterator<Item = String>>(types: I) -> Self {
        Self::Only(lowered(types))
    }

    /// Build a deny-list filter.
    #[must_use]
    pub fn exclude<I: IntoIterator<Item = String>>(types: I) -> Self {
        Self::Exclude(lowered(types))
    }

    /// Whether a resource type passes the filter.
    #[must_use]
    pub fn allows(&self, resource_type: &str) -> bool {
        let lower = resource_type.to_ascii_lowercase();
        match self {
            Self::All => true,
            Self::Only(types) => types.contains(&lower),
            Self::Exclude(types) => !types.contains(&lower),
        }
    }
}

fn lowered<I: IntoIterator<Item = String>>(types: I) -> BTreeSet<String> {
    types.into_iter().map(|t| t.to_ascii_lowercase()).collect()
}

/// Policies applied while building the plan.
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Resource-type filter applied before id assignment.
    pub filter: TypeFilter,
    /// Derive an id from the file name when none is declared.
    pub generate_ids: bool,
    /// Prefix every id with the slugged package name and version.
    pub versioned_ids: bool,
    /// Rewrite each resource's declared version to the package version.
    pub rewrite_versions: bool,
}

/// A package's resources, paired with its identity, in scheduler order.
#[derive(Debug)]
pub struct PackageResources {
    /// Package name.
    pub name: String,
    /// Resolved package version.
    pub version: String,
    /// Resources scanned from the package content.
    pub resources: Vec<ResourceFile>,
}

/// A single queued upload, consumed exactly once and never mutated.
#[derive(Debug, Clone)]
pub struct UploadUnit {
    /// The resource file this unit transmits.
    pub resource: ResourceFile,
    /// The body to ship; may differ from the file after rewrites.
    pub body: String,
    /// Assigned id, if any; `None` means the server assigns one.
    pub id: Option<String>,
    /// HTTP method.
    pub method: Method,
    /// Name of the owning package.
    pub package_name: String,
    /// Position of the owning package in scheduler order.
    pub package_rank: usize,
    /// Resource-type priority rank.
    pub type_rank: u32,
}

impl UploadUnit {
    /// Short human-readable description for logs and error reports.
    #[must_use]
    pub fn describe(&self) -> String {
        match self.id {
            Some(ref id) => format!(
                "{} ({}/{})",
                self.resource.file_name, self.resource.resource_type, id
            ),
            None => format!("{} ({})", self.resource.file_name, self.resource.resource_type),
        }
    }
}

/// Assign the final id and method for a resource under the active policies.
///
/// Declared ids pass through unchanged unless versioned ids are on; generated
/// ids are derived from the file stem and stable across runs. The versioned
/// prefix is `slug("{name}-{version}")` joined with the separator, and the
/// whole id is truncated to the FHIR limit.
fn assign_id(
    resource: &ResourceFile,
    package_name: &str,
    package_version: &str,
    options: &PlanOptions,
) -> (Option<String>, Method) {
    let base_id = match resource.declared_id {
        Some(ref declared) => Some(declared.clone()),
        None if options.generate_ids => Some(slug(resource.file_stem())),
        None => None,
    };

    match base_id {
        None => (None, Method::Post),
        Some(base) => {
            let mut id = if options.versioned_ids {
                let prefix = slug(&format!("{package_name}-{package_version}"));
                format!("{prefix}{VERSIONED_ID_SEPARATOR}{base}")
            } else {
                base
            };
            if id.len() > MAX_ID_LENGTH {
                // declared ids may carry multibyte characters
                let mut cut = MAX_ID_LENGTH;
                while !id.is_char_boundary(cut) {
                    cut -= 1;
                }
                id.truncate(cut);
            }
            (Some(id), Method::Put)
        }
    }
}

/// Build the global upload sequence from packages in scheduler order.
///
/// Resources that fail the type filter are dropped before id assignment;
/// resources whose bodies fail to rewrite are logged and skipped.
#[must_use]
pub fn build_plan(packages: Vec<PackageResources>, options: &PlanOptions) -> Vec<UploadUnit> {
    let mut units = Vec::new();

    for (package_rank, package) in packages.into_iter().enumerate() {
        let mut resources: Vec<ResourceFile> = package
            .resources
            .into_iter()
            .filter(|r| {
                let allowed = options.filter.allows(&r.resource_type);
                if !allowed {
                    tracing::debug!(
                        file = %r.file_name,
                        resource_type = %r.resource_type,
                        "resource type filtered out"
                    );
                }
                allowed
            })
            .collect();

        // Bucket partition and intra-bucket stability in one key
        resources.sort_by(|a, b| {
            (a.type_rank(), a.file_name.as_str()).cmp(&(b.type_rank(), b.file_name.as_str()))
        });

        for resource in resources {
            let (id, method) = assign_id(&resource, &package.name, &package.version, options);

            let rewrite_version = options.rewrite_versions.then_some(package.version.as_str());
            let rewrite_id = match (&id, &resource.declared_id) {
                (Some(assigned), Some(declared)) if assigned == declared => None,
                (Some(assigned), _) => Some(assigned.as_str()),
                (None, _) => None,
            };

            let body = match resource.body_with(rewrite_version, rewrite_id) {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!(
                        file = %resource.file_name,
                        error = %e,
                        "failed to prepare resource body, skipping"
                    );
                    continue;
                }
            };

            let type_rank = resource.type_rank();
            units.push(UploadUnit {
                body,
                id,
                method,
                package_name: package.name.clone(),
                package_rank,
                type_rank,
                resource,
            });
        }
    }

    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn resource(file_name: &str, body: &str) -> ResourceFile {
        ResourceFile::from_source(PathBuf::from(file_name), file_name.to_string(), body.to_string())
            .unwrap()
    }

    fn one_package(resources: Vec<ResourceFile>) -> Vec<PackageResources> {
        vec![PackageResources {
            name: "pkg".to_string(),
            version: "1.0.3".to_string(),
            resources,
        }]
    }

    #[test]
    fn test_type_priority_within_package() {
        let units = build_plan(
            one_package(vec![
                resource("Patient.json", r#"{"resourceType": "Patient"}"#),
                resource("vs.json", r#"{"resourceType": "ValueSet"}"#),
                resource("cs.json", r#"{"resourceType": "CodeSystem"}"#),
            ]),
            &PlanOptions::default(),
        );
        let names: Vec<_> = units.iter().map(|u| u.resource.file_name.as_str()).collect();
        assert_eq!(names, vec!["cs.json", "vs.json", "Patient.json"]);
    }

    #[test]
    fn test_stable_by_file_name_within_bucket() {
        let units = build_plan(
            one_package(vec![
                resource("b.json", r#"{"resourceType": "CodeSystem"}"#),
                resource("a.json", r#"{"resourceType": "CodeSystem"}"#),
            ]),
            &PlanOptions::default(),
        );
        let names: Vec<_> = units.iter().map(|u| u.resource.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.json", "b.json"]);
    }

    #[test]
    fn test_package_rank_dominates_type_rank() {
        let packages = vec![
            PackageResources {
                name: "base".to_string(),
                version: "1.0.0".to_string(),
                resources: vec![resource("patient.json", r#"{"resourceType": "Patient"}"#)],
            },
            PackageResources {
                name: "app".to_string(),
                version: "1.0.0".to_string(),
                resources: vec![resource("cs.json", r#"{"resourceType": "CodeSystem"}"#)],
            },
        ];
        let units = build_plan(packages, &PlanOptions::default());
        // base's Patient ships before app's CodeSystem despite the type ranks
        assert_eq!(units[0].package_name, "base");
        assert_eq!(units[1].package_name, "app");
        assert_eq!(units[0].package_rank, 0);
        assert_eq!(units[1].package_rank, 1);
    }

    #[test]
    fn test_declared_id_put() {
        let units = build_plan(
            one_package(vec![resource(
                "cs.json",
                r#"{"resourceType": "CodeSystem", "id": "example"}"#,
            )]),
            &PlanOptions::default(),
        );
        assert_eq!(units[0].id.as_deref(), Some("example"));
        assert_eq!(units[0].method, Method::Put);
    }

    #[test]
    fn test_no_id_post() {
        let units = build_plan(
            one_package(vec![resource("cs.json", r#"{"resourceType": "CodeSystem"}"#)]),
            &PlanOptions::default(),
        );
        assert_eq!(units[0].id, None);
        assert_eq!(units[0].method, Method::Post);
    }

    #[test]
    fn test_generated_id_from_file_stem() {
        let options = PlanOptions {
            generate_ids: true,
            ..PlanOptions::default()
        };
        let units = build_plan(
            one_package(vec![resource(
                "My CodeSystem v2.json",
                r#"{"resourceType": "CodeSystem"}"#,
            )]),
            &options,
        );
        assert_eq!(units[0].id.as_deref(), Some("my-codesystem-v2"));
        assert_eq!(units[0].method, Method::Put);

        // stable across plan rebuilds
        let again = build_plan(
            one_package(vec![resource(
                "My CodeSystem v2.json",
                r#"{"resourceType": "CodeSystem"}"#,
            )]),
            &options,
        );
        assert_eq!(again[0].id, units[0].id);
    }

    #[test]
    fn test_versioned_id_composition() {
        let options = PlanOptions {
            versioned_ids: true,
            ..PlanOptions::default()
        };
        let units = build_plan(
            one_package(vec![resource(
                "cs.json",
                r#"{"resourceType": "CodeSystem", "id": "example"}"#,
            )]),
            &options,
        );
        assert_eq!(units[0].id.as_deref(), Some("pkg-1-0-3--example"));
        assert_eq!(units[0].method, Method::Put);
    }

    #[test]
    fn test_versioned_id_truncated() {
        let options = PlanOptions {
            versioned_ids: true,
            ..PlanOptions::default()
        };
        let long_id = "x".repeat(80);
        let units = build_plan(
            one_package(vec![resource(
                "cs.json",
                &format!(r#"{{"resourceType": "CodeSystem", "id": "{long_id}"}}"#),
            )]),
            &options,
        );
        assert_eq!(units[0].id.as_ref().unwrap().len(), 64);
    }

    #[test]
    fn test_long_multibyte_id_truncated_on_char_boundary() {
        // 90 bytes of three-byte characters: byte 64 is mid-character
        let long_id = "€".repeat(30);
        let units = build_plan(
            one_package(vec![resource(
                "cs.json",
                &format!(r#"{{"resourceType": "CodeSystem", "id": "{long_id}"}}"#),
            )]),
            &PlanOptions::default(),
        );
        let id = units[0].id.as_ref().unwrap();
        assert!(id.len() <= MAX_ID_LENGTH);
        assert_eq!(id.chars().count(), 21);
    }

    #[test]
    fn test_assigned_id_written_into_body() {
        let options = PlanOptions {
            generate_ids: true,
            ..PlanOptions::default()
        };
        let units = build_plan(
            one_package(vec![resource("cs.json", r#"{"resourceType": "CodeSystem"}"#)]),
            &options,
        );
        let value: serde_json::Value = serde_json::from_str(&units[0].body).unwrap();
        assert_eq!(value["id"], "cs");
    }

    #[test]
    fn test_declared_id_body_untouched() {
        let units = build_plan(
            one_package(vec![resource(
                "cs.json",
                r#"{"resourceType": "CodeSystem", "id": "example"}"#,
            )]),
            &PlanOptions::default(),
        );
        assert_eq!(units[0].body, units[0].resource.body);
    }

    #[test]
    fn test_rewrite_versions() {
        let options = PlanOptions {
            rewrite_versions: true,
            ..PlanOptions::default()
        };
        let units = build_plan(
            one_package(vec![resource(
                "cs.json",
                r#"{"resourceType": "CodeSystem", "version": "0.0.1"}"#,
            )]),
            &options,
        );
        let value: serde_json::Value = serde_json::from_str(&units[0].body).unwrap();
        assert_eq!(value["version"], "1.0.3");
    }

    #[test]
    fn test_filter_exclude() {
        let options = PlanOptions {
            filter: TypeFilter::exclude(vec!["codesystem".to_string()]),
            ..PlanOptions::default()
        };
        let units = build_plan(
            one_package(vec![
                resource("cs.json", r#"{"resourceType": "CodeSystem"}"#),
                resource("vs.json", r#"{"resourceType": "ValueSet"}"#),
            ]),
            &options,
        );
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].resource.resource_type, "ValueSet");
    }

    #[test]
    fn test_filter_only_case_insensitive() {
        let options = PlanOptions {
            filter: TypeFilter::only(vec!["CodeSystem".to_string()]),
            ..PlanOptions::default()
        };
        let units = build_plan(
            one_package(vec![
                resource("cs.json", r#"{"resourceType": "CodeSystem"}"#),
                resource("vs.json", r#"{"resourceType": "ValueSet"}"#),
            ]),
            &options,
        );
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].resource.resource_type, "CodeSystem");
    }
}
