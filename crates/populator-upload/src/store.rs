//! Transmission of upload units to a FHIR server.

use crate::plan::{Method, UploadUnit};

/// A declined or failed transmission.
///
/// Transport errors and timeouts carry no status and are handled exactly
/// like HTTP rejections.
#[derive(Debug, Clone)]
pub struct Rejection {
    /// HTTP status, if the server answered at all.
    pub status: Option<u16>,
    /// The server's message, or the transport error.
    pub message: String,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "status {status}: {}", self.message),
            None => write!(f, "transport error: {}", self.message),
        }
    }
}

/// Remote store collaborator: one transmission per upload unit.
pub trait FhirStore {
    /// Transmit a unit, returning the accepted HTTP status.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] for non-2xx responses and transport failures.
    fn transmit(&mut self, unit: &UploadUnit) -> Result<u16, Rejection>;
}

/// HTTP implementation against a FHIR REST endpoint.
pub struct HttpStore {
    endpoint: String,
    auth_header: Option<String>,
    http_client: reqwest::blocking::Client,
}

impl HttpStore {
    /// Create a store client for an endpoint.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] if the HTTP client cannot be created.
    pub fn new(endpoint: &str, auth_header: Option<String>) -> Result<Self, Rejection> {
        let http_client = reqwest::blocking::Client::builder()
            .build()
            .map_err(|e| Rejection {
                status: None,
                message: e.to_string(),
            })?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            auth_header,
            http_client,
        })
    }

    /// The upload URL for a unit.
    ///
    /// `PUT {endpoint}/{type}/{id}`, `POST {endpoint}/{type}`, and the
    /// endpoint root for transaction bundles.
    #[must_use]
    pub fn url_for(&self, unit: &UploadUnit) -> String {
        if unit.resource.transaction_bundle {
            return self.endpoint.clone();
        }
        match unit.id {
            Some(ref id) => format!("{}/{}/{id}", self.endpoint, unit.resource.resource_type),
            None => format!("{}/{}", self.endpoint, unit.resource.resource_type),
        }
    }
}

impl FhirStore for HttpStore {
    fn transmit(&mut self, unit: &UploadUnit) -> Result<u16, Rejection> {
        let url = self.url_for(unit);
        // A transaction bundle always posts to the endpoint root
        let method = if unit.resource.transaction_bundle {
            Method::Post
        } else {
            unit.method
        };
        let mut request = match method {
            Method::Put => self.http_client.put(&url),
            Method::Post => self.http_client.post(&url),
        };
        request = request
            .header("Content-Type", unit.resource.format.content_type())
            .header("Accept", "application/json");
        if let Some(ref header) = self.auth_header {
            request = request.header("Authorization", header);
        }

        tracing::debug!(%url, %method, content_type = unit.resource.format.content_type(), "transmitting");
        let response = request
            .body(unit.body.clone())
            .send()
            .map_err(|e| Rejection {
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(status.as_u16());
        }

        let body = response.text().unwrap_or_default();
        Err(Rejection {
            status: Some(status.as_u16()),
            message: outcome_issues(&body).unwrap_or(body),
        })
    }
}

/// Extract the issues from an OperationOutcome response body, if it is one.
fn outcome_issues(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let issues = value.get("issue")?;
    serde_json::to_string(issues).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceFile;
    use std::path::PathBuf;

    fn unit(body: &str, id: Option<&str>, method: Method) -> UploadUnit {
        let resource = ResourceFile::from_source(
            PathBuf::from("r.json"),
            "r.json".to_string(),
            body.to_string(),
        )
        .unwrap();
        UploadUnit {
            body: resource.body.clone(),
            id: id.map(ToString::to_string),
            method,
            package_name: "pkg".to_string(),
            package_rank: 0,
            type_rank: resource.type_rank(),
            resource,
        }
    }

    #[test]
    fn test_url_for_put_with_id() {
        let store = HttpStore::new("http://fhir.example/r4/", None).unwrap();
        let unit = unit(
            r#"{"resourceType": "CodeSystem", "id": "example"}"#,
            Some("example"),
            Method::Put,
        );
        assert_eq!(store.url_for(&unit), "http://fhir.example/r4/CodeSystem/example");
    }

    #[test]
    fn test_url_for_post_without_id() {
        let store = HttpStore::new("http://fhir.example/r4", None).unwrap();
        let unit = unit(r#"{"resourceType": "Patient"}"#, None, Method::Post);
        assert_eq!(store.url_for(&unit), "http://fhir.example/r4/Patient");
    }

    #[test]
    fn test_url_for_transaction_bundle() {
        let store = HttpStore::new("http://fhir.example/r4", None).unwrap();
        let unit = unit(
            r#"{"resourceType": "Bundle", "type": "transaction"}"#,
            None,
            Method::Post,
        );
        assert_eq!(store.url_for(&unit), "http://fhir.example/r4");
    }

    #[test]
    fn test_outcome_issues_extracted() {
        let body = r#"{"resourceType": "OperationOutcome", "issue": [{"severity": "error", "diagnostics": "bad reference"}]}"#;
        let issues = outcome_issues(body).unwrap();
        assert!(issues.contains("bad reference"));
    }

    #[test]
    fn test_outcome_issues_not_json() {
        assert!(outcome_issues("<html>oops</html>").is_none());
    }

    #[test]
    fn test_rejection_display() {
        let rejection = Rejection {
            status: Some(422),
            message: "unprocessable".to_string(),
        };
        assert_eq!(rejection.to_string(), "status 422: unprocessable");

        let transport = Rejection {
            status: None,
            message: "timed out".to_string(),
        };
        assert_eq!(transport.to_string(), "transport error: timed out");
    }
}
