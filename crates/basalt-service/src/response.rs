//! The transport-neutral response shape every operation returns.

use serde_json::Value;

use basalt_core::{IssueSeverity, IssueType, OperationOutcome};
use basalt_storage::VersionedResource;

use crate::error::ServiceError;

/// What an operation hands back to whatever transport fronts the
/// service: a status code, an optional JSON body and the version headers.
#[derive(Debug, Clone)]
pub struct FhirResponse {
    pub status: u16,
    pub body: Option<Value>,
    pub etag: Option<String>,
    pub location: Option<String>,
    pub last_modified: Option<String>,
}

impl FhirResponse {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body: Some(body),
            etag: None,
            location: None,
            last_modified: None,
        }
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            body: None,
            etag: None,
            location: None,
            last_modified: None,
        }
    }

    pub fn not_modified() -> Self {
        Self {
            status: 304,
            body: None,
            etag: None,
            location: None,
            last_modified: None,
        }
    }

    /// A 200/201 carrying a stored version with its headers.
    pub fn from_row(status: u16, row: &VersionedResource) -> Self {
        Self {
            status,
            body: Some(row.content.clone()),
            etag: Some(row.etag()),
            location: Some(row.location()),
            last_modified: Some(row.last_updated_instant()),
        }
    }

    pub fn error(status: u16, outcome: OperationOutcome) -> Self {
        Self {
            status,
            body: Some(outcome.to_resource()),
            etag: None,
            location: None,
            last_modified: None,
        }
    }

    #[must_use]
    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl From<&ServiceError> for FhirResponse {
    fn from(err: &ServiceError) -> Self {
        let issue_type = match err.http_status() {
            404 => IssueType::NotFound,
            410 => IssueType::Deleted,
            409 | 412 => IssueType::Conflict,
            429 => IssueType::Throttled,
            400 => IssueType::Invalid,
            _ => IssueType::Exception,
        };
        let outcome = OperationOutcome::single(IssueSeverity::Error, issue_type, err.to_string());
        Self::error(err.http_status(), outcome)
    }
}
