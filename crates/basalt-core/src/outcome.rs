//! OperationOutcome construction.
//!
//! OperationOutcome is the structured diagnostic payload used for both
//! errors and informational notices, embedded in response bodies and in
//! search result bundles.

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Fatal,
    Error,
    Warning,
    Information,
}

/// FHIR issue type codes used by Basalt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueType {
    Invalid,
    Structure,
    NotFound,
    Deleted,
    Conflict,
    NotSupported,
    Processing,
    Throttled,
    Exception,
    Informational,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeIssue {
    pub severity: IssueSeverity,
    pub code: IssueType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub expression: Vec<String>,
}

/// An OperationOutcome under construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub issue: Vec<OutcomeIssue>,
}

impl OperationOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(
        severity: IssueSeverity,
        code: IssueType,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self::new().with_issue(severity, code, diagnostics)
    }

    pub fn error(code: IssueType, diagnostics: impl Into<String>) -> Self {
        Self::single(IssueSeverity::Error, code, diagnostics)
    }

    pub fn warning(code: IssueType, diagnostics: impl Into<String>) -> Self {
        Self::single(IssueSeverity::Warning, code, diagnostics)
    }

    pub fn with_issue(
        mut self,
        severity: IssueSeverity,
        code: IssueType,
        diagnostics: impl Into<String>,
    ) -> Self {
        self.issue.push(OutcomeIssue {
            severity,
            code,
            diagnostics: Some(diagnostics.into()),
            expression: Vec::new(),
        });
        self
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        if let Some(issue) = self.issue.last_mut() {
            issue.expression.push(expression.into());
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.issue.is_empty()
    }

    /// Render as a FHIR OperationOutcome resource.
    pub fn to_resource(&self) -> Value {
        let mut value = json!({"resourceType": "OperationOutcome"});
        if let Ok(issues) = serde_json::to_value(&self.issue) {
            value["issue"] = issues;
        }
        value
    }
}

impl From<&CoreError> for OperationOutcome {
    fn from(err: &CoreError) -> Self {
        let code = match err {
            CoreError::NotFound { .. } => IssueType::NotFound,
            CoreError::Gone { .. } => IssueType::Deleted,
            CoreError::VersionConflict { .. } => IssueType::Conflict,
            CoreError::InvalidParameter { .. } => IssueType::Invalid,
            CoreError::UnsupportedOperation(_) => IssueType::NotSupported,
            CoreError::MalformedBody(_) | CoreError::MalformedPatch(_) | CoreError::Json(_) => {
                IssueType::Structure
            }
            CoreError::InvalidDateTime(_) => IssueType::Invalid,
            CoreError::Internal(_) => IssueType::Exception,
        };
        let severity = if err.is_server_error() {
            IssueSeverity::Fatal
        } else {
            IssueSeverity::Error
        };
        Self::single(severity, code, err.to_string())
    }
}
