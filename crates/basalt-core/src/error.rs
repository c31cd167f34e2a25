use thiserror::Error;

/// Core error taxonomy for Basalt operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Resource not found: {resource_type}/{id}")]
    NotFound { resource_type: String, id: String },

    #[error("Resource deleted: {resource_type}/{id}")]
    Gone { resource_type: String, id: String },

    #[error("Version conflict on {resource_type}/{id}: expected {expected}, found {found}")]
    VersionConflict {
        resource_type: String,
        id: String,
        expected: u32,
        found: u32,
    },

    #[error("Invalid search parameter '{param}': {message}")]
    InvalidParameter { param: String, message: String },

    #[error("Operation not supported: {0}")]
    UnsupportedOperation(String),

    #[error("Malformed resource body: {0}")]
    MalformedBody(String),

    #[error("Malformed patch document: {0}")]
    MalformedPatch(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid FHIR DateTime: {0}")]
    InvalidDateTime(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn not_found(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    pub fn gone(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Gone {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    pub fn version_conflict(
        resource_type: impl Into<String>,
        id: impl Into<String>,
        expected: u32,
        found: u32,
    ) -> Self {
        Self::VersionConflict {
            resource_type: resource_type.into(),
            id: id.into(),
            expected,
            found,
        }
    }

    pub fn invalid_parameter(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            param: param.into(),
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedOperation(message.into())
    }

    pub fn malformed_body(message: impl Into<String>) -> Self {
        Self::MalformedBody(message.into())
    }

    pub fn malformed_patch(message: impl Into<String>) -> Self {
        Self::MalformedPatch(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn invalid_date_time(value: impl Into<String>) -> Self {
        Self::InvalidDateTime(value.into())
    }

    /// The HTTP status code this error maps to at the REST boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::Gone { .. } => 410,
            Self::VersionConflict { .. } => 412,
            Self::InvalidParameter { .. }
            | Self::MalformedBody(_)
            | Self::MalformedPatch(_)
            | Self::InvalidDateTime(_)
            | Self::UnsupportedOperation(_) => 400,
            Self::Json(_) => 400,
            Self::Internal(_) => 500,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.http_status() < 500
    }

    pub fn is_server_error(&self) -> bool {
        self.http_status() >= 500
    }

    /// Error category for logging and monitoring.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Gone { .. } => ErrorCategory::Deleted,
            Self::VersionConflict { .. } => ErrorCategory::Conflict,
            Self::InvalidParameter { .. } => ErrorCategory::Validation,
            Self::UnsupportedOperation(_) => ErrorCategory::Unsupported,
            Self::MalformedBody(_) | Self::MalformedPatch(_) | Self::Json(_) => {
                ErrorCategory::Serialization
            }
            Self::InvalidDateTime(_) => ErrorCategory::Validation,
            Self::Internal(_) => ErrorCategory::System,
        }
    }
}

/// Error categories for monitoring and classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    NotFound,
    Conflict,
    Deleted,
    Serialization,
    Unsupported,
    System,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Deleted => write!(f, "deleted"),
            Self::Serialization => write!(f, "serialization"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Convenience result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = CoreError::not_found("Patient", "123");
        assert_eq!(err.to_string(), "Resource not found: Patient/123");
        assert_eq!(err.http_status(), 404);
        assert!(err.is_client_error());
        assert_eq!(err.category(), ErrorCategory::NotFound);
    }

    #[test]
    fn test_gone_error() {
        let err = CoreError::gone("Patient", "123");
        assert_eq!(err.http_status(), 410);
        assert_eq!(err.category(), ErrorCategory::Deleted);
    }

    #[test]
    fn test_version_conflict_error() {
        let err = CoreError::version_conflict("Patient", "123", 3, 4);
        assert_eq!(err.http_status(), 412);
        assert!(err.to_string().contains("expected 3"));
        assert_eq!(err.category(), ErrorCategory::Conflict);
    }

    #[test]
    fn test_invalid_parameter_error() {
        let err = CoreError::invalid_parameter("birthdate", "unknown parameter");
        assert_eq!(err.http_status(), 400);
        assert!(err.to_string().contains("birthdate"));
    }

    #[test]
    fn test_internal_error_is_server_error() {
        let err = CoreError::internal("storage failed");
        assert_eq!(err.http_status(), 500);
        assert!(err.is_server_error());
        assert!(!err.is_client_error());
        assert_eq!(err.category(), ErrorCategory::System);
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ bad }").unwrap_err();
        let err: CoreError = json_err.into();
        assert!(matches!(err, CoreError::Json(_)));
        assert_eq!(err.category(), ErrorCategory::Serialization);
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Validation.to_string(), "validation");
        assert_eq!(ErrorCategory::NotFound.to_string(), "not_found");
        assert_eq!(ErrorCategory::Unsupported.to_string(), "unsupported");
    }
}
