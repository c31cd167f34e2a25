//! Storage error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Resource not found: {resource_type}/{id}")]
    NotFound { resource_type: String, id: String },

    #[error("Resource deleted: {resource_type}/{id}")]
    Gone { resource_type: String, id: String },

    #[error("Resource already exists: {resource_type}/{id}")]
    AlreadyExists { resource_type: String, id: String },

    #[error("Version conflict on {resource_type}/{id}: expected {expected}, current is {found}")]
    VersionConflict {
        resource_type: String,
        id: String,
        expected: u32,
        found: u32,
    },

    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    #[error("Malformed patch document: {0}")]
    MalformedPatch(String),

    #[error("Internal storage error: {0}")]
    Internal(String),
}

impl StorageError {
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

    pub fn already_exists(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
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

    pub fn invalid_resource(message: impl Into<String>) -> Self {
        Self::InvalidResource(message.into())
    }

    pub fn malformed_patch(message: impl Into<String>) -> Self {
        Self::MalformedPatch(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// The HTTP status this error maps to at the operation surface.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::Gone { .. } => 410,
            Self::AlreadyExists { .. } => 409,
            Self::VersionConflict { .. } => 412,
            Self::InvalidResource(_) | Self::MalformedPatch(_) => 400,
            Self::Internal(_) => 500,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
