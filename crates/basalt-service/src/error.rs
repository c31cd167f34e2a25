use thiserror::Error;

use basalt_core::CoreError;
use basalt_search::SearchError;
use basalt_storage::StorageError;

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Malformed request body: {0}")]
    MalformedBody(String),

    #[error("Too many concurrent bundles")]
    Busy,

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),
}

impl ServiceError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::NotSupported(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedBody(message.into())
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionFailed(message.into())
    }

    /// The HTTP status this error renders as.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Core(e) => e.http_status(),
            Self::Storage(e) => e.http_status(),
            Self::Search(_) => 400,
            Self::Config(_) => 500,
            Self::NotSupported(_) => 400,
            Self::MalformedBody(_) => 400,
            Self::Busy => 429,
            Self::PreconditionFailed(_) => 412,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ServiceError::Busy.http_status(), 429);
        assert_eq!(ServiceError::not_supported("x").http_status(), 400);
        assert_eq!(ServiceError::precondition("x").http_status(), 412);
        let storage: ServiceError = StorageError::not_found("Patient", "p1").into();
        assert_eq!(storage.http_status(), 404);
        let gone: ServiceError = StorageError::gone("Patient", "p1").into();
        assert_eq!(gone.http_status(), 410);
    }
}
