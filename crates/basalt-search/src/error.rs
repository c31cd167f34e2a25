use thiserror::Error;

pub type SearchResult<T> = std::result::Result<T, SearchError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SearchError {
    #[error("Unknown search parameter: {0}")]
    UnknownParameter(String),

    #[error("Invalid value for {param}: {message}")]
    InvalidValue { param: String, message: String },

    #[error("No search parameters could be applied")]
    AllParametersInvalid,

    #[error("Cross-type search requires a _type parameter")]
    MissingType,

    #[error("Invalid include directive: {0}")]
    InvalidInclude(String),
}

impl SearchError {
    pub fn invalid_value(param: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            param: param.into(),
            message: message.into(),
        }
    }
}
