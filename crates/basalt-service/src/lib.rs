//! The FHIR interaction layer: per-request operation handling on top of
//! the versioned store and search engine, plus batch/transaction bundle
//! coordination.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod response;
pub mod service;

pub use config::ServiceConfig;
pub use coordinator::TransactionCoordinator;
pub use error::{ServiceError, ServiceResult};
pub use response::FhirResponse;
pub use service::{FhirService, RequestHeaders};
