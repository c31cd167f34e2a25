//! Core FHIR types and utilities shared across the Basalt crates.

pub mod bundle;
pub mod error;
pub mod id;
pub mod outcome;
pub mod time;

pub use bundle::{Bundle, BundleEntry, BundleType, EntryRequest, EntryResponse, SearchEntryMode};
pub use error::{CoreError, ErrorCategory, Result};
pub use id::new_resource_id;
pub use outcome::{IssueSeverity, IssueType, OperationOutcome};
