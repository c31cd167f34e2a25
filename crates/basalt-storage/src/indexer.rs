//! The metadata extraction seam.
//!
//! Which fields of which resource type become searchable rows is
//! resource-type-specific data, not something the store computes. The
//! store only guarantees that whatever the indexer produces is kept in
//! lockstep with the current valid version.

use crate::types::MetadataEntry;
use serde_json::Value;

/// Derives searchable metadata rows from a resource body.
///
/// Implementations must be pure with respect to the body: the store calls
/// `generate` inside its write lock on every mutation and replaces the
/// previous row set wholesale.
pub trait MetadataIndexer: Send + Sync {
    fn generate(&self, resource_type: &str, body: &Value, base_url: &str) -> Vec<MetadataEntry>;
}

/// Indexer that produces no rows. Useful for store-level tests and for
/// deployments that disable search.
#[derive(Debug, Default)]
pub struct NullIndexer;

impl MetadataIndexer for NullIndexer {
    fn generate(&self, _resource_type: &str, _body: &Value, _base_url: &str) -> Vec<MetadataEntry> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_indexer_is_empty() {
        let indexer = NullIndexer;
        let rows = indexer.generate("Patient", &serde_json::json!({}), "http://localhost/fhir");
        assert!(rows.is_empty());
    }
}
