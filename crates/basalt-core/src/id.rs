//! Server-assigned resource id generation.

/// Generate a new server-assigned resource id.
pub fn new_resource_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Check that a client-supplied id fits the FHIR id grammar
/// (`[A-Za-z0-9\-\.]{1,64}`).
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}
