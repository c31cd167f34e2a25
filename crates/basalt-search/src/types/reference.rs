//! Reference parameter matching.
//!
//! Indexed reference values are relative `Type/id` strings. A query value
//! matches case-sensitively when the stored reference equals it or ends
//! with `/{value}` once the value carries a type segment; a bare id is
//! first qualified through the parameter's sole declared target.

/// Qualifies a query value with its target type. `Patient/123` passes
/// through; a bare `123` becomes `{sole_target}/123` or `None` when the
/// parameter declares several possible targets.
pub fn qualify(raw: &str, sole_target: Option<&str>) -> Option<String> {
    if raw.contains('/') {
        return Some(raw.to_string());
    }
    sole_target.map(|target| format!("{target}/{raw}"))
}

/// Case-sensitive suffix match: absolute stored references still match
/// their relative form.
pub fn matches(stored: &str, query: &str) -> bool {
    stored == query || stored.ends_with(&format!("/{query}"))
}
