//! String parameter matching.
//!
//! Default string matching is case-insensitive prefix against the
//! case-folded companion column; `:exact` compares the original value
//! byte for byte.

pub fn matches_prefix(value_lower: &str, query: &str) -> bool {
    value_lower.starts_with(&query.to_lowercase())
}

pub fn matches_exact(value: &str, query: &str) -> bool {
    value == query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_is_case_insensitive() {
        assert!(matches_prefix("smith", "Smi"));
        assert!(matches_prefix("smith", "SMITH"));
        assert!(!matches_prefix("smith", "mit"));
    }

    #[test]
    fn test_exact_is_case_sensitive() {
        assert!(matches_exact("Smith", "Smith"));
        assert!(!matches_exact("Smith", "smith"));
        assert!(!matches_exact("Smithers", "Smith"));
    }
}
