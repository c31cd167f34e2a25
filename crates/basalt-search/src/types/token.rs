//! Token parameter matching with `system|code` splitting.

use basalt_storage::MetadataEntry;

/// How the system half of a token query constrains an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemMatch {
    /// Bare `code`: any system matches.
    Any,
    /// `|code`: only entries with no system match.
    None,
    /// `system|code` or `system|`: the named system.
    Is(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenQuery {
    pub system: SystemMatch,
    /// Case-folded code; `None` for `system|` (any code in the system).
    pub code: Option<String>,
}

impl TokenQuery {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('|') {
            Some(("", code)) => Self {
                system: SystemMatch::None,
                code: Some(code.to_lowercase()),
            },
            Some((system, "")) => Self {
                system: SystemMatch::Is(system.to_string()),
                code: None,
            },
            Some((system, code)) => Self {
                system: SystemMatch::Is(system.to_string()),
                code: Some(code.to_lowercase()),
            },
            None => Self {
                system: SystemMatch::Any,
                code: Some(raw.to_lowercase()),
            },
        }
    }

    /// Case-insensitive exact match on the code, exact on the system.
    pub fn matches(&self, entry: &MetadataEntry) -> bool {
        let system_ok = match &self.system {
            SystemMatch::Any => true,
            SystemMatch::None => entry.system.is_none(),
            SystemMatch::Is(system) => entry.system.as_deref() == Some(system.as_str()),
        };
        if !system_ok {
            return false;
        }
        match &self.code {
            Some(code) => entry.value_lower == *code,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_storage::ParamKind;

    fn entry(value: &str, system: Option<&str>) -> MetadataEntry {
        let mut e = MetadataEntry::new("code", ParamKind::Token, value);
        if let Some(s) = system {
            e = e.with_system(s);
        }
        e
    }

    #[test]
    fn test_bare_code_matches_any_system() {
        let q = TokenQuery::parse("8480-6");
        assert!(q.matches(&entry("8480-6", Some("http://loinc.org"))));
        assert!(q.matches(&entry("8480-6", None)));
        assert!(!q.matches(&entry("8462-4", Some("http://loinc.org"))));
    }

    #[test]
    fn test_system_and_code() {
        let q = TokenQuery::parse("http://loinc.org|8480-6");
        assert!(q.matches(&entry("8480-6", Some("http://loinc.org"))));
        assert!(!q.matches(&entry("8480-6", Some("http://snomed.info/sct"))));
        assert!(!q.matches(&entry("8480-6", None)));
    }

    #[test]
    fn test_code_without_system() {
        let q = TokenQuery::parse("|final");
        assert!(q.matches(&entry("final", None)));
        assert!(!q.matches(&entry("final", Some("http://hl7.org/fhir/observation-status"))));
    }

    #[test]
    fn test_system_without_code() {
        let q = TokenQuery::parse("http://loinc.org|");
        assert!(q.matches(&entry("8480-6", Some("http://loinc.org"))));
        assert!(q.matches(&entry("anything", Some("http://loinc.org"))));
        assert!(!q.matches(&entry("8480-6", None)));
    }

    #[test]
    fn test_code_comparison_is_case_insensitive() {
        let q = TokenQuery::parse("FINAL");
        assert!(q.matches(&entry("final", None)));
    }

    #[test]
    fn test_system_comparison_is_case_sensitive() {
        let q = TokenQuery::parse("http://LOINC.org|8480-6");
        assert!(!q.matches(&entry("8480-6", Some("http://loinc.org"))));
    }
}
