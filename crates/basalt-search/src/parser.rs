//! Query-string parsing into structured search parameters.

use std::borrow::Cow;

use url::form_urlencoded;

/// Comparator prefix on an ordered search value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchPrefix {
    #[default]
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    /// Starts after (periods: start strictly past the range).
    Sa,
    /// Ends before (periods: end strictly before the range).
    Eb,
    /// Approximately; treated as `eq` over the widened range.
    Ap,
}

impl SearchPrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Ge => "ge",
            Self::Le => "le",
            Self::Sa => "sa",
            Self::Eb => "eb",
            Self::Ap => "ap",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(Self::Eq),
            "ne" => Some(Self::Ne),
            "gt" => Some(Self::Gt),
            "lt" => Some(Self::Lt),
            "ge" => Some(Self::Ge),
            "le" => Some(Self::Le),
            "sa" => Some(Self::Sa),
            "eb" => Some(Self::Eb),
            "ap" => Some(Self::Ap),
            _ => None,
        }
    }
}

/// Modifier appended to a parameter name after `:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchModifier {
    Exact,
    Text,
    Missing,
    /// Unrecognized modifier, kept verbatim so the compiler can flag it.
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedValue {
    pub prefix: Option<SearchPrefix>,
    /// The value with any comparator prefix stripped.
    pub raw: String,
}

impl ParsedValue {
    /// The value as received, prefix included. Unordered types use this
    /// since a leading "ge"/"eb" there is just part of the text.
    pub fn original(&self) -> String {
        match self.prefix {
            Some(prefix) => format!("{}{}", prefix.as_str(), self.raw),
            None => self.raw.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedParam {
    pub name: String,
    pub modifier: Option<SearchModifier>,
    /// Comma-separated alternatives, OR semantics.
    pub values: Vec<ParsedValue>,
}

/// Search parameters in received order, plus the raw pairs for canonical
/// self-link reconstruction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub params: Vec<ParsedParam>,
    pub raw_pairs: Vec<(String, String)>,
}

impl ParsedQuery {
    /// Parses an application/x-www-form-urlencoded query string.
    /// Example: `name:exact=John&_lastUpdated=ge2020-01-01`.
    pub fn parse(query: &str) -> Self {
        let mut result = Self::default();
        for (k, v) in form_urlencoded::parse(query.as_bytes()) {
            result.raw_pairs.push((k.to_string(), v.to_string()));
            result.push_pair(&k, &v);
        }
        result
    }

    /// Parses decoded `(name, value)` pairs, e.g. from a parsed URL.
    pub fn from_pairs(pairs: &[(String, String)]) -> Self {
        let mut result = Self::default();
        for (k, v) in pairs {
            result.raw_pairs.push((k.clone(), v.clone()));
            result.push_pair(k, v);
        }
        result
    }

    fn push_pair(&mut self, key: &str, value: &str) {
        let (name, modifier) = split_name_and_modifier(Cow::Borrowed(key));
        let mut values = Vec::new();
        // Comma-separated values are OR alternatives.
        for raw_val in value.split(',') {
            let raw_val = raw_val.trim();
            if raw_val.is_empty() {
                continue;
            }
            let (prefix, remainder) = extract_prefix(raw_val);
            values.push(ParsedValue {
                prefix,
                raw: remainder.to_string(),
            });
        }
        self.params.push(ParsedParam {
            name: name.into_owned(),
            modifier,
            values,
        });
    }

    /// Appends another parameter map, e.g. a POST search form body
    /// merged into the query string. Merged parameters carry the same
    /// semantics as repeated query parameters: AND across occurrences.
    #[must_use]
    pub fn merge(mut self, other: ParsedQuery) -> Self {
        self.raw_pairs.extend(other.raw_pairs);
        self.params.extend(other.params);
        self
    }

    /// First occurrence of a named parameter.
    pub fn find(&self, name: &str) -> Option<&ParsedParam> {
        self.params.iter().find(|p| p.name == name)
    }

    /// First raw value of a named parameter.
    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.find(name)
            .and_then(|p| p.values.first())
            .map(|v| v.raw.as_str())
    }
}

fn split_name_and_modifier(key: Cow<'_, str>) -> (Cow<'_, str>, Option<SearchModifier>) {
    if let Some((name, modifier)) = key.split_once(':') {
        let modifier = match modifier {
            "exact" => Some(SearchModifier::Exact),
            "text" => Some(SearchModifier::Text),
            "missing" => Some(SearchModifier::Missing),
            other if !other.is_empty() => Some(SearchModifier::Other(other.to_string())),
            _ => None,
        };
        (Cow::Owned(name.to_string()), modifier)
    } else {
        (key, None)
    }
}

fn extract_prefix(value: &str) -> (Option<SearchPrefix>, &str) {
    // Prefixes are exactly two chars and must be followed by something.
    if value.len() > 2
        && let Some(prefix) = SearchPrefix::parse(&value[..2])
    {
        return (Some(prefix), &value[2..]);
    }
    (None, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_form_parameters_after_query_parameters() {
        let merged = ParsedQuery::parse("name=smith")
            .merge(ParsedQuery::parse("gender=female&name:exact=Smith"));
        assert_eq!(merged.params.len(), 3);
        assert_eq!(merged.params[0].name, "name");
        assert_eq!(merged.params[1].name, "gender");
        assert_eq!(merged.params[2].modifier, Some(SearchModifier::Exact));
        assert_eq!(merged.raw_pairs.len(), 3);
    }

    #[test]
    fn parses_name_and_modifier() {
        let parsed = ParsedQuery::parse("name:exact=John");
        assert_eq!(parsed.params.len(), 1);
        let p = &parsed.params[0];
        assert_eq!(p.name, "name");
        assert_eq!(p.modifier, Some(SearchModifier::Exact));
        assert_eq!(p.values[0].raw, "John");
        assert_eq!(p.values[0].prefix, None);
    }

    #[test]
    fn parses_comparator_prefixes() {
        let parsed = ParsedQuery::parse("birthdate=ge1990-01-01&birthdate=lt2000");
        assert_eq!(parsed.params.len(), 2);
        assert_eq!(parsed.params[0].values[0].prefix, Some(SearchPrefix::Ge));
        assert_eq!(parsed.params[0].values[0].raw, "1990-01-01");
        assert_eq!(parsed.params[1].values[0].prefix, Some(SearchPrefix::Lt));
        assert_eq!(parsed.params[1].values[0].raw, "2000");
    }

    #[test]
    fn comma_values_become_or_alternatives() {
        let parsed = ParsedQuery::parse("status=active,completed");
        assert_eq!(parsed.params[0].values.len(), 2);
        assert_eq!(parsed.params[0].values[0].raw, "active");
        assert_eq!(parsed.params[0].values[1].raw, "completed");
    }

    #[test]
    fn prefix_lookalike_values_stay_intact() {
        // "eq" alone is a value, not a prefix with nothing after it.
        let parsed = ParsedQuery::parse("code=eq");
        assert_eq!(parsed.params[0].values[0].prefix, None);
        assert_eq!(parsed.params[0].values[0].raw, "eq");

        // Words that merely start with a prefix spelling split, but the
        // original text is recoverable for unordered types.
        let parsed = ParsedQuery::parse("name=george");
        assert_eq!(parsed.params[0].values[0].prefix, Some(SearchPrefix::Ge));
        assert_eq!(parsed.params[0].values[0].raw, "orge");
        assert_eq!(parsed.params[0].values[0].original(), "george");
    }

    #[test]
    fn missing_modifier_and_unknown_modifier() {
        let parsed = ParsedQuery::parse("organization:missing=true&name:fuzzy=x");
        assert_eq!(parsed.params[0].modifier, Some(SearchModifier::Missing));
        assert_eq!(
            parsed.params[1].modifier,
            Some(SearchModifier::Other("fuzzy".to_string()))
        );
    }

    #[test]
    fn raw_pairs_keep_received_order() {
        let parsed = ParsedQuery::parse("b=2&a=1&b=3");
        assert_eq!(
            parsed.raw_pairs,
            vec![
                ("b".to_string(), "2".to_string()),
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn url_decoding_applied() {
        let parsed = ParsedQuery::parse("name=Sm%C3%B8rg%C3%A5s&system=http%3A%2F%2Floinc.org%7C1234");
        assert_eq!(parsed.params[0].values[0].raw, "Smørgås");
        assert_eq!(parsed.params[1].values[0].raw, "http://loinc.org|1234");
    }
}
