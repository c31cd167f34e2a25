//! Search compilation and evaluation.
//!
//! Compilation turns a parsed query into a constraint list: exactly one
//! constraint per searchable parameter, each holding the OR alternatives
//! of its comma-separated values. Evaluation then requires every
//! constraint to hold, so OR-within-parameter / AND-across-parameters is
//! structural rather than incidental.
//!
//! Unknown or unusable parameters degrade to warnings and are dropped;
//! only a query whose searchable parameters are all unusable fails as a
//! whole.

use std::sync::Arc;

use tracing::{debug, warn};
use url::form_urlencoded;

use basalt_storage::{MetadataEntry, ParamKind, ResourceStore, SummaryMode, VersionedResource};

use crate::error::{SearchError, SearchResult};
use crate::parser::{ParsedParam, ParsedQuery, SearchModifier, SearchPrefix};
use crate::registry::SearchRegistry;
use crate::types::{date, number, reference, string, token, uri};

/// Hard cap on a result set regardless of `_count`.
pub const MAX_RESULTS: usize = 500;

/// At most this many `_sort` keys are honored.
pub const MAX_SORT_KEYS: usize = 10;

/// Parameters that steer the search rather than constrain it.
const CONTROL_PARAMS: &[&str] = &[
    "_count",
    "_sort",
    "_summary",
    "_total",
    "_include",
    "_revinclude",
    "_type",
    "_format",
    "page",
];

/// Ordered comparison over a widened `[low, high]` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeMatcher {
    pub comparator: SearchPrefix,
    pub low: String,
    pub high: String,
    pub numeric: bool,
}

impl RangeMatcher {
    /// Point value against the range.
    pub fn matches_value(&self, stored: &str) -> bool {
        if self.numeric {
            let (Some(v), Some(low), Some(high)) = (
                number::parse(stored),
                number::parse(&self.low),
                number::parse(&self.high),
            ) else {
                return false;
            };
            return match self.comparator {
                SearchPrefix::Eq | SearchPrefix::Ap => low <= v && v <= high,
                SearchPrefix::Ne => v < low || v > high,
                SearchPrefix::Gt | SearchPrefix::Sa => v > high,
                SearchPrefix::Lt | SearchPrefix::Eb => v < low,
                SearchPrefix::Ge => v >= low,
                SearchPrefix::Le => v <= high,
            };
        }
        let s = stored;
        match self.comparator {
            SearchPrefix::Eq | SearchPrefix::Ap => self.low.as_str() <= s && s <= self.high.as_str(),
            SearchPrefix::Ne => s < self.low.as_str() || s > self.high.as_str(),
            SearchPrefix::Gt | SearchPrefix::Sa => s > self.high.as_str(),
            SearchPrefix::Lt | SearchPrefix::Eb => s < self.low.as_str(),
            SearchPrefix::Ge => s >= self.low.as_str(),
            SearchPrefix::Le => s <= self.high.as_str(),
        }
    }

    /// Period with optional start/end against the range. A missing bound
    /// is open-ended.
    pub fn matches_period(&self, start: Option<&str>, end: Option<&str>) -> bool {
        let starts_by = |limit: &str| start.map(|s| s <= limit).unwrap_or(true);
        let ends_by_or_after = |limit: &str| end.map(|e| e >= limit).unwrap_or(true);
        match self.comparator {
            // Overlap with the query range.
            SearchPrefix::Eq | SearchPrefix::Ap => {
                starts_by(&self.high) && ends_by_or_after(&self.low)
            }
            SearchPrefix::Ne => !(starts_by(&self.high) && ends_by_or_after(&self.low)),
            SearchPrefix::Gt => end.map(|e| e > self.high.as_str()).unwrap_or(true),
            SearchPrefix::Lt => start.map(|s| s < self.low.as_str()).unwrap_or(true),
            SearchPrefix::Ge => end.map(|e| e >= self.low.as_str()).unwrap_or(true),
            SearchPrefix::Le => start.map(|s| s <= self.high.as_str()).unwrap_or(true),
            // Starts-after and ends-before need the respective bound.
            SearchPrefix::Sa => start.map(|s| s > self.high.as_str()).unwrap_or(false),
            SearchPrefix::Eb => end.map(|e| e < self.low.as_str()).unwrap_or(false),
        }
    }
}

/// One OR alternative of a constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueMatcher {
    StringPrefix(String),
    StringExact(String),
    /// `:text` matches the case-folded value of any entry for the param.
    TextPrefix(String),
    Token(token::TokenQuery),
    Uri(String),
    Reference(String),
    Range(RangeMatcher),
}

impl ValueMatcher {
    fn matches(&self, entry: &MetadataEntry) -> bool {
        match self {
            Self::StringPrefix(query) => string::matches_prefix(&entry.value_lower, query),
            Self::StringExact(query) => string::matches_exact(&entry.value, query),
            Self::TextPrefix(query) => entry.value_lower.starts_with(query.as_str()),
            Self::Token(query) => query.matches(entry),
            Self::Uri(query) => uri::matches(&entry.value, query),
            Self::Reference(query) => reference::matches(&entry.value, query),
            Self::Range(range) => {
                if entry.kind == ParamKind::Period {
                    let start = (!entry.value.is_empty()).then_some(entry.value.as_str());
                    let end = entry.system.as_deref().filter(|e| !e.is_empty());
                    range.matches_period(start, end)
                } else {
                    range.matches_value(&entry.value)
                }
            }
        }
    }
}

/// One search parameter compiled down to a single constraint node.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// `_id`, against the version row.
    RowId(Vec<String>),
    /// `_lastUpdated`, against the version row's timestamp.
    RowLastUpdated(Vec<RangeMatcher>),
    /// `:missing=true|false` on a parameter.
    Missing { param: String, expected: bool },
    /// Everything else, against the metadata entries.
    Meta {
        param: String,
        matchers: Vec<ValueMatcher>,
    },
}

impl Constraint {
    /// Whether a row (with its metadata entries) satisfies this
    /// constraint. OR across the alternatives inside.
    pub fn matches(&self, row: &VersionedResource, entries: &[MetadataEntry]) -> bool {
        match self {
            Self::RowId(ids) => ids.iter().any(|id| *id == row.id),
            Self::RowLastUpdated(ranges) => {
                let stamp = instant_digits(row);
                ranges.iter().any(|r| r.matches_value(&stamp))
            }
            Self::Missing { param, expected } => {
                let present = param == "_id"
                    || param == "_lastUpdated"
                    || entries.iter().any(|e| e.param_name == *param);
                present != *expected
            }
            Self::Meta { param, matchers } => entries
                .iter()
                .filter(|e| e.param_name == *param)
                .any(|e| matchers.iter().any(|m| m.matches(e))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub param: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidParam {
    pub name: String,
    pub message: String,
}

/// A compiled search, ready to evaluate.
#[derive(Debug, Clone)]
pub struct CompiledSearch {
    /// Types to scan: the addressed type, or the `_type` list.
    pub types: Vec<String>,
    pub constraints: Vec<Constraint>,
    pub sort: Vec<SortKey>,
    /// Requested `_count`, uncapped.
    pub count: Option<usize>,
    /// `_count=0` or `_summary=count`.
    pub count_only: bool,
    pub summary: SummaryMode,
    pub valid: Vec<String>,
    pub invalid: Vec<InvalidParam>,
    /// True when every searchable parameter failed to compile.
    pub all_invalid: bool,
    /// Canonical query string rebuilt from the raw pairs, `page` removed.
    pub canonical_query: String,
}

/// Resources matching a compiled search, ordered and capped.
#[derive(Debug)]
pub struct SearchMatches {
    pub resources: Vec<VersionedResource>,
    /// Match count before the hard cap.
    pub total: usize,
    pub truncated: bool,
}

pub struct SearchCompiler {
    registry: Arc<SearchRegistry>,
    max_results: usize,
}

impl SearchCompiler {
    pub fn new(registry: Arc<SearchRegistry>) -> Self {
        Self {
            registry,
            max_results: MAX_RESULTS,
        }
    }

    #[must_use]
    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = max;
        self
    }

    pub fn registry(&self) -> &Arc<SearchRegistry> {
        &self.registry
    }

    /// Compiles a query for a typed or cross-type search. `scope`
    /// parameters are ANDed in, do not appear in the canonical link, and
    /// never degrade to warnings.
    pub fn compile(
        &self,
        resource_type: Option<&str>,
        query: &ParsedQuery,
        scope: Option<&ParsedQuery>,
    ) -> SearchResult<CompiledSearch> {
        let declared_types = declared_types(query);
        let types = match resource_type {
            Some(rt) => vec![rt.to_string()],
            None if declared_types.is_empty() => return Err(SearchError::MissingType),
            None => declared_types.clone(),
        };

        let mut compiled = CompiledSearch {
            types,
            constraints: Vec::new(),
            sort: Vec::new(),
            count: None,
            count_only: false,
            summary: SummaryMode::Full,
            valid: Vec::new(),
            invalid: Vec::new(),
            all_invalid: false,
            canonical_query: canonical_query(&query.raw_pairs),
        };

        let mut searchable = 0usize;
        for param in &query.params {
            if CONTROL_PARAMS.contains(&param.name.as_str()) {
                self.apply_control(param, &mut compiled);
                continue;
            }
            searchable += 1;
            match self.compile_param(resource_type, &declared_types, param) {
                Ok(constraint) => {
                    compiled.constraints.push(constraint);
                    compiled.valid.push(param.name.clone());
                }
                Err(err) => {
                    debug!(param = %param.name, %err, "dropping unusable search parameter");
                    compiled.invalid.push(InvalidParam {
                        name: param.name.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }

        if let Some(scope) = scope {
            for param in &scope.params {
                let constraint = self
                    .compile_param(resource_type, &declared_types, param)
                    .map_err(|_| {
                        SearchError::invalid_value(&param.name, "unusable scope parameter")
                    })?;
                compiled.constraints.push(constraint);
            }
        }

        if searchable > 0 && compiled.valid.is_empty() {
            warn!("all search parameters invalid");
            compiled.all_invalid = true;
        }
        Ok(compiled)
    }

    /// Scans the per-type snapshots, applies every constraint, sorts and
    /// caps the matches.
    pub async fn execute(
        &self,
        store: &ResourceStore,
        compiled: &CompiledSearch,
    ) -> SearchMatches {
        if compiled.all_invalid {
            return SearchMatches {
                resources: Vec::new(),
                total: 0,
                truncated: false,
            };
        }

        let mut matched: Vec<(VersionedResource, Vec<MetadataEntry>)> = Vec::new();
        for resource_type in &compiled.types {
            for (row, entries) in store.current_of_type(resource_type).await {
                if compiled.constraints.iter().all(|c| c.matches(&row, &entries)) {
                    matched.push((row, entries));
                }
            }
        }

        sort_matches(&mut matched, &compiled.sort);

        let total = matched.len();
        let truncated = total > self.max_results;
        matched.truncate(self.max_results);
        debug!(total, truncated, "search evaluated");

        SearchMatches {
            resources: matched.into_iter().map(|(row, _)| row).collect(),
            total,
            truncated,
        }
    }

    fn apply_control(&self, param: &ParsedParam, compiled: &mut CompiledSearch) {
        match param.name.as_str() {
            "_count" => {
                if let Some(v) = param.values.first()
                    && let Ok(n) = v.raw.parse::<usize>()
                {
                    if n == 0 {
                        compiled.count_only = true;
                    } else {
                        compiled.count = Some(n);
                    }
                }
            }
            "_summary" => {
                if let Some(v) = param.values.first() {
                    if v.raw == "count" {
                        compiled.count_only = true;
                    } else if let Some(mode) = SummaryMode::parse(&v.raw) {
                        compiled.summary = mode;
                    }
                }
            }
            "_sort" => {
                for v in &param.values {
                    if compiled.sort.len() >= MAX_SORT_KEYS {
                        break;
                    }
                    let raw = v.original();
                    let (descending, name) = match raw.strip_prefix('-') {
                        Some(rest) => (true, rest),
                        None => (false, raw.as_str()),
                    };
                    if name.is_empty() {
                        continue;
                    }
                    compiled.sort.push(SortKey {
                        param: name.to_string(),
                        descending,
                    });
                }
            }
            _ => {}
        }
    }

    fn compile_param(
        &self,
        resource_type: Option<&str>,
        declared_types: &[String],
        param: &ParsedParam,
    ) -> SearchResult<Constraint> {
        let def = self
            .registry
            .resolve(resource_type, declared_types, &param.name)
            .ok_or_else(|| SearchError::UnknownParameter(param.name.clone()))?;

        if let Some(SearchModifier::Missing) = param.modifier {
            let expected = match param.values.first().map(|v| v.raw.as_str()) {
                Some("true") => true,
                Some("false") => false,
                _ => {
                    return Err(SearchError::invalid_value(
                        &param.name,
                        "missing modifier takes true or false",
                    ));
                }
            };
            return Ok(Constraint::Missing {
                param: param.name.clone(),
                expected,
            });
        }

        if let Some(SearchModifier::Other(m)) = &param.modifier {
            return Err(SearchError::invalid_value(
                &param.name,
                format!("unsupported modifier :{m}"),
            ));
        }

        if param.values.is_empty() {
            return Err(SearchError::invalid_value(&param.name, "no value"));
        }

        // Row-level parameters bypass the metadata index.
        match param.name.as_str() {
            "_id" => {
                let ids = param.values.iter().map(|v| v.original()).collect();
                return Ok(Constraint::RowId(ids));
            }
            "_lastUpdated" => {
                let mut ranges = Vec::new();
                for v in &param.values {
                    let (low, high) = date::widen(&v.raw).ok_or_else(|| {
                        SearchError::invalid_value(&param.name, format!("invalid date '{}'", v.raw))
                    })?;
                    ranges.push(RangeMatcher {
                        comparator: v.prefix.unwrap_or_default(),
                        low,
                        high,
                        numeric: false,
                    });
                }
                return Ok(Constraint::RowLastUpdated(ranges));
            }
            _ => {}
        }

        let mut matchers = Vec::new();
        let mut failures = Vec::new();
        for value in &param.values {
            match self.compile_value(&def.kind, def.sole_target(), param, value) {
                Ok(matcher) => matchers.push(matcher),
                Err(err) => failures.push(err.to_string()),
            }
        }
        if matchers.is_empty() {
            return Err(SearchError::invalid_value(
                &param.name,
                failures.join("; "),
            ));
        }
        Ok(Constraint::Meta {
            param: param.name.clone(),
            matchers,
        })
    }

    fn compile_value(
        &self,
        kind: &ParamKind,
        sole_target: Option<&str>,
        param: &ParsedParam,
        value: &crate::parser::ParsedValue,
    ) -> SearchResult<ValueMatcher> {
        match kind {
            ParamKind::String => {
                let raw = value.original();
                match param.modifier {
                    Some(SearchModifier::Exact) => Ok(ValueMatcher::StringExact(raw)),
                    _ => Ok(ValueMatcher::StringPrefix(raw.to_lowercase())),
                }
            }
            ParamKind::Token | ParamKind::Tag => {
                let raw = value.original();
                match param.modifier {
                    Some(SearchModifier::Text) => {
                        Ok(ValueMatcher::TextPrefix(raw.to_lowercase()))
                    }
                    _ => Ok(ValueMatcher::Token(token::TokenQuery::parse(&raw))),
                }
            }
            ParamKind::Uri => Ok(ValueMatcher::Uri(value.original())),
            ParamKind::Reference => {
                let raw = value.original();
                let qualified = reference::qualify(&raw, sole_target).ok_or_else(|| {
                    SearchError::invalid_value(
                        &param.name,
                        format!("reference '{raw}' needs a type qualifier"),
                    )
                })?;
                Ok(ValueMatcher::Reference(qualified))
            }
            ParamKind::Date | ParamKind::Period => {
                let (low, high) = date::widen(&value.raw).ok_or_else(|| {
                    SearchError::invalid_value(
                        &param.name,
                        format!("invalid date '{}'", value.raw),
                    )
                })?;
                Ok(ValueMatcher::Range(RangeMatcher {
                    comparator: value.prefix.unwrap_or_default(),
                    low,
                    high,
                    numeric: false,
                }))
            }
            ParamKind::Number | ParamKind::Quantity => {
                // Quantity values may carry |system|code; the magnitude is
                // what the index compares.
                let magnitude = value.raw.split('|').next().unwrap_or_default();
                let (low, high) = number::widen(magnitude).ok_or_else(|| {
                    SearchError::invalid_value(
                        &param.name,
                        format!("invalid number '{}'", value.raw),
                    )
                })?;
                Ok(ValueMatcher::Range(RangeMatcher {
                    comparator: value.prefix.unwrap_or_default(),
                    low,
                    high,
                    numeric: true,
                }))
            }
        }
    }
}

fn declared_types(query: &ParsedQuery) -> Vec<String> {
    query
        .find("_type")
        .map(|p| p.values.iter().map(|v| v.original()).collect())
        .unwrap_or_default()
}

/// Rebuilds the query string from the pairs as received, dropping the
/// page selector so every page of one search shares a cache key.
fn canonical_query(raw_pairs: &[(String, String)]) -> String {
    let mut ser = form_urlencoded::Serializer::new(String::new());
    for (k, v) in raw_pairs {
        if k == "page" {
            continue;
        }
        ser.append_pair(k, v);
    }
    ser.finish()
}

fn instant_digits(row: &VersionedResource) -> String {
    let t = row.last_updated;
    format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}",
        t.year(),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}

fn sort_matches(matched: &mut [(VersionedResource, Vec<MetadataEntry>)], sort: &[SortKey]) {
    if sort.is_empty() {
        return;
    }
    matched.sort_by(|a, b| {
        for key in sort {
            let ka = sort_value(&a.0, &a.1, &key.param);
            let kb = sort_value(&b.0, &b.1, &key.param);
            // Absent values order last regardless of direction.
            let ord = match (ka, kb) {
                (None, None) => std::cmp::Ordering::Equal,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (Some(_), None) => std::cmp::Ordering::Less,
                (Some(ka), Some(kb)) => {
                    let ord = ka.cmp(&kb);
                    if key.descending { ord.reverse() } else { ord }
                }
            };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

/// The sort key of a row for one parameter: the smallest entry value,
/// with period entries coalescing start then end.
fn sort_value(
    row: &VersionedResource,
    entries: &[MetadataEntry],
    param: &str,
) -> Option<String> {
    match param {
        "_id" => Some(row.id.clone()),
        "_lastUpdated" => Some(instant_digits(row)),
        _ => entries
            .iter()
            .filter(|e| e.param_name == param)
            .filter_map(|e| {
                if e.value.is_empty() {
                    e.system.clone().filter(|s| !s.is_empty())
                } else {
                    Some(e.value.clone())
                }
            })
            .min(),
    }
}
