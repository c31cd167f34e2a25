//! Storage row types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Lifecycle status of a version row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Valid,
    Deleted,
}

/// One stored resource version.
///
/// For a fixed `(resource_type, id)` the version ids form a contiguous
/// sequence `1..=N`; the row with the maximum version is the current state,
/// and the resource is gone iff that row is `Deleted`. Rows are only ever
/// appended, except by an explicit purge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedResource {
    pub resource_type: String,
    pub id: String,
    pub version_id: u32,
    pub status: RowStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    /// The serialized resource body. Empty object for tombstones.
    pub content: Value,
}

impl VersionedResource {
    pub fn is_deleted(&self) -> bool {
        self.status == RowStatus::Deleted
    }

    /// Weak ETag for this version, e.g. `W/"3"`.
    pub fn etag(&self) -> String {
        format!("W/\"{}\"", self.version_id)
    }

    /// Version-specific location, e.g. `Patient/1/_history/3`.
    pub fn location(&self) -> String {
        format!(
            "{}/{}/_history/{}",
            self.resource_type, self.id, self.version_id
        )
    }

    pub fn relative_url(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }

    pub fn last_updated_instant(&self) -> String {
        basalt_core::time::format_instant(&self.last_updated)
    }
}

/// Declared kind of a searchable metadata entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Date,
    Number,
    String,
    Token,
    Reference,
    Quantity,
    Uri,
    Period,
    Tag,
}

impl ParamKind {
    /// Kinds compared through the low/high widened bound machinery.
    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            Self::Date | Self::Number | Self::Quantity | Self::Period
        )
    }
}

impl std::fmt::Display for ParamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Date => "date",
            Self::Number => "number",
            Self::String => "string",
            Self::Token => "token",
            Self::Reference => "reference",
            Self::Quantity => "quantity",
            Self::Uri => "uri",
            Self::Period => "period",
            Self::Tag => "tag",
        };
        write!(f, "{name}")
    }
}

/// One searchable key/value row derived from the current version of a
/// resource. The set of entries for a resource exists iff that resource's
/// current version is valid; it is dropped and regenerated atomically with
/// every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub param_name: String,
    pub kind: ParamKind,
    /// Primary comparison value. Dates are normalized to `YYYYMMDDhhmmss`.
    pub value: String,
    /// Case-normalized companion kept alongside the raw value.
    pub value_lower: String,
    /// Token namespace, or the period-end companion for Period entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Tertiary qualifier (quantity unit code, local-time companion).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl MetadataEntry {
    pub fn new(param_name: impl Into<String>, kind: ParamKind, value: impl Into<String>) -> Self {
        let value = value.into();
        let value_lower = value.to_lowercase();
        Self {
            param_name: param_name.into(),
            kind,
            value,
            value_lower,
            system: None,
            code: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Result of the delete state machine.
#[derive(Debug, Clone)]
pub enum DeleteOutcome {
    /// No version chain exists; nothing written.
    NotFound,
    /// Current version already a tombstone; nothing written (idempotent).
    AlreadyGone,
    /// A new tombstone version was appended.
    Deleted(VersionedResource),
}

/// The HTTP method a history entry is reported under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryMethod {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for HistoryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "POST"),
            Self::Update => write!(f, "PUT"),
            Self::Delete => write!(f, "DELETE"),
        }
    }
}

/// A single entry in a history page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub resource: VersionedResource,
    pub method: HistoryMethod,
}

/// Parameters for a history query.
#[derive(Debug, Clone, Default)]
pub struct HistoryParams {
    pub since: Option<OffsetDateTime>,
    pub count: Option<usize>,
    /// 1-based page number.
    pub page: Option<usize>,
}

/// One page of history entries plus the overall total.
#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub entries: Vec<HistoryEntry>,
    pub total: usize,
}

/// `_summary` handling for reads. Filtering always returns a copy; the
/// stored row is never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SummaryMode {
    #[default]
    Full,
    /// Only `id`, `meta` and a SUBSETTED tag.
    True,
    /// Only `id`, `meta` and the narrative `text`.
    Text,
    /// Everything except the narrative `text`.
    Data,
}

impl SummaryMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "true" => Some(Self::True),
            "text" => Some(Self::Text),
            "data" => Some(Self::Data),
            "false" => Some(Self::Full),
            _ => None,
        }
    }
}
