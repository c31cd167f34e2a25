//! Time helpers for FHIR instants.

use crate::error::{CoreError, Result};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Current UTC time, truncated to whole seconds for stable instant output.
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}

/// Format a timestamp as an RFC3339 FHIR instant.
pub fn format_instant(dt: &OffsetDateTime) -> String {
    dt.format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

/// Parse an RFC3339 instant, as used by `_since` and `If-Modified-Since`.
pub fn parse_instant(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|_| CoreError::invalid_date_time(value.to_string()))
}
