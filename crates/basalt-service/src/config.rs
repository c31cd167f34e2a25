//! Service configuration.
//!
//! Everything is dependency-injected from here; there are no process
//! globals. Loadable from TOML, every field individually defaulted.

use serde::Deserialize;

use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Absolute base the server is addressed under, no trailing slash.
    pub base_url: String,
    /// Hard cap on one search result set.
    pub max_search_results: usize,
    /// Page size when the client sends no `_count`.
    pub default_page_size: usize,
    /// Idle seconds before a cached result set expires.
    pub page_ttl_secs: u64,
    /// Bundles processed concurrently before new ones are turned away.
    pub max_concurrent_bundles: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/fhir".to_string(),
            max_search_results: 500,
            default_page_size: 20,
            page_ttl_secs: 300,
            max_concurrent_bundles: 8,
        }
    }
}

impl ServiceConfig {
    pub fn from_toml_str(raw: &str) -> ServiceResult<Self> {
        let mut config: Self = toml::from_str(raw)
            .map_err(|e| ServiceError::config(format!("invalid configuration: {e}")))?;
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        if config.default_page_size == 0 {
            return Err(ServiceError::config("default_page_size must be at least 1"));
        }
        if config.max_concurrent_bundles == 0 {
            return Err(ServiceError::config(
                "max_concurrent_bundles must be at least 1",
            ));
        }
        Ok(config)
    }
}
