//! The resource operation surface.
//!
//! `FhirService` is what a REST layer (or the bundle coordinator, which
//! is just another client) calls: one method per interaction, each
//! returning a transport-neutral `FhirResponse`. All conditional-header
//! semantics live here; the store below knows only versions.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info};

use basalt_core::time::parse_instant;
use basalt_core::{IssueSeverity, IssueType, OperationOutcome};
use basalt_search::{
    IncludeParam, IncludeResolver, ParsedQuery, RegistryIndexer, SearchCompiler, SearchModifier,
    SearchRegistry,
};
use basalt_storage::{
    DeleteOutcome, HistoryMethod, HistoryParams, PageCache, ResourceStore, SummaryMode,
    apply_summary,
};

use crate::config::ServiceConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::response::FhirResponse;

/// Conditional headers accompanying a request.
#[derive(Debug, Default, Clone)]
pub struct RequestHeaders {
    pub if_match: Option<String>,
    pub if_none_exist: Option<String>,
    pub if_modified_since: Option<String>,
}

pub struct FhirService {
    store: Arc<ResourceStore>,
    compiler: SearchCompiler,
    resolver: IncludeResolver,
    page_cache: Arc<PageCache>,
    config: ServiceConfig,
}

impl FhirService {
    pub fn new(config: ServiceConfig) -> Self {
        let registry = Arc::new(SearchRegistry::with_defaults());
        let indexer = Arc::new(RegistryIndexer::new(registry.clone()));
        let store = Arc::new(ResourceStore::new(indexer, config.base_url.clone()));
        Self {
            compiler: SearchCompiler::new(registry.clone())
                .with_max_results(config.max_search_results),
            resolver: IncludeResolver::new(registry),
            page_cache: Arc::new(PageCache::new(config.page_ttl_secs)),
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<ResourceStore> {
        &self.store
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    // ==================== Instance operations ====================

    pub async fn create(
        &self,
        resource_type: &str,
        body: Value,
        headers: &RequestHeaders,
    ) -> FhirResponse {
        match self.create_inner(resource_type, body, headers).await {
            Ok(resp) => resp,
            Err(err) => (&err).into(),
        }
    }

    async fn create_inner(
        &self,
        resource_type: &str,
        body: Value,
        headers: &RequestHeaders,
    ) -> ServiceResult<FhirResponse> {
        if let Some(condition) = &headers.if_none_exist {
            let query = ParsedQuery::parse(condition);
            let compiled = self.compiler.compile(Some(resource_type), &query, None)?;
            let found = self.compiler.execute(&self.store, &compiled).await;
            match found.total {
                0 => {}
                1 => {
                    debug!(resource_type, "conditional create matched existing resource");
                    return Ok(FhirResponse::from_row(200, &found.resources[0]));
                }
                n => {
                    return Err(ServiceError::precondition(format!(
                        "If-None-Exist matched {n} resources"
                    )));
                }
            }
        }
        let row = self.store.create(resource_type, body, None).await?;
        info!(resource_type, id = %row.id, "resource created");
        Ok(FhirResponse::from_row(201, &row))
    }

    pub async fn read(
        &self,
        resource_type: &str,
        id: &str,
        summary: SummaryMode,
        headers: &RequestHeaders,
    ) -> FhirResponse {
        let row = match self.store.read_summary(resource_type, id, summary).await {
            Ok(row) => row,
            Err(err) => return (&ServiceError::from(err)).into(),
        };
        if let Some(since) = headers
            .if_modified_since
            .as_deref()
            .and_then(|v| parse_instant(v).ok())
            && row.last_updated <= since
        {
            return FhirResponse::not_modified().with_etag(row.etag());
        }
        FhirResponse::from_row(200, &row)
    }

    pub async fn vread(&self, resource_type: &str, id: &str, version: u32) -> FhirResponse {
        match self.store.vread(resource_type, id, version).await {
            Ok(row) => FhirResponse::from_row(200, &row),
            Err(err) => (&ServiceError::from(err)).into(),
        }
    }

    pub async fn update(
        &self,
        resource_type: &str,
        id: &str,
        body: Value,
        headers: &RequestHeaders,
    ) -> FhirResponse {
        let expected = match headers.if_match.as_deref().map(parse_etag) {
            Some(None) => {
                return (&ServiceError::precondition("unparseable If-Match header")).into();
            }
            Some(Some(v)) => Some(v),
            None => None,
        };
        match self.store.update(resource_type, id, body, expected).await {
            Ok((row, created)) => {
                let status = if created { 201 } else { 200 };
                info!(resource_type, id, version = row.version_id, "resource updated");
                FhirResponse::from_row(status, &row)
            }
            Err(err) => (&ServiceError::from(err)).into(),
        }
    }

    pub async fn patch(&self, resource_type: &str, id: &str, patch: &Value) -> FhirResponse {
        match self.store.patch(resource_type, id, patch).await {
            Ok(row) => FhirResponse::from_row(200, &row),
            Err(err) => (&ServiceError::from(err)).into(),
        }
    }

    /// Only the valid branch writes a tombstone and answers 204. A repeat
    /// on a gone resource is an idempotent 200, and a never-existed id is
    /// a 204 as well since there is nothing to remove.
    pub async fn delete(&self, resource_type: &str, id: &str) -> FhirResponse {
        match self.store.delete(resource_type, id).await {
            Ok(DeleteOutcome::Deleted(row)) => {
                info!(resource_type, id, "resource deleted");
                FhirResponse::no_content().with_etag(row.etag())
            }
            Ok(DeleteOutcome::AlreadyGone) => FhirResponse::ok(
                OperationOutcome::single(
                    IssueSeverity::Information,
                    IssueType::Informational,
                    format!("{resource_type}/{id} is already deleted"),
                )
                .to_resource(),
            ),
            Ok(DeleteOutcome::NotFound) => FhirResponse::no_content(),
            Err(err) => (&ServiceError::from(err)).into(),
        }
    }

    // ==================== Search ====================

    pub async fn search(&self, resource_type: Option<&str>, query_str: &str) -> FhirResponse {
        match self.search_inner(resource_type, query_str).await {
            Ok(resp) => resp,
            Err(err) => (&err).into(),
        }
    }

    async fn search_inner(
        &self,
        resource_type: Option<&str>,
        query_str: &str,
    ) -> ServiceResult<FhirResponse> {
        let query = ParsedQuery::parse(query_str);
        let compiled = self.compiler.compile(resource_type, &query, None)?;
        let canonical_url = self.canonical_url(resource_type, &compiled.canonical_query);

        // Follow-up page requests are served from the rendered cache; a
        // miss means the result set expired and must be re-run.
        if let Some(page) = query.first_value("page").and_then(|v| v.parse::<usize>().ok()) {
            return Ok(match self.page_cache.get_page(&canonical_url, page) {
                Some(cached) => self.page_response(
                    &canonical_url,
                    page,
                    cached.entries,
                    cached.total,
                    cached.page_count,
                ),
                None => FhirResponse::error(
                    404,
                    OperationOutcome::error(
                        IssueType::NotFound,
                        "search result set expired, re-run the search",
                    ),
                ),
            });
        }

        if compiled.all_invalid {
            let mut outcome = OperationOutcome::new();
            for inv in &compiled.invalid {
                outcome = outcome
                    .with_issue(IssueSeverity::Error, IssueType::Invalid, inv.message.clone())
                    .with_expression(inv.name.clone());
            }
            return Ok(FhirResponse::error(400, outcome));
        }

        let matches = self.compiler.execute(&self.store, &compiled).await;

        if compiled.count_only {
            let bundle = json!({
                "resourceType": "Bundle",
                "type": "searchset",
                "total": matches.total,
                "link": [{"relation": "self", "url": canonical_url}],
            });
            return Ok(FhirResponse::ok(bundle));
        }

        // Include expansion; a bad directive degrades to a warning.
        let mut warnings = compiled.invalid.clone();
        let (includes, revincludes) = parse_include_directives(&query, &mut warnings);
        let resolved = self
            .resolver
            .resolve(&self.store, &self.compiler, &matches.resources, &includes, &revincludes)
            .await?;

        let mut rendered: Vec<Value> = Vec::new();
        for row in &matches.resources {
            rendered.push(json!({
                "fullUrl": self.full_url(&row.relative_url()),
                "resource": apply_summary(&row.content, compiled.summary),
                "search": {"mode": "match"},
            }));
        }
        let page_size = compiled.count.unwrap_or(self.config.default_page_size).max(1);
        let mut pages: Vec<Vec<Value>> = if rendered.is_empty() {
            vec![Vec::new()]
        } else {
            rendered.chunks(page_size).map(|c| c.to_vec()).collect()
        };

        // Includes and diagnostics ride along on every page.
        let mut extras: Vec<Value> = Vec::new();
        for row in resolved.included.iter().chain(resolved.revincluded.iter()) {
            extras.push(json!({
                "fullUrl": self.full_url(&row.relative_url()),
                "resource": row.content,
                "search": {"mode": "include"},
            }));
        }
        if !warnings.is_empty() {
            let mut outcome = OperationOutcome::new();
            for inv in &warnings {
                outcome = outcome
                    .with_issue(IssueSeverity::Warning, IssueType::Invalid, inv.message.clone())
                    .with_expression(inv.name.clone());
            }
            extras.push(json!({
                "resource": outcome.to_resource(),
                "search": {"mode": "outcome"},
            }));
        }
        for page in &mut pages {
            page.extend(extras.iter().cloned());
        }

        let page_count = pages.len();
        let first = pages[0].clone();
        self.page_cache.insert(&canonical_url, pages, matches.total);
        debug!(total = matches.total, page_count, "searchset assembled");

        Ok(self.page_response(&canonical_url, 1, first, matches.total, page_count))
    }

    fn page_response(
        &self,
        canonical_url: &str,
        page: usize,
        entries: Vec<Value>,
        total: usize,
        page_count: usize,
    ) -> FhirResponse {
        let links = paging_links(canonical_url, page, page_count);
        let mut bundle = json!({
            "resourceType": "Bundle",
            "type": "searchset",
            "total": total,
            "link": links,
        });
        if !entries.is_empty() {
            bundle["entry"] = Value::Array(entries);
        }
        FhirResponse::ok(bundle)
    }

    // ==================== History ====================

    pub async fn history(
        &self,
        resource_type: Option<&str>,
        id: Option<&str>,
        query_str: &str,
    ) -> FhirResponse {
        match self.history_inner(resource_type, id, query_str).await {
            Ok(resp) => resp,
            Err(err) => (&err).into(),
        }
    }

    async fn history_inner(
        &self,
        resource_type: Option<&str>,
        id: Option<&str>,
        query_str: &str,
    ) -> ServiceResult<FhirResponse> {
        let query = ParsedQuery::parse(query_str);
        let mut params = HistoryParams::default();
        if let Some(since) = query.first_value("_since") {
            params.since = Some(parse_instant(since).map_err(|_| {
                ServiceError::malformed(format!("invalid _since instant '{since}'"))
            })?);
        }
        params.count = query.first_value("_count").and_then(|v| v.parse().ok());
        params.page = query.first_value("page").and_then(|v| v.parse().ok());

        let page = self.store.history(resource_type, id, &params).await?;

        let mut entries = Vec::new();
        for item in &page.entries {
            let row = &item.resource;
            let (status, url) = match item.method {
                HistoryMethod::Create => ("201 Created", row.resource_type.clone()),
                HistoryMethod::Update => ("200 OK", row.relative_url()),
                HistoryMethod::Delete => ("204 No Content", row.relative_url()),
            };
            let mut entry = json!({
                "fullUrl": self.full_url(&row.relative_url()),
                "request": {"method": item.method.to_string(), "url": url},
                "response": {
                    "status": status,
                    "etag": row.etag(),
                    "lastModified": row.last_updated_instant(),
                },
            });
            if !row.is_deleted() {
                entry["resource"] = row.content.clone();
            }
            entries.push(entry);
        }

        let canonical_url = self.history_url(resource_type, id, &query, params.count);
        let current_page = params.page.unwrap_or(1).max(1);
        let page_count = match params.count {
            Some(count) if count > 0 => page.total.div_ceil(count).max(1),
            _ => 1,
        };

        let mut bundle = json!({
            "resourceType": "Bundle",
            "type": "history",
            "total": page.total,
            "link": paging_links(&canonical_url, current_page, page_count),
        });
        if !entries.is_empty() {
            bundle["entry"] = Value::Array(entries);
        }
        Ok(FhirResponse::ok(bundle))
    }

    fn history_url(
        &self,
        resource_type: Option<&str>,
        id: Option<&str>,
        query: &ParsedQuery,
        count: Option<usize>,
    ) -> String {
        let mut url = self.config.base_url.clone();
        if let Some(rt) = resource_type {
            url.push('/');
            url.push_str(rt);
            if let Some(id) = id {
                url.push('/');
                url.push_str(id);
            }
        }
        url.push_str("/_history");
        let mut pairs = Vec::new();
        if let Some(since) = query.first_value("_since") {
            pairs.push(format!("_since={since}"));
        }
        if let Some(count) = count {
            pairs.push(format!("_count={count}"));
        }
        if !pairs.is_empty() {
            url.push('?');
            url.push_str(&pairs.join("&"));
        }
        url
    }

    // ==================== Dispatch ====================

    /// Routes a `(method, url)` pair to the operation it addresses, the
    /// same way a REST front end would. The bundle coordinator funnels
    /// every entry through here.
    pub async fn handle(
        &self,
        method: &str,
        url: &str,
        body: Option<Value>,
        headers: &RequestHeaders,
    ) -> FhirResponse {
        let (path, query) = match url.split_once('?') {
            Some((p, q)) => (p, q),
            None => (url, ""),
        };
        let segments: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        let method = method.to_ascii_uppercase();

        match (method.as_str(), segments.as_slice()) {
            ("GET", []) => self.search(None, query).await,
            ("GET", ["_history"]) => self.history(None, None, query).await,
            ("GET", [rt]) => self.search(Some(rt), query).await,
            ("POST", [rt]) => match body {
                Some(body) => self.create(rt, body, headers).await,
                None => (&ServiceError::malformed("create requires a resource body")).into(),
            },
            ("GET", [rt, "_history"]) => self.history(Some(rt), None, query).await,
            ("GET", [rt, id]) => {
                let summary = ParsedQuery::parse(query)
                    .first_value("_summary")
                    .and_then(SummaryMode::parse)
                    .unwrap_or(SummaryMode::Full);
                self.read(rt, id, summary, headers).await
            }
            ("PUT", [rt, id]) => match body {
                Some(body) => self.update(rt, id, body, headers).await,
                None => (&ServiceError::malformed("update requires a resource body")).into(),
            },
            ("PATCH", [rt, id]) => match body {
                Some(patch) => self.patch(rt, id, &patch).await,
                None => (&ServiceError::malformed("patch requires a patch body")).into(),
            },
            ("DELETE", [rt, id]) => self.delete(rt, id).await,
            ("GET", [rt, id, "_history"]) => self.history(Some(rt), Some(id), query).await,
            ("GET", [rt, id, "_history", version]) => match version.parse::<u32>() {
                Ok(v) => self.vread(rt, id, v).await,
                Err(_) => (&ServiceError::malformed("version must be an integer")).into(),
            },
            _ => (&ServiceError::not_supported(format!("{method} {path}"))).into(),
        }
    }

    fn canonical_url(&self, resource_type: Option<&str>, canonical_query: &str) -> String {
        let base = match resource_type {
            Some(rt) => format!("{}/{rt}", self.config.base_url),
            None => self.config.base_url.clone(),
        };
        if canonical_query.is_empty() {
            base
        } else {
            format!("{base}?{canonical_query}")
        }
    }

    fn full_url(&self, relative: &str) -> String {
        format!("{}/{relative}", self.config.base_url)
    }
}

fn with_page(url: &str, page: usize) -> String {
    if url.contains('?') {
        format!("{url}&page={page}")
    } else {
        format!("{url}?page={page}")
    }
}

/// self/next/previous links for one page of a result set. Page 1 is the
/// bare canonical URL.
fn paging_links(canonical_url: &str, page: usize, page_count: usize) -> Vec<Value> {
    let mut links = vec![json!({
        "relation": "self",
        "url": if page > 1 { with_page(canonical_url, page) } else { canonical_url.to_string() },
    })];
    if page < page_count {
        links.push(json!({"relation": "next", "url": with_page(canonical_url, page + 1)}));
    }
    if page > 1 {
        links.push(json!({"relation": "previous", "url": if page == 2 {
            canonical_url.to_string()
        } else {
            with_page(canonical_url, page - 1)
        }}));
    }
    links
}

/// `W/"3"`, `"3"` or `3` all mean version 3.
fn parse_etag(raw: &str) -> Option<u32> {
    raw.trim()
        .trim_start_matches("W/")
        .trim_matches('"')
        .parse()
        .ok()
}

fn parse_include_directives(
    query: &ParsedQuery,
    warnings: &mut Vec<basalt_search::InvalidParam>,
) -> (Vec<IncludeParam>, Vec<IncludeParam>) {
    let mut includes = Vec::new();
    let mut revincludes = Vec::new();
    for param in &query.params {
        let (reverse, name) = match param.name.as_str() {
            "_include" => (false, "_include"),
            "_revinclude" => (true, "_revinclude"),
            _ => continue,
        };
        let iterate = matches!(&param.modifier, Some(SearchModifier::Other(m)) if m == "iterate");
        for value in &param.values {
            match IncludeParam::parse(&value.original(), iterate) {
                Ok(directive) if reverse => revincludes.push(directive),
                Ok(directive) => includes.push(directive),
                Err(err) => warnings.push(basalt_search::InvalidParam {
                    name: name.to_string(),
                    message: err.to_string(),
                }),
            }
        }
    }
    (includes, revincludes)
}
