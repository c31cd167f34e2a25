//! `_include` / `_revinclude` graph expansion.
//!
//! Membership is tracked in an explicit context of three sets (matched,
//! included, revincluded) threaded through the recursion, so a resource
//! appears at most once in a result bundle and iteration terminates:
//! each round only visits resources newly added in the previous one, and
//! the sets only grow.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use basalt_storage::{ParamKind, ResourceStore, VersionedResource};

use crate::compiler::SearchCompiler;
use crate::error::{SearchError, SearchResult};
use crate::parser::ParsedQuery;
use crate::registry::SearchRegistry;

/// One `_include` or `_revinclude` directive: `Source:param[:Target]`,
/// with `*` standing for every reference parameter of the source type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeParam {
    pub source_type: String,
    /// `None` for the wildcard.
    pub param: Option<String>,
    pub target_type: Option<String>,
    pub iterate: bool,
}

impl IncludeParam {
    pub fn parse(raw: &str, iterate: bool) -> SearchResult<Self> {
        let mut parts = raw.splitn(3, ':');
        let source_type = parts.next().unwrap_or_default();
        let param = parts.next();
        let target_type = parts.next();
        if source_type.is_empty() {
            return Err(SearchError::InvalidInclude(raw.to_string()));
        }
        let Some(param) = param.filter(|p| !p.is_empty()) else {
            return Err(SearchError::InvalidInclude(raw.to_string()));
        };
        Ok(Self {
            source_type: source_type.to_string(),
            param: (param != "*").then(|| param.to_string()),
            target_type: target_type.map(|t| t.to_string()),
            iterate,
        })
    }
}

/// Resource-key membership during expansion.
#[derive(Debug, Default)]
pub struct IncludeContext {
    matched: HashSet<(String, String)>,
    included: HashSet<(String, String)>,
    revincluded: HashSet<(String, String)>,
}

impl IncludeContext {
    pub fn with_matches(matches: &[VersionedResource]) -> Self {
        Self {
            matched: matches
                .iter()
                .map(|r| (r.resource_type.clone(), r.id.clone()))
                .collect(),
            ..Self::default()
        }
    }

    fn seen(&self, key: &(String, String)) -> bool {
        self.matched.contains(key) || self.included.contains(key) || self.revincluded.contains(key)
    }
}

/// Expansion output: resources to add to the bundle beyond the matches.
#[derive(Debug, Default)]
pub struct ResolvedIncludes {
    pub included: Vec<VersionedResource>,
    pub revincluded: Vec<VersionedResource>,
}

pub struct IncludeResolver {
    registry: Arc<SearchRegistry>,
}

impl IncludeResolver {
    pub fn new(registry: Arc<SearchRegistry>) -> Self {
        Self { registry }
    }

    /// Expands every directive against the matched set. Plain includes
    /// run once over the matches; `:iterate` directives re-run over each
    /// round's newly included resources until nothing new appears.
    pub async fn resolve(
        &self,
        store: &ResourceStore,
        compiler: &SearchCompiler,
        matches: &[VersionedResource],
        includes: &[IncludeParam],
        revincludes: &[IncludeParam],
    ) -> SearchResult<ResolvedIncludes> {
        let mut ctx = IncludeContext::with_matches(matches);
        let mut out = ResolvedIncludes::default();

        // First round: every include over the matches themselves.
        let mut frontier = self
            .expand_round(store, matches, includes, &mut ctx)
            .await;
        out.included.extend(frontier.iter().cloned());

        // Later rounds: only iterate directives, only into new resources.
        let iterating: Vec<IncludeParam> = includes
            .iter()
            .filter(|inc| inc.iterate)
            .cloned()
            .collect();
        while !frontier.is_empty() && !iterating.is_empty() {
            frontier = self
                .expand_round(store, &frontier, &iterating, &mut ctx)
                .await;
            out.included.extend(frontier.iter().cloned());
        }

        for directive in revincludes {
            let found = self
                .resolve_reverse(store, compiler, matches, directive)
                .await?;
            for row in found {
                let key = (row.resource_type.clone(), row.id.clone());
                if !ctx.seen(&key) {
                    ctx.revincluded.insert(key);
                    out.revincluded.push(row);
                }
            }
        }

        debug!(
            included = out.included.len(),
            revincluded = out.revincluded.len(),
            "include expansion done"
        );
        Ok(out)
    }

    async fn expand_round(
        &self,
        store: &ResourceStore,
        sources: &[VersionedResource],
        includes: &[IncludeParam],
        ctx: &mut IncludeContext,
    ) -> Vec<VersionedResource> {
        let mut added = Vec::new();
        for source in sources {
            for directive in includes {
                if directive.source_type != source.resource_type {
                    continue;
                }
                let entries = store
                    .reference_entries(&source.resource_type, &source.id)
                    .await;
                for entry in entries {
                    if entry.kind != ParamKind::Reference {
                        continue;
                    }
                    if let Some(param) = &directive.param
                        && entry.param_name != *param
                    {
                        continue;
                    }
                    let Some((target_type, target_id)) = split_reference(&entry.value) else {
                        continue;
                    };
                    if let Some(expected) = &directive.target_type
                        && target_type != *expected
                    {
                        continue;
                    }
                    let key = (target_type.clone(), target_id.clone());
                    if ctx.seen(&key) {
                        continue;
                    }
                    // Dangling or deleted targets are silently skipped.
                    if let Ok(row) = store.read(&target_type, &target_id).await {
                        ctx.included.insert(key);
                        added.push(row);
                    }
                }
            }
        }
        added
    }

    /// A `_revinclude=Source:param` is a fresh bounded search for Source
    /// resources whose `param` points at any of the matches.
    async fn resolve_reverse(
        &self,
        store: &ResourceStore,
        compiler: &SearchCompiler,
        matches: &[VersionedResource],
        directive: &IncludeParam,
    ) -> SearchResult<Vec<VersionedResource>> {
        let Some(param) = &directive.param else {
            return Err(SearchError::InvalidInclude(
                "wildcard is not valid for _revinclude".to_string(),
            ));
        };
        let def = self
            .registry
            .resolve(Some(&directive.source_type), &[], param)
            .ok_or_else(|| {
                SearchError::InvalidInclude(format!("{}:{param}", directive.source_type))
            })?;
        if def.kind != ParamKind::Reference {
            return Err(SearchError::InvalidInclude(format!(
                "{}:{param} is not a reference parameter",
                directive.source_type
            )));
        }
        if matches.is_empty() {
            return Ok(Vec::new());
        }

        let targets: Vec<String> = matches.iter().map(|r| r.relative_url()).collect();
        let query = ParsedQuery::parse(&format!("{param}={}", targets.join(",")));
        let compiled = compiler.compile(Some(&directive.source_type), &query, None)?;
        Ok(compiler.execute(store, &compiled).await.resources)
    }
}

/// Splits a stored reference into `(Type, id)`, taking the trailing two
/// path segments so absolute URLs work too.
fn split_reference(value: &str) -> Option<(String, String)> {
    let mut segments = value.rsplit('/');
    let id = segments.next()?;
    let resource_type = segments.next()?;
    if id.is_empty() || resource_type.is_empty() {
        return None;
    }
    Some((resource_type.to_string(), id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::RegistryIndexer;
    use serde_json::json;

    fn setup() -> (Arc<SearchRegistry>, ResourceStore) {
        let registry = Arc::new(SearchRegistry::with_defaults());
        let indexer = Arc::new(RegistryIndexer::new(registry.clone()));
        let store = ResourceStore::new(indexer, "http://localhost/fhir");
        (registry, store)
    }

    async fn seed(store: &ResourceStore) {
        store
            .create("Patient", json!({"resourceType": "Patient", "managingOrganization": {"reference": "Organization/org1"}}), Some("p1"))
            .await
            .unwrap();
        store
            .create("Organization", json!({"resourceType": "Organization", "name": "General", "partOf": {"reference": "Organization/org2"}}), Some("org1"))
            .await
            .unwrap();
        store
            .create("Organization", json!({"resourceType": "Organization", "name": "Parent"}), Some("org2"))
            .await
            .unwrap();
        store
            .create("Observation", json!({"resourceType": "Observation", "status": "final", "subject": {"reference": "Patient/p1"}}), Some("obs1"))
            .await
            .unwrap();
    }

    #[test]
    fn test_parse_directives() {
        let inc = IncludeParam::parse("Observation:subject:Patient", false).unwrap();
        assert_eq!(inc.source_type, "Observation");
        assert_eq!(inc.param.as_deref(), Some("subject"));
        assert_eq!(inc.target_type.as_deref(), Some("Patient"));

        let wild = IncludeParam::parse("Observation:*", true).unwrap();
        assert_eq!(wild.param, None);
        assert!(wild.iterate);

        assert!(IncludeParam::parse("Observation", false).is_err());
        assert!(IncludeParam::parse("", false).is_err());
    }

    #[tokio::test]
    async fn test_include_pulls_referenced_resources() {
        let (registry, store) = setup();
        seed(&store).await;
        let resolver = IncludeResolver::new(registry.clone());
        let compiler = SearchCompiler::new(registry);

        let matches = vec![store.read("Patient", "p1").await.unwrap()];
        let includes = vec![IncludeParam::parse("Patient:organization", false).unwrap()];
        let resolved = resolver
            .resolve(&store, &compiler, &matches, &includes, &[])
            .await
            .unwrap();

        assert_eq!(resolved.included.len(), 1);
        assert_eq!(resolved.included[0].id, "org1");
    }

    #[tokio::test]
    async fn test_iterate_recurses_into_new_resources_only() {
        let (registry, store) = setup();
        seed(&store).await;
        let resolver = IncludeResolver::new(registry.clone());
        let compiler = SearchCompiler::new(registry);

        let matches = vec![store.read("Patient", "p1").await.unwrap()];
        let includes = vec![
            IncludeParam::parse("Patient:organization", false).unwrap(),
            IncludeParam::parse("Organization:partof", true).unwrap(),
        ];
        let resolved = resolver
            .resolve(&store, &compiler, &matches, &includes, &[])
            .await
            .unwrap();

        // org1 directly, org2 through the iterating partof hop.
        let ids: Vec<&str> = resolved.included.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["org1", "org2"]);
    }

    #[tokio::test]
    async fn test_self_referential_chain_terminates_and_dedups() {
        let (registry, store) = setup();
        // a -> b -> a reference cycle.
        store
            .create("Organization", json!({"resourceType": "Organization", "partOf": {"reference": "Organization/b"}}), Some("a"))
            .await
            .unwrap();
        store
            .create("Organization", json!({"resourceType": "Organization", "partOf": {"reference": "Organization/a"}}), Some("b"))
            .await
            .unwrap();
        let resolver = IncludeResolver::new(registry.clone());
        let compiler = SearchCompiler::new(registry);

        let matches = vec![store.read("Organization", "a").await.unwrap()];
        let includes = vec![IncludeParam::parse("Organization:partof", true).unwrap()];
        let resolved = resolver
            .resolve(&store, &compiler, &matches, &includes, &[])
            .await
            .unwrap();

        // b is included once; the hop back to a stops at the matched set.
        assert_eq!(resolved.included.len(), 1);
        assert_eq!(resolved.included[0].id, "b");
    }

    #[tokio::test]
    async fn test_wildcard_include() {
        let (registry, store) = setup();
        seed(&store).await;
        let resolver = IncludeResolver::new(registry.clone());
        let compiler = SearchCompiler::new(registry);

        let matches = vec![store.read("Observation", "obs1").await.unwrap()];
        let includes = vec![IncludeParam::parse("Observation:*", false).unwrap()];
        let resolved = resolver
            .resolve(&store, &compiler, &matches, &includes, &[])
            .await
            .unwrap();

        assert_eq!(resolved.included.len(), 1);
        assert_eq!(resolved.included[0].id, "p1");
    }

    #[tokio::test]
    async fn test_revinclude_finds_referrers() {
        let (registry, store) = setup();
        seed(&store).await;
        let resolver = IncludeResolver::new(registry.clone());
        let compiler = SearchCompiler::new(registry);

        let matches = vec![store.read("Patient", "p1").await.unwrap()];
        let revincludes = vec![IncludeParam::parse("Observation:subject", false).unwrap()];
        let resolved = resolver
            .resolve(&store, &compiler, &matches, &[], &revincludes)
            .await
            .unwrap();

        assert_eq!(resolved.revincluded.len(), 1);
        assert_eq!(resolved.revincluded[0].id, "obs1");
    }

    #[tokio::test]
    async fn test_dangling_reference_skipped() {
        let (registry, store) = setup();
        store
            .create("Patient", json!({"resourceType": "Patient", "managingOrganization": {"reference": "Organization/ghost"}}), Some("p9"))
            .await
            .unwrap();
        let resolver = IncludeResolver::new(registry.clone());
        let compiler = SearchCompiler::new(registry);

        let matches = vec![store.read("Patient", "p9").await.unwrap()];
        let includes = vec![IncludeParam::parse("Patient:organization", false).unwrap()];
        let resolved = resolver
            .resolve(&store, &compiler, &matches, &includes, &[])
            .await
            .unwrap();
        assert!(resolved.included.is_empty());
    }
}
