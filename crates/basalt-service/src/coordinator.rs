//! Batch and transaction bundle processing.
//!
//! Entries run phased rather than in document order: deletes first, then
//! writes, then reads, so a transaction that deletes and re-creates the
//! same resource behaves the same regardless of how the client ordered
//! it. Writes re-run in cycles so `urn:uuid:` placeholder references can
//! resolve once their target entry has been created, whichever entry
//! came first in the document.
//!
//! Both bundle kinds share the machinery; the difference is purely
//! declarative here because every entry is isolated either way. There is
//! no rollback: a failed entry reports its outcome in place and the
//! others proceed.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;
use tracing::{debug, info, warn};

use basalt_core::bundle::{
    Bundle, BundleEntry, BundleType, EntryRequest, EntryResponse,
};
use basalt_core::{IssueType, OperationOutcome};

use crate::error::ServiceError;
use crate::response::FhirResponse;
use crate::service::{FhirService, RequestHeaders};

/// Cycles the write phase retries before declaring a placeholder
/// unresolvable. Bounds chains of urn:uuid references between entries.
const MAX_RESOLUTION_CYCLES: usize = 4;

struct ParsedEntry {
    index: usize,
    full_url: Option<String>,
    method: String,
    url: String,
    headers: RequestHeaders,
    resource: Option<Value>,
}

pub struct TransactionCoordinator {
    service: Arc<FhirService>,
    in_flight: Arc<AtomicUsize>,
    max_concurrent: usize,
}

/// Decrements the admission counter when a bundle finishes, including on
/// early returns.
struct AdmissionGuard(Arc<AtomicUsize>);

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TransactionCoordinator {
    pub fn new(service: Arc<FhirService>) -> Self {
        let max_concurrent = service.config().max_concurrent_bundles;
        Self {
            service,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_concurrent,
        }
    }

    /// Processes a batch or transaction bundle and returns the matching
    /// response bundle.
    pub async fn process(&self, bundle: Value) -> FhirResponse {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) >= self.max_concurrent {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            warn!("bundle rejected, concurrency cap reached");
            return (&ServiceError::Busy).into();
        }
        let _guard = AdmissionGuard(self.in_flight.clone());

        let response_type = match bundle.get("type").and_then(Value::as_str) {
            Some("batch") => BundleType::BatchResponse,
            Some("transaction") => BundleType::TransactionResponse,
            other => {
                return (&ServiceError::malformed(format!(
                    "bundle type must be batch or transaction, got {other:?}"
                )))
                    .into();
            }
        };
        if bundle.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
            return (&ServiceError::malformed("request body must be a Bundle")).into();
        }

        let raw_entries = bundle
            .get("entry")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total = raw_entries.len();

        let mut responses: Vec<Option<BundleEntry>> = vec![None; total];
        let mut entries = Vec::new();
        for (index, raw) in raw_entries.iter().enumerate() {
            match parse_entry(index, raw) {
                Ok(entry) => entries.push(entry),
                Err(err) => responses[index] = Some(error_entry(&err)),
            }
        }

        self.run_phases(entries, &mut responses).await;

        let mut out = Bundle::new(response_type);
        for slot in responses {
            // An entry no phase claimed is finalized here.
            out.entry.push(slot.unwrap_or_else(|| {
                error_entry(&ServiceError::not_supported("bundle entry was not processed"))
            }));
        }
        info!(entries = total, kind = ?response_type, "bundle processed");
        FhirResponse::ok(out.to_resource())
    }

    async fn run_phases(
        &self,
        entries: Vec<ParsedEntry>,
        responses: &mut Vec<Option<BundleEntry>>,
    ) {
        let mut deletes = Vec::new();
        let mut writes = Vec::new();
        let mut reads = Vec::new();
        for entry in entries {
            match entry.method.as_str() {
                "DELETE" => deletes.push(entry),
                "POST" | "PUT" => writes.push(entry),
                "GET" => reads.push(entry),
                other => {
                    responses[entry.index] = Some(error_entry(&ServiceError::not_supported(
                        format!("bundle entry method {other}"),
                    )));
                }
            }
        }

        for entry in &deletes {
            let response = self.execute(entry, None).await;
            responses[entry.index] = Some(bundle_entry(&response));
        }

        // Writes retry across cycles until their placeholder references
        // resolve against already-created entries.
        let mut placeholders: Vec<(String, String)> = Vec::new();
        let mut pending = writes;
        for _ in 0..MAX_RESOLUTION_CYCLES {
            if pending.is_empty() {
                break;
            }
            let mut deferred = Vec::new();
            let mut progressed = false;
            for entry in pending {
                let resource = match entry.resource.as_ref() {
                    Some(body) => match substitute(body, &placeholders) {
                        Some(body) => Some(body),
                        None => {
                            debug!(index = entry.index, "deferring entry, unresolved reference");
                            deferred.push(entry);
                            continue;
                        }
                    },
                    None => None,
                };
                let response = self.execute(&entry, resource).await;
                if let (Some(full_url), Some(location)) = (&entry.full_url, &response.location)
                    && full_url.starts_with("urn:uuid:")
                    && let Some(reference) = reference_of(location)
                {
                    placeholders.push((full_url.clone(), reference));
                }
                responses[entry.index] = Some(bundle_entry(&response));
                progressed = true;
            }
            pending = deferred;
            if !progressed {
                break;
            }
        }
        for entry in pending {
            responses[entry.index] = Some(error_entry(&ServiceError::malformed(
                "entry references an unresolved urn:uuid placeholder",
            )));
        }

        for entry in &reads {
            let response = self.execute(entry, None).await;
            responses[entry.index] = Some(bundle_entry(&response));
        }
    }

    async fn execute(&self, entry: &ParsedEntry, resource: Option<Value>) -> FhirResponse {
        let body = resource.or_else(|| entry.resource.clone());
        self.service
            .handle(&entry.method, &entry.url, body, &entry.headers)
            .await
    }
}

fn parse_entry(index: usize, raw: &Value) -> Result<ParsedEntry, ServiceError> {
    let request = raw
        .get("request")
        .ok_or_else(|| ServiceError::malformed("entry is missing request"))?;
    let request: EntryRequest = serde_json::from_value(request.clone())
        .map_err(|err| ServiceError::malformed(format!("malformed entry request: {err}")))?;
    Ok(ParsedEntry {
        index,
        full_url: raw
            .get("fullUrl")
            .and_then(Value::as_str)
            .map(str::to_string),
        method: request.method.to_ascii_uppercase(),
        url: request.url,
        headers: RequestHeaders {
            if_match: request.if_match,
            if_none_exist: request.if_none_exist,
            if_modified_since: None,
        },
        resource: raw.get("resource").cloned(),
    })
}

/// Rewrites every known placeholder in the serialized body. Longer
/// placeholders go first so one that prefixes another never clips it.
/// Returns None when an unknown `urn:uuid:` remains, so the caller can
/// retry the entry in a later cycle.
fn substitute(body: &Value, placeholders: &[(String, String)]) -> Option<Value> {
    let mut ordered: Vec<&(String, String)> = placeholders.iter().collect();
    ordered.sort_by_key(|(placeholder, _)| std::cmp::Reverse(placeholder.len()));
    let mut text = body.to_string();
    for (placeholder, reference) in ordered {
        if text.contains(placeholder.as_str()) {
            text = text.replace(placeholder.as_str(), reference);
        }
    }
    if text.contains("urn:uuid:") {
        return None;
    }
    serde_json::from_str(&text).ok()
}

/// `Patient/p1/_history/1` identifies `Patient/p1`.
fn reference_of(location: &str) -> Option<String> {
    let mut segments = location.split('/');
    let resource_type = segments.next()?;
    let id = segments.next()?;
    Some(format!("{resource_type}/{id}"))
}

fn status_line(status: u16) -> String {
    let reason = match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        304 => "Not Modified",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        410 => "Gone",
        412 => "Precondition Failed",
        429 => "Too Many Requests",
        _ => return status.to_string(),
    };
    format!("{status} {reason}")
}

/// A successful entry carries the resource it read or wrote alongside
/// the response; a failed one carries the OperationOutcome inside the
/// response instead.
fn bundle_entry(response: &FhirResponse) -> BundleEntry {
    let (resource, outcome) = if response.is_success() {
        (response.body.clone(), None)
    } else {
        (None, response.body.clone())
    };
    BundleEntry {
        resource,
        response: Some(EntryResponse {
            status: status_line(response.status),
            location: response.location.clone(),
            etag: response.etag.clone(),
            last_modified: response.last_modified.clone(),
            outcome,
        }),
        ..Default::default()
    }
}

fn error_entry(err: &ServiceError) -> BundleEntry {
    let code = match err.http_status() {
        400 => IssueType::Invalid,
        _ => IssueType::Exception,
    };
    BundleEntry {
        response: Some(EntryResponse {
            status: status_line(err.http_status()),
            location: None,
            etag: None,
            last_modified: None,
            outcome: Some(OperationOutcome::error(code, err.to_string()).to_resource()),
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use serde_json::json;

    fn coordinator() -> TransactionCoordinator {
        TransactionCoordinator::new(Arc::new(FhirService::new(ServiceConfig {
            base_url: "http://localhost/fhir".to_string(),
            ..ServiceConfig::default()
        })))
    }

    fn post(resource: Value) -> Value {
        json!({
            "request": {"method": "POST", "url": resource["resourceType"]},
            "resource": resource,
        })
    }

    #[tokio::test]
    async fn test_transaction_creates_and_reads() {
        let coord = coordinator();
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                post(json!({"resourceType": "Patient", "name": [{"family": "Doe"}]})),
            ],
        });
        let resp = coord.process(bundle).await;
        assert_eq!(resp.status, 200);
        let body = resp.body.unwrap();
        assert_eq!(body["type"], "transaction-response");
        assert_eq!(body["entry"][0]["response"]["status"], "201 Created");
        assert!(body["entry"][0]["response"]["location"]
            .as_str()
            .unwrap()
            .starts_with("Patient/"));
    }

    #[tokio::test]
    async fn test_forward_reference_resolves_regardless_of_order() {
        let coord = coordinator();
        // The referencing entry comes before the referenced one.
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {
                    "fullUrl": "urn:uuid:pat-1",
                    "request": {"method": "POST", "url": "Patient"},
                    "resource": {
                        "resourceType": "Patient",
                        "managingOrganization": {"reference": "urn:uuid:org-1"},
                    },
                },
                {
                    "fullUrl": "urn:uuid:org-1",
                    "request": {"method": "POST", "url": "Organization"},
                    "resource": {"resourceType": "Organization", "name": "General"},
                },
            ],
        });
        let resp = coord.process(bundle).await;
        let body = resp.body.unwrap();
        assert_eq!(body["entry"][0]["response"]["status"], "201 Created");
        assert_eq!(body["entry"][1]["response"]["status"], "201 Created");

        // The stored patient points at the real organization id.
        let org_location = body["entry"][1]["response"]["location"].as_str().unwrap();
        let org_ref = reference_of(org_location).unwrap();
        let svc = &coord.service;
        let pat_location = body["entry"][0]["response"]["location"].as_str().unwrap();
        let pat_id = pat_location.split('/').nth(1).unwrap();
        let stored = svc.store().read("Patient", pat_id).await.unwrap();
        assert_eq!(
            stored.content["managingOrganization"]["reference"],
            Value::String(org_ref)
        );
    }

    #[tokio::test]
    async fn test_unresolvable_placeholder_fails_that_entry_only() {
        let coord = coordinator();
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {
                    "request": {"method": "POST", "url": "Patient"},
                    "resource": {
                        "resourceType": "Patient",
                        "managingOrganization": {"reference": "urn:uuid:never-created"},
                    },
                },
                post(json!({"resourceType": "Patient", "name": [{"family": "Ok"}]})),
            ],
        });
        let resp = coord.process(bundle).await;
        let body = resp.body.unwrap();
        assert_eq!(body["entry"][0]["response"]["status"], "400 Bad Request");
        assert_eq!(
            body["entry"][0]["response"]["outcome"]["resourceType"],
            "OperationOutcome"
        );
        assert_eq!(body["entry"][1]["response"]["status"], "201 Created");
    }

    #[tokio::test]
    async fn test_deletes_run_before_writes() {
        let coord = coordinator();
        coord
            .service
            .store()
            .create("Patient", json!({"resourceType": "Patient"}), Some("p1"))
            .await
            .unwrap();
        // Document order is create-then-delete; phasing makes the delete
        // run first, so the PUT recreates rather than racing it.
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {
                    "request": {"method": "PUT", "url": "Patient/p1"},
                    "resource": {"resourceType": "Patient", "active": true},
                },
                {"request": {"method": "DELETE", "url": "Patient/p1"}},
            ],
        });
        let resp = coord.process(bundle).await;
        let body = resp.body.unwrap();
        assert_eq!(body["entry"][1]["response"]["status"], "204 No Content");
        assert_eq!(body["entry"][0]["response"]["status"], "200 OK");
        let row = coord.service.store().read("Patient", "p1").await.unwrap();
        assert_eq!(row.content["active"], true);
        // v1 create, v2 delete, v3 recreate.
        assert_eq!(row.version_id, 3);
    }

    #[tokio::test]
    async fn test_entries_carry_the_resource() {
        let coord = coordinator();
        coord
            .service
            .store()
            .create(
                "Patient",
                json!({"resourceType": "Patient", "name": [{"family": "Doe"}]}),
                Some("p1"),
            )
            .await
            .unwrap();
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "batch",
            "entry": [
                {"request": {"method": "GET", "url": "Patient/p1"}},
                post(json!({"resourceType": "Organization", "name": "General"})),
                {"request": {"method": "GET", "url": "Patient/missing"}},
            ],
        });
        let resp = coord.process(bundle).await;
        let body = resp.body.unwrap();

        // The read entry returns the resource it read.
        assert_eq!(body["entry"][0]["response"]["status"], "200 OK");
        assert_eq!(body["entry"][0]["resource"]["resourceType"], "Patient");
        assert_eq!(body["entry"][0]["resource"]["name"][0]["family"], "Doe");

        // The write entry returns what it stored.
        assert_eq!(body["entry"][1]["resource"]["resourceType"], "Organization");

        // A failed entry carries only the outcome.
        assert!(body["entry"][2].get("resource").is_none());
        assert_eq!(
            body["entry"][2]["response"]["outcome"]["resourceType"],
            "OperationOutcome"
        );
    }

    #[test]
    fn test_substitute_prefers_longer_placeholder() {
        let placeholders = vec![
            ("urn:uuid:a".to_string(), "Patient/short".to_string()),
            ("urn:uuid:a2".to_string(), "Patient/long".to_string()),
        ];
        let body = json!({
            "subject": {"reference": "urn:uuid:a2"},
            "performer": {"reference": "urn:uuid:a"},
        });
        let out = substitute(&body, &placeholders).unwrap();
        assert_eq!(out["subject"]["reference"], "Patient/long");
        assert_eq!(out["performer"]["reference"], "Patient/short");
    }

    #[tokio::test]
    async fn test_batch_failure_is_isolated() {
        let coord = coordinator();
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "batch",
            "entry": [
                {"request": {"method": "GET", "url": "Patient/missing"}},
                post(json!({"resourceType": "Patient"})),
            ],
        });
        let resp = coord.process(bundle).await;
        let body = resp.body.unwrap();
        assert_eq!(body["type"], "batch-response");
        assert_eq!(body["entry"][0]["response"]["status"], "404 Not Found");
        assert_eq!(body["entry"][1]["response"]["status"], "201 Created");
    }

    #[tokio::test]
    async fn test_entry_without_request_is_rejected_in_place() {
        let coord = coordinator();
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "batch",
            "entry": [
                {"resource": {"resourceType": "Patient"}},
                post(json!({"resourceType": "Patient"})),
            ],
        });
        let resp = coord.process(bundle).await;
        let body = resp.body.unwrap();
        assert_eq!(body["entry"][0]["response"]["status"], "400 Bad Request");
        assert_eq!(body["entry"][1]["response"]["status"], "201 Created");
    }

    #[tokio::test]
    async fn test_non_bundle_body_rejected() {
        let coord = coordinator();
        let resp = coord
            .process(json!({"resourceType": "Patient", "type": "transaction"}))
            .await;
        assert_eq!(resp.status, 400);

        let resp = coord
            .process(json!({"resourceType": "Bundle", "type": "searchset"}))
            .await;
        assert_eq!(resp.status, 400);
    }

    #[tokio::test]
    async fn test_admission_cap() {
        let coord = coordinator();
        let cap = coord.max_concurrent;
        coord.in_flight.store(cap, Ordering::SeqCst);
        let resp = coord
            .process(json!({"resourceType": "Bundle", "type": "batch"}))
            .await;
        assert_eq!(resp.status, 429);
        // The rejected bundle must not leak a slot.
        assert_eq!(coord.in_flight.load(Ordering::SeqCst), cap);
        coord.in_flight.store(0, Ordering::SeqCst);
        let resp = coord
            .process(json!({"resourceType": "Bundle", "type": "batch"}))
            .await;
        assert_eq!(resp.status, 200);
        assert_eq!(coord.in_flight.load(Ordering::SeqCst), 0);
    }
}
