//! Bundle container types.
//!
//! A Bundle is the response aggregate for search, history and
//! batch/transaction processing. It is ephemeral: assembled per request,
//! never persisted (pages beyond the first live only in the page cache).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BundleType {
    Searchset,
    History,
    Batch,
    BatchResponse,
    Transaction,
    TransactionResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchEntryMode {
    Match,
    Include,
    Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryRequest {
    pub method: String,
    pub url: String,
    #[serde(rename = "ifMatch", skip_serializing_if = "Option::is_none")]
    pub if_match: Option<String>,
    #[serde(rename = "ifNoneExist", skip_serializing_if = "Option::is_none")]
    pub if_none_exist: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(rename = "lastModified", skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleEntry {
    #[serde(rename = "fullUrl", skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<EntrySearch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<EntryRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<EntryResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySearch {
    pub mode: SearchEntryMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleLink {
    pub relation: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    #[serde(rename = "type")]
    pub bundle_type: BundleType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub link: Vec<BundleLink>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub entry: Vec<BundleEntry>,
}

impl Bundle {
    pub fn new(bundle_type: BundleType) -> Self {
        Self {
            resource_type: "Bundle".to_string(),
            bundle_type,
            total: None,
            link: Vec::new(),
            entry: Vec::new(),
        }
    }

    pub fn with_total(mut self, total: usize) -> Self {
        self.total = Some(total);
        self
    }

    pub fn add_link(&mut self, relation: impl Into<String>, url: impl Into<String>) {
        self.link.push(BundleLink {
            relation: relation.into(),
            url: url.into(),
        });
    }

    /// A matched resource entry in a searchset.
    pub fn add_match(&mut self, full_url: impl Into<String>, resource: Value) {
        self.entry.push(BundleEntry {
            full_url: Some(full_url.into()),
            resource: Some(resource),
            search: Some(EntrySearch {
                mode: SearchEntryMode::Match,
            }),
            request: None,
            response: None,
        });
    }

    /// An included resource entry in a searchset.
    pub fn add_include(&mut self, full_url: impl Into<String>, resource: Value) {
        self.entry.push(BundleEntry {
            full_url: Some(full_url.into()),
            resource: Some(resource),
            search: Some(EntrySearch {
                mode: SearchEntryMode::Include,
            }),
            request: None,
            response: None,
        });
    }

    /// A synthesized OperationOutcome entry (search parameter diagnostics).
    pub fn add_outcome(&mut self, outcome: Value) {
        self.entry.push(BundleEntry {
            full_url: None,
            resource: Some(outcome),
            search: Some(EntrySearch {
                mode: SearchEntryMode::Outcome,
            }),
            request: None,
            response: None,
        });
    }

    pub fn to_resource(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Null)
    }

    pub fn len(&self) -> usize {
        self.entry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_searchset_shape() {
        let mut bundle = Bundle::new(BundleType::Searchset).with_total(1);
        bundle.add_link("self", "http://localhost/fhir/Patient?name=doe");
        bundle.add_match(
            "http://localhost/fhir/Patient/1",
            json!({"resourceType": "Patient", "id": "1"}),
        );

        let value = bundle.to_resource();
        assert_eq!(value["resourceType"], "Bundle");
        assert_eq!(value["type"], "searchset");
        assert_eq!(value["total"], 1);
        assert_eq!(value["link"][0]["relation"], "self");
        assert_eq!(value["entry"][0]["search"]["mode"], "match");
        assert_eq!(value["entry"][0]["resource"]["id"], "1");
    }

    #[test]
    fn test_outcome_entry_mode() {
        let mut bundle = Bundle::new(BundleType::Searchset);
        bundle.add_outcome(json!({"resourceType": "OperationOutcome"}));
        let value = bundle.to_resource();
        assert_eq!(value["entry"][0]["search"]["mode"], "outcome");
        assert!(value["entry"][0].get("fullUrl").is_none());
    }

    #[test]
    fn test_transaction_response_entry_carries_only_response() {
        let mut bundle = Bundle::new(BundleType::TransactionResponse);
        bundle.entry.push(BundleEntry {
            response: Some(EntryResponse {
                status: "201 Created".to_string(),
                location: Some("Patient/1/_history/1".to_string()),
                etag: Some("W/\"1\"".to_string()),
                last_modified: None,
                outcome: None,
            }),
            ..Default::default()
        });
        let value = bundle.to_resource();
        assert_eq!(value["type"], "transaction-response");
        assert_eq!(value["entry"][0]["response"]["status"], "201 Created");
        assert!(value["entry"][0].get("request").is_none());
        assert!(value["entry"][0].get("resource").is_none());
    }

    #[test]
    fn test_bundle_roundtrip() {
        let mut bundle = Bundle::new(BundleType::History).with_total(2);
        bundle.add_match("u", json!({"resourceType": "Patient"}));
        let value = bundle.to_resource();
        let back: Bundle = serde_json::from_value(value).unwrap();
        assert_eq!(back.bundle_type, BundleType::History);
        assert_eq!(back.total, Some(2));
        assert_eq!(back.len(), 1);
    }
}
