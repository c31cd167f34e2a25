//! Metadata extraction driven by the parameter catalog.
//!
//! For every definition applicable to a resource type, the indexer walks
//! the definition's dot paths through the body (flattening arrays at each
//! step) and converts what it finds into typed metadata rows. The store
//! calls this inside its commit critical section, so the index never
//! disagrees with the current version.

use std::sync::Arc;

use serde_json::Value;

use basalt_storage::{MetadataEntry, MetadataIndexer, ParamKind};

use crate::registry::{ParamDef, SearchRegistry};
use crate::types::date;

pub struct RegistryIndexer {
    registry: Arc<SearchRegistry>,
}

impl RegistryIndexer {
    pub fn new(registry: Arc<SearchRegistry>) -> Self {
        Self { registry }
    }
}

impl MetadataIndexer for RegistryIndexer {
    fn generate(&self, resource_type: &str, body: &Value, base_url: &str) -> Vec<MetadataEntry> {
        let mut entries = Vec::new();
        for def in self.registry.params_for_type(resource_type) {
            for path in &def.paths {
                for node in walk(body, path) {
                    extract(&def, node, base_url, &mut entries);
                }
            }
        }
        entries
    }
}

/// Resolves a dot path, flattening arrays after every step.
fn walk<'a>(body: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = flatten(body);
    for segment in path.split('.') {
        let mut next = Vec::new();
        for node in current {
            if let Some(child) = node.get(segment) {
                next.extend(flatten(child));
            }
        }
        current = next;
    }
    current
}

fn flatten(node: &Value) -> Vec<&Value> {
    match node {
        Value::Array(items) => items.iter().flat_map(flatten).collect(),
        other => vec![other],
    }
}

fn extract(def: &ParamDef, node: &Value, base_url: &str, out: &mut Vec<MetadataEntry>) {
    match def.kind {
        ParamKind::String | ParamKind::Uri => {
            if let Some(s) = node.as_str() {
                out.push(MetadataEntry::new(&def.code, def.kind, s));
            }
        }
        ParamKind::Number => {
            if let Some(n) = node.as_f64() {
                out.push(MetadataEntry::new(&def.code, def.kind, trim_float(n)));
            }
        }
        ParamKind::Token | ParamKind::Tag => extract_token(def, node, out),
        ParamKind::Date | ParamKind::Period => extract_date(def, node, out),
        ParamKind::Quantity => {
            if let Some(value) = node.get("value").and_then(Value::as_f64) {
                let mut entry = MetadataEntry::new(&def.code, def.kind, trim_float(value));
                if let Some(system) = node.get("system").and_then(Value::as_str) {
                    entry = entry.with_system(system);
                }
                if let Some(code) = node.get("code").and_then(Value::as_str) {
                    entry = entry.with_code(code);
                }
                out.push(entry);
            }
        }
        ParamKind::Reference => {
            if let Some(reference) = node.get("reference").and_then(Value::as_str) {
                out.push(MetadataEntry::new(
                    &def.code,
                    def.kind,
                    relativize(reference, base_url),
                ));
            }
        }
    }
}

/// Tokens come in several shapes: bare codes, booleans, Codings,
/// Identifiers and CodeableConcepts.
fn extract_token(def: &ParamDef, node: &Value, out: &mut Vec<MetadataEntry>) {
    match node {
        Value::String(s) => out.push(MetadataEntry::new(&def.code, def.kind, s.as_str())),
        Value::Bool(b) => out.push(MetadataEntry::new(&def.code, def.kind, b.to_string())),
        Value::Object(obj) => {
            if let Some(codings) = obj.get("coding").and_then(Value::as_array) {
                // CodeableConcept.
                for coding in codings {
                    push_coding(def, coding, out);
                }
                if let Some(text) = obj.get("text").and_then(Value::as_str) {
                    out.push(
                        MetadataEntry::new(&def.code, def.kind, text).with_code("text"),
                    );
                }
            } else if obj.contains_key("code") {
                // Plain Coding (e.g. Encounter.class, meta.tag items).
                push_coding(def, node, out);
            } else if let Some(value) = obj.get("value").and_then(Value::as_str) {
                // Identifier.
                let mut entry = MetadataEntry::new(&def.code, def.kind, value);
                if let Some(system) = obj.get("system").and_then(Value::as_str) {
                    entry = entry.with_system(system);
                }
                out.push(entry);
            }
        }
        _ => {}
    }
}

fn push_coding(def: &ParamDef, coding: &Value, out: &mut Vec<MetadataEntry>) {
    let Some(code) = coding.get("code").and_then(Value::as_str) else {
        return;
    };
    let mut entry = MetadataEntry::new(&def.code, def.kind, code);
    if let Some(system) = coding.get("system").and_then(Value::as_str) {
        entry = entry.with_system(system);
    }
    out.push(entry);
}

/// Point dates index at their low bound; Periods keep the widened start
/// in `value` and the widened end in `system`, either side possibly open.
fn extract_date(def: &ParamDef, node: &Value, out: &mut Vec<MetadataEntry>) {
    match node {
        Value::String(s) => {
            if let Some(normalized) = date::normalize(s) {
                out.push(MetadataEntry::new(&def.code, ParamKind::Date, normalized));
            }
        }
        Value::Object(obj) => {
            let start = obj
                .get("start")
                .and_then(Value::as_str)
                .and_then(date::normalize);
            let end = obj
                .get("end")
                .and_then(Value::as_str)
                .and_then(|e| date::widen(e).map(|(_, high)| high));
            if start.is_none() && end.is_none() {
                return;
            }
            let mut entry = MetadataEntry::new(
                &def.code,
                ParamKind::Period,
                start.unwrap_or_default(),
            );
            entry = entry.with_system(end.unwrap_or_default());
            out.push(entry);
        }
        _ => {}
    }
}

/// Strips the server's own base URL so local absolute references index
/// in relative `Type/id` form.
fn relativize(reference: &str, base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    match reference.strip_prefix(base) {
        Some(rest) => rest.trim_start_matches('/').to_string(),
        None => reference.to_string(),
    }
}

fn trim_float(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BASE: &str = "http://localhost/fhir";

    fn indexer() -> RegistryIndexer {
        RegistryIndexer::new(Arc::new(SearchRegistry::with_defaults()))
    }

    fn entries_for(all: &[MetadataEntry], param: &str) -> Vec<MetadataEntry> {
        all.iter()
            .filter(|e| e.param_name == param)
            .cloned()
            .collect()
    }

    #[test]
    fn test_patient_names_and_birthdate() {
        let body = json!({
            "resourceType": "Patient",
            "name": [
                {"family": "Smith", "given": ["John", "Q"], "text": "John Q Smith"},
                {"family": "Smythe"}
            ],
            "birthDate": "1990-06-15"
        });
        let all = indexer().generate("Patient", &body, BASE);

        let names = entries_for(&all, "name");
        let values: Vec<&str> = names.iter().map(|e| e.value.as_str()).collect();
        assert_eq!(values, vec!["Smith", "Smythe", "John", "Q", "John Q Smith"]);
        assert_eq!(names[0].value_lower, "smith");

        let birth = entries_for(&all, "birthdate");
        assert_eq!(birth.len(), 1);
        assert_eq!(birth[0].value, "19900615000000");
        assert_eq!(birth[0].kind, ParamKind::Date);
    }

    #[test]
    fn test_codeable_concept_and_identifier() {
        let body = json!({
            "resourceType": "Observation",
            "status": "final",
            "code": {
                "coding": [
                    {"system": "http://loinc.org", "code": "8480-6"},
                    {"system": "http://snomed.info/sct", "code": "271649006"}
                ],
                "text": "Systolic blood pressure"
            },
            "identifier": [{"system": "urn:acme", "value": "OBS-1"}]
        });
        let all = indexer().generate("Observation", &body, BASE);

        let codes = entries_for(&all, "code");
        assert_eq!(codes.len(), 3);
        assert_eq!(codes[0].value, "8480-6");
        assert_eq!(codes[0].system.as_deref(), Some("http://loinc.org"));
        assert_eq!(codes[2].value, "Systolic blood pressure");
        assert_eq!(codes[2].code.as_deref(), Some("text"));

        let status = entries_for(&all, "status");
        assert_eq!(status[0].value, "final");

        let identifier = entries_for(&all, "identifier");
        assert_eq!(identifier[0].value, "OBS-1");
        assert_eq!(identifier[0].system.as_deref(), Some("urn:acme"));
    }

    #[test]
    fn test_period_widens_start_and_end() {
        let body = json!({
            "resourceType": "Observation",
            "effectivePeriod": {"start": "2020-02", "end": "2020-04"}
        });
        let all = indexer().generate("Observation", &body, BASE);
        let dates = entries_for(&all, "date");
        assert_eq!(dates.len(), 1);
        assert_eq!(dates[0].kind, ParamKind::Period);
        assert_eq!(dates[0].value, "20200201000000");
        assert_eq!(dates[0].system.as_deref(), Some("20200430235959"));
    }

    #[test]
    fn test_open_ended_period() {
        let body = json!({
            "resourceType": "Encounter",
            "period": {"start": "2020-01-01"}
        });
        let all = indexer().generate("Encounter", &body, BASE);
        let dates = entries_for(&all, "date");
        assert_eq!(dates[0].value, "20200101000000");
        assert_eq!(dates[0].system.as_deref(), Some(""));
    }

    #[test]
    fn test_references_relativized() {
        let body = json!({
            "resourceType": "Observation",
            "subject": {"reference": format!("{BASE}/Patient/p1")},
            "encounter": {"reference": "Encounter/e1"}
        });
        let all = indexer().generate("Observation", &body, BASE);
        assert_eq!(entries_for(&all, "subject")[0].value, "Patient/p1");
        assert_eq!(entries_for(&all, "encounter")[0].value, "Encounter/e1");
        // "patient" shares the subject path.
        assert_eq!(entries_for(&all, "patient")[0].value, "Patient/p1");
    }

    #[test]
    fn test_quantity_value_and_unit() {
        let body = json!({
            "resourceType": "Observation",
            "valueQuantity": {"value": 120.5, "system": "http://unitsofmeasure.org", "code": "mm[Hg]"}
        });
        let all = indexer().generate("Observation", &body, BASE);
        let qty = entries_for(&all, "value-quantity");
        assert_eq!(qty[0].value, "120.5");
        assert_eq!(qty[0].code.as_deref(), Some("mm[Hg]"));
    }

    #[test]
    fn test_global_params_tag_and_profile() {
        let body = json!({
            "resourceType": "Patient",
            "meta": {
                "tag": [{"system": "http://example.org/tags", "code": "vip"}],
                "profile": ["http://hl7.org/fhir/StructureDefinition/Patient"]
            }
        });
        let all = indexer().generate("Patient", &body, BASE);
        let tags = entries_for(&all, "_tag");
        assert_eq!(tags[0].value, "vip");
        assert_eq!(tags[0].kind, ParamKind::Tag);

        let profiles = entries_for(&all, "_profile");
        assert_eq!(profiles[0].value, "http://hl7.org/fhir/StructureDefinition/Patient");
        assert_eq!(profiles[0].kind, ParamKind::Uri);
    }

    #[test]
    fn test_boolean_token() {
        let body = json!({"resourceType": "Patient", "active": true});
        let all = indexer().generate("Patient", &body, BASE);
        assert_eq!(entries_for(&all, "active")[0].value, "true");
    }

    #[test]
    fn test_absent_fields_produce_nothing() {
        let body = json!({"resourceType": "Patient"});
        let all = indexer().generate("Patient", &body, BASE);
        assert!(entries_for(&all, "name").is_empty());
        assert!(entries_for(&all, "birthdate").is_empty());
    }
}
