//! Search parameter definitions and their per-type catalog.
//!
//! Definitions serve two consumers: the compiler resolves query parameter
//! names through them, and the indexer walks their extraction paths to
//! produce metadata rows. The built-in catalog covers the core clinical
//! types; unknown resource types still get the global parameters.

use std::sync::Arc;

use indexmap::IndexMap;

use basalt_storage::ParamKind;

/// One search parameter definition.
#[derive(Debug, Clone)]
pub struct ParamDef {
    pub code: String,
    pub kind: ParamKind,
    /// Dot paths into the resource body the indexer extracts from.
    /// Arrays are flattened at every step.
    pub paths: Vec<String>,
    /// Resource types a reference parameter may point at.
    pub targets: Vec<String>,
}

impl ParamDef {
    pub fn new(code: impl Into<String>, kind: ParamKind, paths: &[&str]) -> Self {
        Self {
            code: code.into(),
            kind,
            paths: paths.iter().map(|p| p.to_string()).collect(),
            targets: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_targets(mut self, targets: &[&str]) -> Self {
        self.targets = targets.iter().map(|t| t.to_string()).collect();
        self
    }

    /// The single declared target, if there is exactly one. Unprefixed
    /// reference values resolve through this.
    pub fn sole_target(&self) -> Option<&str> {
        match self.targets.as_slice() {
            [one] => Some(one.as_str()),
            _ => None,
        }
    }
}

/// Catalog of parameter definitions per resource type plus the globals.
#[derive(Debug, Default)]
pub struct SearchRegistry {
    by_type: IndexMap<String, IndexMap<String, Arc<ParamDef>>>,
    global: IndexMap<String, Arc<ParamDef>>,
}

impl SearchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, resource_type: &str, def: ParamDef) {
        self.by_type
            .entry(resource_type.to_string())
            .or_default()
            .insert(def.code.clone(), Arc::new(def));
    }

    pub fn register_global(&mut self, def: ParamDef) {
        self.global.insert(def.code.clone(), Arc::new(def));
    }

    /// Resolves a parameter name for a search scope. With no resource type
    /// the declared `_type` list is tried first, then the globals.
    pub fn resolve(
        &self,
        resource_type: Option<&str>,
        declared_types: &[String],
        code: &str,
    ) -> Option<Arc<ParamDef>> {
        match resource_type {
            Some(rt) => {
                if let Some(def) = self.by_type.get(rt).and_then(|m| m.get(code)) {
                    return Some(def.clone());
                }
            }
            None => {
                for rt in declared_types {
                    if let Some(def) = self.by_type.get(rt.as_str()).and_then(|m| m.get(code)) {
                        return Some(def.clone());
                    }
                }
            }
        }
        self.global.get(code).cloned()
    }

    /// All definitions applicable to a type, globals included.
    pub fn params_for_type(&self, resource_type: &str) -> Vec<Arc<ParamDef>> {
        let mut defs: Vec<_> = self.global.values().cloned().collect();
        if let Some(specific) = self.by_type.get(resource_type) {
            defs.extend(specific.values().cloned());
        }
        defs
    }

    /// Reference-kind definitions of a type, for `_include=Type:*`.
    pub fn reference_params_for_type(&self, resource_type: &str) -> Vec<Arc<ParamDef>> {
        self.params_for_type(resource_type)
            .into_iter()
            .filter(|d| d.kind == ParamKind::Reference)
            .collect()
    }

    pub fn known_type(&self, resource_type: &str) -> bool {
        self.by_type.contains_key(resource_type)
    }

    /// The built-in catalog for the core clinical resource types.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();

        r.register_global(ParamDef::new("_id", ParamKind::Token, &[]));
        r.register_global(ParamDef::new("_lastUpdated", ParamKind::Date, &[]));
        r.register_global(ParamDef::new("_tag", ParamKind::Tag, &["meta.tag"]));
        r.register_global(ParamDef::new("_profile", ParamKind::Uri, &["meta.profile"]));
        r.register_global(ParamDef::new("_security", ParamKind::Token, &["meta.security"]));

        // Patient
        r.register(
            "Patient",
            ParamDef::new(
                "name",
                ParamKind::String,
                &["name.family", "name.given", "name.text"],
            ),
        );
        r.register("Patient", ParamDef::new("family", ParamKind::String, &["name.family"]));
        r.register("Patient", ParamDef::new("given", ParamKind::String, &["name.given"]));
        r.register("Patient", ParamDef::new("identifier", ParamKind::Token, &["identifier"]));
        r.register("Patient", ParamDef::new("birthdate", ParamKind::Date, &["birthDate"]));
        r.register("Patient", ParamDef::new("gender", ParamKind::Token, &["gender"]));
        r.register("Patient", ParamDef::new("active", ParamKind::Token, &["active"]));
        r.register(
            "Patient",
            ParamDef::new("address-city", ParamKind::String, &["address.city"]),
        );
        r.register(
            "Patient",
            ParamDef::new("organization", ParamKind::Reference, &["managingOrganization"])
                .with_targets(&["Organization"]),
        );
        r.register(
            "Patient",
            ParamDef::new("general-practitioner", ParamKind::Reference, &["generalPractitioner"])
                .with_targets(&["Practitioner", "Organization"]),
        );

        // Observation
        r.register("Observation", ParamDef::new("code", ParamKind::Token, &["code"]));
        r.register("Observation", ParamDef::new("status", ParamKind::Token, &["status"]));
        r.register("Observation", ParamDef::new("category", ParamKind::Token, &["category"]));
        r.register(
            "Observation",
            ParamDef::new("identifier", ParamKind::Token, &["identifier"]),
        );
        r.register(
            "Observation",
            ParamDef::new("date", ParamKind::Date, &["effectiveDateTime", "effectivePeriod"]),
        );
        r.register(
            "Observation",
            ParamDef::new("value-quantity", ParamKind::Quantity, &["valueQuantity"]),
        );
        r.register(
            "Observation",
            ParamDef::new("subject", ParamKind::Reference, &["subject"])
                .with_targets(&["Patient", "Group", "Device", "Location"]),
        );
        r.register(
            "Observation",
            ParamDef::new("patient", ParamKind::Reference, &["subject"])
                .with_targets(&["Patient"]),
        );
        r.register(
            "Observation",
            ParamDef::new("encounter", ParamKind::Reference, &["encounter"])
                .with_targets(&["Encounter"]),
        );
        r.register(
            "Observation",
            ParamDef::new("performer", ParamKind::Reference, &["performer"])
                .with_targets(&["Practitioner", "Organization", "Patient"]),
        );

        // Encounter
        r.register("Encounter", ParamDef::new("status", ParamKind::Token, &["status"]));
        r.register("Encounter", ParamDef::new("class", ParamKind::Token, &["class"]));
        r.register(
            "Encounter",
            ParamDef::new("identifier", ParamKind::Token, &["identifier"]),
        );
        r.register(
            "Encounter",
            ParamDef::new("date", ParamKind::Date, &["period"]),
        );
        r.register(
            "Encounter",
            ParamDef::new("subject", ParamKind::Reference, &["subject"])
                .with_targets(&["Patient", "Group"]),
        );
        r.register(
            "Encounter",
            ParamDef::new("patient", ParamKind::Reference, &["subject"])
                .with_targets(&["Patient"]),
        );
        r.register(
            "Encounter",
            ParamDef::new("service-provider", ParamKind::Reference, &["serviceProvider"])
                .with_targets(&["Organization"]),
        );

        // Condition
        r.register("Condition", ParamDef::new("code", ParamKind::Token, &["code"]));
        r.register(
            "Condition",
            ParamDef::new("clinical-status", ParamKind::Token, &["clinicalStatus"]),
        );
        r.register(
            "Condition",
            ParamDef::new("onset-date", ParamKind::Date, &["onsetDateTime", "onsetPeriod"]),
        );
        r.register(
            "Condition",
            ParamDef::new("subject", ParamKind::Reference, &["subject"])
                .with_targets(&["Patient", "Group"]),
        );
        r.register(
            "Condition",
            ParamDef::new("patient", ParamKind::Reference, &["subject"])
                .with_targets(&["Patient"]),
        );
        r.register(
            "Condition",
            ParamDef::new("encounter", ParamKind::Reference, &["encounter"])
                .with_targets(&["Encounter"]),
        );

        // Organization
        r.register("Organization", ParamDef::new("name", ParamKind::String, &["name"]));
        r.register(
            "Organization",
            ParamDef::new("identifier", ParamKind::Token, &["identifier"]),
        );
        r.register("Organization", ParamDef::new("active", ParamKind::Token, &["active"]));
        r.register(
            "Organization",
            ParamDef::new("partof", ParamKind::Reference, &["partOf"])
                .with_targets(&["Organization"]),
        );

        // Practitioner
        r.register(
            "Practitioner",
            ParamDef::new(
                "name",
                ParamKind::String,
                &["name.family", "name.given", "name.text"],
            ),
        );
        r.register(
            "Practitioner",
            ParamDef::new("identifier", ParamKind::Token, &["identifier"]),
        );

        // MedicationRequest
        r.register(
            "MedicationRequest",
            ParamDef::new("status", ParamKind::Token, &["status"]),
        );
        r.register(
            "MedicationRequest",
            ParamDef::new("intent", ParamKind::Token, &["intent"]),
        );
        r.register(
            "MedicationRequest",
            ParamDef::new("authoredon", ParamKind::Date, &["authoredOn"]),
        );
        r.register(
            "MedicationRequest",
            ParamDef::new("subject", ParamKind::Reference, &["subject"])
                .with_targets(&["Patient", "Group"]),
        );
        r.register(
            "MedicationRequest",
            ParamDef::new("patient", ParamKind::Reference, &["subject"])
                .with_targets(&["Patient"]),
        );
        r.register(
            "MedicationRequest",
            ParamDef::new("requester", ParamKind::Reference, &["requester"])
                .with_targets(&["Practitioner", "Organization"]),
        );

        // DiagnosticReport
        r.register(
            "DiagnosticReport",
            ParamDef::new("code", ParamKind::Token, &["code"]),
        );
        r.register(
            "DiagnosticReport",
            ParamDef::new("status", ParamKind::Token, &["status"]),
        );
        r.register(
            "DiagnosticReport",
            ParamDef::new("date", ParamKind::Date, &["effectiveDateTime", "effectivePeriod"]),
        );
        r.register(
            "DiagnosticReport",
            ParamDef::new("issued", ParamKind::Date, &["issued"]),
        );
        r.register(
            "DiagnosticReport",
            ParamDef::new("subject", ParamKind::Reference, &["subject"])
                .with_targets(&["Patient", "Group"]),
        );
        r.register(
            "DiagnosticReport",
            ParamDef::new("patient", ParamKind::Reference, &["subject"])
                .with_targets(&["Patient"]),
        );
        r.register(
            "DiagnosticReport",
            ParamDef::new("result", ParamKind::Reference, &["result"])
                .with_targets(&["Observation"]),
        );

        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_type_specific_then_global() {
        let registry = SearchRegistry::with_defaults();

        let name = registry.resolve(Some("Patient"), &[], "name").unwrap();
        assert_eq!(name.kind, ParamKind::String);

        // Globals resolve for any type.
        let id = registry.resolve(Some("Patient"), &[], "_id").unwrap();
        assert_eq!(id.kind, ParamKind::Token);
        assert!(registry.resolve(Some("Observation"), &[], "_lastUpdated").is_some());

        // Unknown stays unknown.
        assert!(registry.resolve(Some("Patient"), &[], "frobnicate").is_none());
    }

    #[test]
    fn test_resolve_cross_type_uses_declared_types() {
        let registry = SearchRegistry::with_defaults();

        let declared = vec!["Observation".to_string(), "Condition".to_string()];
        let code = registry.resolve(None, &declared, "code").unwrap();
        assert_eq!(code.kind, ParamKind::Token);

        // Without declared types only globals resolve.
        assert!(registry.resolve(None, &[], "code").is_none());
        assert!(registry.resolve(None, &[], "_tag").is_some());
    }

    #[test]
    fn test_sole_target() {
        let registry = SearchRegistry::with_defaults();
        let patient = registry.resolve(Some("Observation"), &[], "patient").unwrap();
        assert_eq!(patient.sole_target(), Some("Patient"));

        let subject = registry.resolve(Some("Observation"), &[], "subject").unwrap();
        assert_eq!(subject.sole_target(), None);
    }

    #[test]
    fn test_reference_params_for_wildcard_include() {
        let registry = SearchRegistry::with_defaults();
        let refs = registry.reference_params_for_type("Observation");
        let codes: Vec<&str> = refs.iter().map(|d| d.code.as_str()).collect();
        assert!(codes.contains(&"subject"));
        assert!(codes.contains(&"encounter"));
        assert!(!codes.contains(&"code"));
    }
}
