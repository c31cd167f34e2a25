//! URI parameter matching: exact and case-sensitive.

pub fn matches(stored: &str, query: &str) -> bool {
    stored == query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_case_sensitive() {
        assert!(matches(
            "http://hl7.org/fhir/StructureDefinition/bmi",
            "http://hl7.org/fhir/StructureDefinition/bmi"
        ));
        assert!(!matches(
            "http://hl7.org/fhir/StructureDefinition/bmi",
            "http://hl7.org/fhir/StructureDefinition/BMI"
        ));
        assert!(!matches(
            "http://hl7.org/fhir/StructureDefinition/bmi",
            "http://hl7.org/fhir/StructureDefinition"
        ));
    }
}
