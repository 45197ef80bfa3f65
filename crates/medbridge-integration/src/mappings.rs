//! HL7 v2.5 → FHIR R4 映射表
//!
//! 结果状态（OBX-11）、结果解释（OBX-8）、编码系统（OBX-3.3）以及固定的 FHIR 系统 URI。

use medbridge_core::ObservationStatus;

/// 固定的 FHIR 系统 URI
pub mod fhir_systems {
    pub const OBSERVATION_CATEGORY: &str =
        "http://terminology.hl7.org/CodeSystem/observation-category";
    pub const INTERPRETATION: &str =
        "http://terminology.hl7.org/CodeSystem/v3-ObservationInterpretation";
    pub const UNITS_OF_MEASURE: &str = "http://unitsofmeasure.org";
    pub const V2_CODES: &str = "http://terminology.hl7.org/CodeSystem/v2-0396";
    pub const LOINC: &str = "http://loinc.org";
    pub const SNOMED_CT: &str = "http://snomed.info/sct";
    pub const ICD_10: &str = "http://hl7.org/fhir/sid/icd-10";
}

/// OBX-11 结果状态 → Observation.status
pub fn map_result_status(code: &str) -> Option<ObservationStatus> {
    match code {
        "F" => Some(ObservationStatus::Final),
        "P" => Some(ObservationStatus::Preliminary),
        "C" => Some(ObservationStatus::Corrected),
        "A" => Some(ObservationStatus::Amended),
        "X" => Some(ObservationStatus::Cancelled),
        _ => None,
    }
}

/// OBX-8 结果解释 → (code, display)
pub fn map_interpretation(code: &str) -> Option<(&'static str, &'static str)> {
    let mapped = match code {
        "N" => ("N", "Normal"),
        "H" => ("H", "High"),
        "L" => ("L", "Low"),
        "HH" => ("HH", "Critical high"),
        "LL" => ("LL", "Critical low"),
        "A" => ("A", "Abnormal"),
        "AA" => ("AA", "Critical abnormal"),
        "U" => ("U", "Significant change up"),
        "D" => ("D", "Significant change down"),
        _ => return None,
    };
    Some(mapped)
}

/// OBX-3.3 编码系统别名 → Coding.system
pub fn map_coding_system(name: &str) -> Option<&'static str> {
    match name {
        "LOINC" | "LN" => Some(fhir_systems::LOINC),
        "SNOMED" | "SNOMED CT" | "SCT" => Some(fhir_systems::SNOMED_CT),
        "ICD10" | "ICD-10" => Some(fhir_systems::ICD_10),
        _ => None,
    }
}

/// 未知或缺失的编码系统退回到 v2 通用代码表
pub fn coding_system_or_default(name: Option<&str>) -> &'static str {
    name.and_then(map_coding_system).unwrap_or(fhir_systems::V2_CODES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_table() {
        assert_eq!(map_result_status("F"), Some(ObservationStatus::Final));
        assert_eq!(map_result_status("X"), Some(ObservationStatus::Cancelled));
        assert_eq!(map_result_status("Z"), None);
    }

    #[test]
    fn test_interpretation_table() {
        assert_eq!(map_interpretation("HH"), Some(("HH", "Critical high")));
        assert_eq!(map_interpretation("D"), Some(("D", "Significant change down")));
        assert_eq!(map_interpretation("n"), None);
    }

    #[test]
    fn test_coding_system_aliases() {
        assert_eq!(map_coding_system("LN"), Some("http://loinc.org"));
        assert_eq!(map_coding_system("SNOMED CT"), Some("http://snomed.info/sct"));
        assert_eq!(map_coding_system("ICD-10"), Some("http://hl7.org/fhir/sid/icd-10"));
        assert_eq!(coding_system_or_default(Some("LOCAL")), fhir_systems::V2_CODES);
        assert_eq!(coding_system_or_default(None), fhir_systems::V2_CODES);
    }
}
