//! HL7接口模块
//!
//! 将 HL7 v2.5 ORU^R01（观察结果）报文转换为 FHIR R4 Observation。
//!
//! 已知限制：
//! - 只支持 ORU^R01
//! - 每条报文只处理一个 OBX（同名段重复时保留最后一个）
//! - 不支持层级观察，只支持数值结果

use crate::convert::{parse_hl7_datetime, parse_number, parse_reference_range};
use crate::mappings::{self, fhir_systems};
use medbridge_core::utils::iso_now;
use medbridge_core::{
    CodeableConcept, Coding, ComponentLogger, FhirObservation, LoggerRegistry, MedbridgeError,
    ObservationReferenceRange, ObservationStatus, Quantity, Reference, SimpleQuantity,
    OBSERVATION_RESOURCE_TYPE,
};
use std::collections::HashMap;
use thiserror::Error;

pub const SUPPORTED_MESSAGE_TYPE: &str = "ORU^R01";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Hl7Error {
    #[error("HL7 to FHIR transformation failed: {0} segment not found")]
    MissingSegment(&'static str),
    #[error("HL7 to FHIR transformation failed: unsupported message type {0:?}, only ORU^R01 is accepted")]
    UnsupportedMessageType(String),
    #[error("HL7 to FHIR transformation failed: non-numeric observation value {0:?}")]
    NonNumericValue(String),
}

impl From<Hl7Error> for MedbridgeError {
    fn from(err: Hl7Error) -> Self {
        match err {
            Hl7Error::MissingSegment(segment) => MedbridgeError::MissingSegment(segment.to_string()),
            Hl7Error::UnsupportedMessageType(kind) => MedbridgeError::UnsupportedMessageType(kind),
            Hl7Error::NonNumericValue(value) => MedbridgeError::NonNumericValue(value),
        }
    }
}

/// HL7段：字段按 `|` 切分，下标 0 为段名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hl7Segment {
    pub segment_type: String,
    pub fields: Vec<String>,
    component_separator: char,
}

impl Hl7Segment {
    /// 第 index 个字段，空字段视为缺失
    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields
            .get(index)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// 字段内的第 component 个组件（从 0 开始），空组件视为缺失
    pub fn component(&self, index: usize, component: usize) -> Option<&str> {
        self.field(index)?
            .split(self.component_separator)
            .nth(component)
            .filter(|value| !value.is_empty())
    }
}

/// 按段名索引的报文
#[derive(Debug, Clone, Default)]
pub struct Hl7Message {
    segments: HashMap<String, Hl7Segment>,
}

impl Hl7Message {
    pub fn segment(&self, name: &str) -> Option<&Hl7Segment> {
        self.segments.get(name)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// HL7解析器
#[derive(Debug, Clone)]
pub struct Hl7Parser {
    segment_separator: char,
    field_separator: char,
    component_separator: char,
}

impl Default for Hl7Parser {
    fn default() -> Self {
        Self {
            segment_separator: '\r',
            field_separator: '|',
            component_separator: '^',
        }
    }
}

impl Hl7Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析报文：LF 统一转换为段分隔符 CR，同名段只保留最后一个
    pub fn parse(&self, message: &str) -> Hl7Message {
        let normalized = message.replace('\n', &self.segment_separator.to_string());
        let mut segments = HashMap::new();

        for line in normalized.split(self.segment_separator) {
            if line.is_empty() {
                continue;
            }
            let fields: Vec<String> = line
                .split(self.field_separator)
                .map(str::to_string)
                .collect();
            let segment_type = fields[0].clone();
            segments.insert(
                segment_type.clone(),
                Hl7Segment {
                    segment_type,
                    fields,
                    component_separator: self.component_separator,
                },
            );
        }

        Hl7Message { segments }
    }
}

/// HL7 v2 ORU^R01 → FHIR Observation 转换器
#[derive(Debug, Clone)]
pub struct Hl7ToFhirTransformer {
    parser: Hl7Parser,
    logger: ComponentLogger,
}

impl Hl7ToFhirTransformer {
    pub fn new(logging: &LoggerRegistry) -> Self {
        Self {
            parser: Hl7Parser::new(),
            logger: logging.scoped("Hl7ToFhirTransformer"),
        }
    }

    pub fn transform(&self, message: &str) -> Result<FhirObservation, Hl7Error> {
        let parsed = self.parser.parse(message);

        // MSH-9 位于下标 8：下标 1 被编码字符占用
        let msh = parsed.segment("MSH").ok_or(Hl7Error::MissingSegment("MSH"))?;
        let message_type = msh.field(8).unwrap_or_default();
        if message_type != SUPPORTED_MESSAGE_TYPE {
            return Err(Hl7Error::UnsupportedMessageType(message_type.to_string()));
        }

        let obx = parsed.segment("OBX").ok_or(Hl7Error::MissingSegment("OBX"))?;
        let pid = parsed.segment("PID");
        let obr = parsed.segment("OBR");

        let observation = FhirObservation {
            resource_type: OBSERVATION_RESOURCE_TYPE.to_string(),
            id: observation_id(obr, obx),
            status: map_status(obx),
            category: vec![laboratory_category()],
            code: build_code(obx),
            subject: pid.map(|pid| Reference {
                reference: format!("Patient/{}", pid.field(3).unwrap_or_default()),
            }),
            effective_date_time: obx
                .field(14)
                .map(parse_hl7_datetime)
                .unwrap_or_else(iso_now),
            issued: iso_now(),
            value_quantity: build_value(obx)?,
            interpretation: build_interpretation(obx),
            reference_range: build_reference_range(obx),
        };

        self.logger.debug(format!(
            "Transformed {} into Observation {}",
            message_type, observation.id
        ));
        Ok(observation)
    }
}

impl Default for Hl7ToFhirTransformer {
    fn default() -> Self {
        Self::new(&LoggerRegistry::default())
    }
}

/// LAB-{OBR-2}-{OBX-1}
fn observation_id(obr: Option<&Hl7Segment>, obx: &Hl7Segment) -> String {
    let order_number = obr.and_then(|obr| obr.field(2)).unwrap_or("UNKNOWN");
    let observation_id = obx.field(1).unwrap_or("1");
    format!("LAB-{}-{}", order_number, observation_id)
}

fn map_status(obx: &Hl7Segment) -> ObservationStatus {
    obx.field(11)
        .and_then(mappings::map_result_status)
        .unwrap_or(ObservationStatus::Final)
}

fn laboratory_category() -> CodeableConcept {
    CodeableConcept {
        coding: vec![Coding {
            system: fhir_systems::OBSERVATION_CATEGORY.to_string(),
            code: "laboratory".to_string(),
            display: Some("Laboratory".to_string()),
        }],
        text: None,
    }
}

/// OBX-3: code^display^coding_system
fn build_code(obx: &Hl7Segment) -> CodeableConcept {
    let code = obx.component(3, 0).unwrap_or_default();
    let display = obx.component(3, 1).unwrap_or(code);
    let system = mappings::coding_system_or_default(obx.component(3, 2));

    CodeableConcept {
        coding: vec![Coding {
            system: system.to_string(),
            code: code.to_string(),
            display: Some(display.to_string()),
        }],
        text: Some(display.to_string()),
    }
}

/// OBX-5 数值 + OBX-6 单位
fn build_value(obx: &Hl7Segment) -> Result<Quantity, Hl7Error> {
    let raw = obx.field(5).unwrap_or_default();
    let value = parse_number(raw).ok_or_else(|| Hl7Error::NonNumericValue(raw.to_string()))?;
    let unit = obx.field(6);

    Ok(Quantity {
        value,
        unit: unit.map(str::to_string),
        system: unit.map(|_| fhir_systems::UNITS_OF_MEASURE.to_string()),
        code: unit.map(str::to_string),
    })
}

fn build_interpretation(obx: &Hl7Segment) -> Option<Vec<CodeableConcept>> {
    let (code, display) = obx.field(8).and_then(mappings::map_interpretation)?;
    Some(vec![CodeableConcept {
        coding: vec![Coding {
            system: fhir_systems::INTERPRETATION.to_string(),
            code: code.to_string(),
            display: Some(display.to_string()),
        }],
        text: None,
    }])
}

/// OBX-7 参考范围，单位取自 OBX-6
fn build_reference_range(obx: &Hl7Segment) -> Option<Vec<ObservationReferenceRange>> {
    let range = parse_reference_range(obx.field(7)?)?;
    let unit = obx.field(6).unwrap_or_default();
    let bound = |value: f64| SimpleQuantity {
        value,
        unit: unit.to_string(),
    };

    Some(vec![ObservationReferenceRange {
        low: range.low.map(bound),
        high: range.high.map(bound),
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAB_MESSAGE: &str = "MSH|^~\\&|LAB|ExtLab|||20250126||ORU^R01|MSG001|P|2.5\rPID|1||P001||Silva^João||19900101|M\rOBR|1||ORD001|GLU^Glicose\rOBX|1|NM|GLU^Glucose^LOINC||95|mg/dL|70-100|N";

    fn transformer() -> Hl7ToFhirTransformer {
        Hl7ToFhirTransformer::default()
    }

    #[test]
    fn test_parse_segments() {
        let parsed = Hl7Parser::new().parse(LAB_MESSAGE);
        assert_eq!(parsed.len(), 4);

        let obx = parsed.segment("OBX").unwrap();
        assert_eq!(obx.field(5), Some("95"));
        assert_eq!(obx.field(4), None);
        assert_eq!(obx.component(3, 1), Some("Glucose"));
        assert_eq!(obx.component(3, 5), None);

        let msh = parsed.segment("MSH").unwrap();
        assert_eq!(msh.field(8), Some("ORU^R01"));
    }

    #[test]
    fn test_transform_lab_result() {
        let observation = transformer().transform(LAB_MESSAGE).unwrap();

        assert_eq!(observation.resource_type, "Observation");
        assert_eq!(observation.id, "LAB-UNKNOWN-1");
        assert_eq!(observation.status, ObservationStatus::Final);
        assert_eq!(observation.category[0].coding[0].code, "laboratory");

        let coding = &observation.code.coding[0];
        assert_eq!(coding.system, "http://loinc.org");
        assert_eq!(coding.code, "GLU");
        assert_eq!(coding.display.as_deref(), Some("Glucose"));
        assert_eq!(observation.code.text.as_deref(), Some("Glucose"));

        assert_eq!(observation.subject.unwrap().reference, "Patient/P001");
        assert_eq!(observation.value_quantity.value, 95.0);
        assert_eq!(observation.value_quantity.unit.as_deref(), Some("mg/dL"));
        assert_eq!(
            observation.value_quantity.system.as_deref(),
            Some("http://unitsofmeasure.org")
        );

        let range = &observation.reference_range.unwrap()[0];
        assert_eq!(range.low.as_ref().unwrap().value, 70.0);
        assert_eq!(range.high.as_ref().unwrap().value, 100.0);
        assert_eq!(range.high.as_ref().unwrap().unit, "mg/dL");

        let interpretation = &observation.interpretation.unwrap()[0];
        assert_eq!(interpretation.coding[0].code, "N");
        assert_eq!(interpretation.coding[0].display.as_deref(), Some("Normal"));
    }

    #[test]
    fn test_transform_accepts_line_feeds() {
        let message = LAB_MESSAGE.replace('\r', "\n");
        let observation = transformer().transform(&message).unwrap();
        assert_eq!(observation.value_quantity.value, 95.0);

        let crlf = LAB_MESSAGE.replace('\r', "\r\n");
        assert!(transformer().transform(&crlf).is_ok());
    }

    #[test]
    fn test_missing_msh() {
        let message = "PID|1||P001\rOBX|1|NM|GLU^Glucose^LOINC||95|mg/dL";
        assert_eq!(
            transformer().transform(message),
            Err(Hl7Error::MissingSegment("MSH"))
        );
    }

    #[test]
    fn test_missing_obx() {
        let message = "MSH|^~\\&|LAB|ExtLab|||20250126||ORU^R01|MSG001|P|2.5\rPID|1||P001";
        assert_eq!(
            transformer().transform(message),
            Err(Hl7Error::MissingSegment("OBX"))
        );
    }

    #[test]
    fn test_unsupported_message_type() {
        let message = LAB_MESSAGE.replace("ORU^R01", "ADT^A01");
        assert_eq!(
            transformer().transform(&message),
            Err(Hl7Error::UnsupportedMessageType("ADT^A01".to_string()))
        );
    }

    #[test]
    fn test_non_numeric_value() {
        let message = LAB_MESSAGE.replace("||95|", "||POSITIVE|");
        assert_eq!(
            transformer().transform(&message),
            Err(Hl7Error::NonNumericValue("POSITIVE".to_string()))
        );
    }

    #[test]
    fn test_numeric_values_are_exact() {
        for raw in ["0", "-3.25", "1e3", "7.000001"] {
            let message = LAB_MESSAGE.replace("||95|", &format!("||{}|", raw));
            let observation = transformer().transform(&message).unwrap();
            assert_eq!(observation.value_quantity.value, raw.parse::<f64>().unwrap());
        }
    }

    #[test]
    fn test_full_obx_fields() {
        let message = "MSH|^~\\&|LAB|ExtLab|||20250126||ORU^R01|MSG001|P|2.5\n\
                       OBR|1|ORD777|FIL1|GLU^Glucose\n\
                       OBX|2|NM|2345-7^Glucose^SNOMED CT||182|mg/dL|> 70|HH|||C|||20250126083015";
        let observation = transformer().transform(message).unwrap();

        assert_eq!(observation.id, "LAB-ORD777-2");
        assert_eq!(observation.status, ObservationStatus::Corrected);
        assert_eq!(observation.code.coding[0].system, "http://snomed.info/sct");
        assert_eq!(observation.effective_date_time, "2025-01-26T08:30:15.000Z");
        assert!(observation.subject.is_none());

        let range = &observation.reference_range.unwrap()[0];
        assert_eq!(range.low.as_ref().unwrap().value, 70.0);
        assert!(range.high.is_none());
        assert_eq!(observation.interpretation.unwrap()[0].coding[0].code, "HH");
    }

    #[test]
    fn test_optional_parts_omitted() {
        let message = "MSH|^~\\&|LAB|ExtLab|||20250126||ORU^R01|MSG001|P|2.5\rOBX|1|NM|K^^LOCAL||4.2||abc|ZZ|||Q";
        let observation = transformer().transform(message).unwrap();

        assert_eq!(observation.status, ObservationStatus::Final);
        assert_eq!(observation.code.coding[0].system, fhir_systems::V2_CODES);
        assert_eq!(observation.code.text.as_deref(), Some("K"));
        assert!(observation.value_quantity.unit.is_none());
        assert!(observation.value_quantity.system.is_none());
        assert!(observation.interpretation.is_none());
        assert!(observation.reference_range.is_none());

        let json = serde_json::to_value(&observation).unwrap();
        assert!(json.get("interpretation").is_none());
        assert!(json.get("subject").is_none());
        assert!(json["valueQuantity"].get("unit").is_none());
    }

    #[test]
    fn test_repeated_obx_keeps_last() {
        let message = format!("{}\rOBX|2|NM|K^Potassium^LN||4.1|mmol/L", LAB_MESSAGE);
        let observation = transformer().transform(&message).unwrap();
        assert_eq!(observation.id, "LAB-UNKNOWN-2");
        assert_eq!(observation.code.coding[0].code, "K");
    }

    #[test]
    fn test_error_converts_to_taxonomy() {
        let hl7_err = Hl7Error::MissingSegment("MSH");
        let err: MedbridgeError = hl7_err.clone().into();
        assert_eq!(hl7_err.to_string(), err.to_string());
        assert!(matches!(err, MedbridgeError::MissingSegment(ref s) if s == "MSH"));

        let non_numeric = Hl7Error::NonNumericValue("POS".to_string());
        assert!(non_numeric
            .to_string()
            .starts_with("HL7 to FHIR transformation failed: "));
        assert_eq!(
            non_numeric.to_string(),
            MedbridgeError::from(non_numeric.clone()).to_string()
        );
    }
}
