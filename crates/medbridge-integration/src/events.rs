//! 事件类型、主题路由与事件信封
//!
//! 所有事件类型收敛为一个枚举，`EventType::topic` 给出唯一的目标主题。
//! 进程启动时调用 [`validate_routing`] 做一次完整性检查，缺失即失败。

use medbridge_core::utils::iso_now;
use medbridge_core::{MedbridgeError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// 默认事件来源
pub const DEFAULT_EVENT_SOURCE: &str = "integration-service";

/// 内部事件主题
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Patient,
    Appointment,
    Lab,
    Billing,
    Prescription,
    MedicalRecords,
    Notification,
    Integration,
    Audit,
    Inventory,
}

/// 主题创建参数，仅在开通主题时使用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicConfig {
    pub partitions: u32,
    pub replication_factor: u16,
}

impl Topic {
    pub const ALL: [Topic; 10] = [
        Topic::Patient,
        Topic::Appointment,
        Topic::Lab,
        Topic::Billing,
        Topic::Prescription,
        Topic::MedicalRecords,
        Topic::Notification,
        Topic::Integration,
        Topic::Audit,
        Topic::Inventory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Patient => "patient.events",
            Self::Appointment => "appointment.events",
            Self::Lab => "lab.events",
            Self::Billing => "billing.events",
            Self::Prescription => "prescription.events",
            Self::MedicalRecords => "medical-records.events",
            Self::Notification => "notification.events",
            Self::Integration => "integration.events",
            Self::Audit => "audit.events",
            Self::Inventory => "inventory.events",
        }
    }

    pub fn config(&self) -> TopicConfig {
        let (partitions, replication_factor) = match self {
            Self::Patient => (3, 1),
            Self::Appointment => (2, 1),
            Self::Lab => (3, 1),
            Self::Billing => (2, 1),
            Self::Prescription => (2, 1),
            Self::MedicalRecords => (3, 1),
            Self::Notification => (2, 1),
            Self::Integration => (2, 1),
            // 审计事件要求全局有序
            Self::Audit => (1, 1),
            Self::Inventory => (2, 1),
        };
        TopicConfig {
            partitions,
            replication_factor,
        }
    }

    /// 每个主题族固定的消费组
    pub fn consumer_group(&self) -> &'static str {
        match self {
            Self::Patient => "patient-events-group",
            Self::Appointment => "appointment-events-group",
            Self::Lab => "lab-events-group",
            Self::Billing => "billing-events-group",
            Self::Prescription => "prescription-events-group",
            Self::MedicalRecords => "medical-records-events-group",
            Self::Notification => "notification-events-group",
            Self::Integration => "integration-service-group",
            Self::Audit => "audit-events-group",
            Self::Inventory => "inventory-events-group",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = MedbridgeError;

    fn from_str(value: &str) -> Result<Self> {
        Topic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == value)
            .ok_or_else(|| MedbridgeError::Validation(format!("unknown topic: {}", value)))
    }
}

macro_rules! event_types {
    ($($variant:ident => $wire:literal @ $topic:ident,)+) => {
        /// 事件类型（封闭枚举）
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum EventType {
            $($variant,)+
        }

        impl EventType {
            pub const ALL: &'static [EventType] = &[$(EventType::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $wire,)+
                }
            }

            /// 事件类型 → 主题（全函数）
            pub fn topic(&self) -> Topic {
                match self {
                    $(Self::$variant => Topic::$topic,)+
                }
            }
        }

        impl FromStr for EventType {
            type Err = MedbridgeError;

            fn from_str(value: &str) -> Result<Self> {
                match value {
                    $($wire => Ok(Self::$variant),)+
                    _ => Err(MedbridgeError::Validation(format!("unknown event type: {}", value))),
                }
            }
        }
    };
}

event_types! {
    // 外部系统入站
    InboundHl7Received => "InboundHL7Received" @ Integration,
    InboundTissReceived => "InboundTISSReceived" @ Integration,
    InboundErpReceived => "InboundERPReceived" @ Integration,
    IntegrationError => "IntegrationError" @ Integration,
    TransformationError => "TransformationError" @ Integration,
    ExternalDataReceived => "ExternalDataReceived" @ Integration,
    ExternalDataSent => "ExternalDataSent" @ Integration,
    IntegrationFailed => "IntegrationFailed" @ Integration,
    ExternalSystemStatusChanged => "ExternalSystemStatusChanged" @ Integration,

    // 患者
    PatientCreated => "PatientCreated" @ Patient,
    PatientRegistered => "PatientRegistered" @ Patient,
    PatientUpdated => "PatientUpdated" @ Patient,
    PatientAdmitted => "PatientAdmitted" @ Patient,
    PatientDischarged => "PatientDischarged" @ Patient,
    PatientDeleted => "PatientDeleted" @ Patient,

    // 预约
    AppointmentCreated => "AppointmentCreated" @ Appointment,
    AppointmentUpdated => "AppointmentUpdated" @ Appointment,
    AppointmentScheduled => "AppointmentScheduled" @ Appointment,
    AppointmentConfirmed => "AppointmentConfirmed" @ Appointment,
    AppointmentCancelled => "AppointmentCancelled" @ Appointment,
    AppointmentRescheduled => "AppointmentRescheduled" @ Appointment,
    AppointmentCompleted => "AppointmentCompleted" @ Appointment,
    AppointmentNoShow => "AppointmentNoShow" @ Appointment,

    // 检验
    ObservationCreated => "ObservationCreated" @ Lab,
    ObservationUpdated => "ObservationUpdated" @ Lab,
    LabOrderCreated => "LabOrderCreated" @ Lab,
    LabSpecimenCollected => "LabSpecimenCollected" @ Lab,
    LabResultAvailable => "LabResultAvailable" @ Lab,
    LabResultValidated => "LabResultValidated" @ Lab,
    LabOrderCancelled => "LabOrderCancelled" @ Lab,

    // 结算
    ClaimCreated => "ClaimCreated" @ Billing,
    ClaimUpdated => "ClaimUpdated" @ Billing,
    InvoiceGenerated => "InvoiceGenerated" @ Billing,
    PaymentReceived => "PaymentReceived" @ Billing,
    ClaimSubmitted => "ClaimSubmitted" @ Billing,
    ClaimApproved => "ClaimApproved" @ Billing,
    ClaimRejected => "ClaimRejected" @ Billing,
    RefundIssued => "RefundIssued" @ Billing,

    // 处方
    MedicationRequestCreated => "MedicationRequestCreated" @ Prescription,
    MedicationRequestUpdated => "MedicationRequestUpdated" @ Prescription,
    PrescriptionCreated => "PrescriptionCreated" @ Prescription,
    PrescriptionDispensed => "PrescriptionDispensed" @ Prescription,
    PrescriptionCancelled => "PrescriptionCancelled" @ Prescription,
    PrescriptionRenewed => "PrescriptionRenewed" @ Prescription,

    // 病历
    EncounterCreated => "EncounterCreated" @ MedicalRecords,
    EncounterCompleted => "EncounterCompleted" @ MedicalRecords,
    DiagnosisRecorded => "DiagnosisRecorded" @ MedicalRecords,
    VitalSignsRecorded => "VitalSignsRecorded" @ MedicalRecords,
    ClinicalNoteAdded => "ClinicalNoteAdded" @ MedicalRecords,
    ProcedurePerformed => "ProcedurePerformed" @ MedicalRecords,

    // 通知
    NotificationSent => "NotificationSent" @ Notification,
    NotificationDelivered => "NotificationDelivered" @ Notification,
    NotificationFailed => "NotificationFailed" @ Notification,
    NotificationRead => "NotificationRead" @ Notification,

    // 审计
    DataAccessed => "DataAccessed" @ Audit,
    DataModified => "DataModified" @ Audit,
    UnauthorizedAccess => "UnauthorizedAccess" @ Audit,
    SensitiveDataExported => "SensitiveDataExported" @ Audit,

    // 库存
    StockLevelLow => "StockLevelLow" @ Inventory,
    ItemReceived => "ItemReceived" @ Inventory,
    ItemDispensed => "ItemDispensed" @ Inventory,
    StockAdjusted => "StockAdjusted" @ Inventory,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// 启动时校验路由表：每个事件类型都路由到已配置的主题，线上名称不重复
pub fn validate_routing() -> Result<()> {
    let mut wire_names = HashSet::new();
    for event_type in EventType::ALL {
        if !wire_names.insert(event_type.as_str()) {
            return Err(MedbridgeError::Config(format!(
                "duplicate event type name: {}",
                event_type
            )));
        }
        if event_type.as_str().parse::<EventType>()? != *event_type {
            return Err(MedbridgeError::Config(format!(
                "event type {} does not round-trip",
                event_type
            )));
        }

        let topic = event_type.topic();
        let config = topic.config();
        if config.partitions == 0 || config.replication_factor == 0 {
            return Err(MedbridgeError::Config(format!(
                "topic {} routed from {} has no provisioning config",
                topic, event_type
            )));
        }
        if topic.consumer_group().is_empty() {
            return Err(MedbridgeError::Config(format!(
                "topic {} has no consumer group",
                topic
            )));
        }
    }
    Ok(())
}

/// 事件信封（发布后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub timestamp: String,
    pub source: String,
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(alias = "resource")]
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl IntegrationEvent {
    pub fn new(
        event_id: impl Into<String>,
        event_type: EventType,
        resource_type: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            event_type,
            timestamp: iso_now(),
            source: DEFAULT_EVENT_SOURCE.to_string(),
            resource_type: resource_type.into(),
            resource_id: None,
            data,
            raw_data: None,
            metadata: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_raw_data(mut self, raw_data: Value) -> Self {
        self.raw_data = Some(raw_data);
        self
    }

    pub fn with_metadata(mut self, metadata: Option<Map<String, Value>>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn topic(&self) -> Topic {
        self.event_type.topic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_routing_table_is_valid() {
        validate_routing().unwrap();
    }

    #[test]
    fn test_every_topic_is_reachable() {
        let reached: HashSet<Topic> = EventType::ALL.iter().map(|e| e.topic()).collect();
        assert_eq!(reached.len(), Topic::ALL.len());
    }

    #[test]
    fn test_event_routes() {
        assert_eq!(EventType::InboundHl7Received.topic(), Topic::Integration);
        assert_eq!(EventType::ObservationCreated.topic(), Topic::Lab);
        assert_eq!(EventType::ClaimRejected.topic(), Topic::Billing);
        assert_eq!(EventType::MedicationRequestCreated.topic(), Topic::Prescription);
        assert_eq!(EventType::DataAccessed.topic(), Topic::Audit);
    }

    #[test]
    fn test_topic_provisioning() {
        assert_eq!(Topic::Audit.config().partitions, 1);
        assert_eq!(Topic::Lab.config().partitions, 3);
        assert_eq!(Topic::Integration.consumer_group(), "integration-service-group");
        assert_eq!("medical-records.events".parse::<Topic>().unwrap(), Topic::MedicalRecords);
        assert!("unknown.events".parse::<Topic>().is_err());
    }

    #[test]
    fn test_envelope_wire_format() {
        let event = IntegrationEvent::new(
            "evt-1",
            EventType::InboundHl7Received,
            "Observation",
            json!({"id": "LAB-ORD001-1"}),
        )
        .with_resource_id("LAB-ORD001-1");

        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["eventId"], "evt-1");
        assert_eq!(wire["eventType"], "InboundHL7Received");
        assert_eq!(wire["source"], "integration-service");
        assert_eq!(wire["resourceType"], "Observation");
        assert_eq!(wire["resourceId"], "LAB-ORD001-1");
        assert!(wire.get("rawData").is_none());

        let decoded: IntegrationEvent = serde_json::from_value(wire).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_envelope_accepts_resource_field() {
        let wire = json!({
            "eventId": "evt-2",
            "eventType": "ObservationCreated",
            "timestamp": "2025-01-26T00:00:00.000Z",
            "source": "lab-service",
            "resourceType": "Observation",
            "resource": {"id": "obs-1"}
        });
        let event: IntegrationEvent = serde_json::from_value(wire).unwrap();
        assert_eq!(event.data["id"], "obs-1");
        assert_eq!(event.topic(), Topic::Lab);
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let wire = json!({
            "eventId": "evt-3",
            "eventType": "SomethingElse",
            "timestamp": "2025-01-26T00:00:00.000Z",
            "source": "x",
            "resourceType": "X",
            "data": {}
        });
        assert!(serde_json::from_value::<IntegrationEvent>(wire).is_err());
    }
}
