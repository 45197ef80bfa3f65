//! 入站处理流水线
//!
//! 单次调用的流程：格式识别 → 转换或原样封装 → 写审计 → 发布事件 → 返回。
//! 审计写入与事件发布依次执行，不在同一事务内。

use crate::convert::extract_message_type;
use crate::detector::detect_format;
use crate::events::{EventType, IntegrationEvent, DEFAULT_EVENT_SOURCE};
use crate::hl7::Hl7ToFhirTransformer;
use crate::message_queue::EventPublisher;
use crate::metrics::InboundMetrics;
use medbridge_core::utils::{generate_event_id, iso_now};
use medbridge_core::{
    AuditStore, ComponentLogger, IntegrationType, LoggerRegistry, MedbridgeError, NewAuditEntry,
    Result,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;

/// 入站请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundRequest {
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// 不参与格式识别
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<Map<String, Value>>,
}

impl InboundRequest {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.meta_data = Some(metadata);
        self
    }
}

/// 入站处理结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundResponse {
    pub success: bool,
    pub event_id: String,
    #[serde(rename = "type")]
    pub integration_type: IntegrationType,
    pub topic: String,
    pub resource: Value,
}

/// 未提供来源时按类型使用的默认来源
pub fn default_source(integration_type: IntegrationType) -> &'static str {
    match integration_type {
        IntegrationType::Hl7 => "external-lab",
        IntegrationType::Tiss => "external-insurance",
        IntegrationType::Erp => "external-erp",
        IntegrationType::Fhir => "external-fhir",
    }
}

/// 分支产出的完整资源，尚未发布
struct PreparedResource {
    event_type: EventType,
    resource_type: &'static str,
    resource_id: Option<String>,
    data: Value,
    transformed: Option<Value>,
}

/// 入站流水线编排器
pub struct PipelineOrchestrator {
    audit: Arc<dyn AuditStore>,
    publisher: Arc<EventPublisher>,
    transformer: Hl7ToFhirTransformer,
    metrics: InboundMetrics,
    event_source: String,
    logger: ComponentLogger,
}

impl PipelineOrchestrator {
    pub fn new(
        audit: Arc<dyn AuditStore>,
        publisher: Arc<EventPublisher>,
        metrics: InboundMetrics,
        logging: &LoggerRegistry,
    ) -> Self {
        Self {
            audit,
            publisher,
            transformer: Hl7ToFhirTransformer::new(logging),
            metrics,
            event_source: DEFAULT_EVENT_SOURCE.to_string(),
            logger: logging.scoped("PipelineOrchestrator"),
        }
    }

    /// 设置事件信封中的 source
    pub fn with_event_source(mut self, source: impl Into<String>) -> Self {
        self.event_source = source.into();
        self
    }

    pub fn audit(&self) -> &Arc<dyn AuditStore> {
        &self.audit
    }

    pub fn metrics(&self) -> &InboundMetrics {
        &self.metrics
    }

    /// 处理一条入站数据
    pub async fn process_inbound(&self, request: InboundRequest) -> Result<InboundResponse> {
        let started = Instant::now();

        let integration_type = match detect_format(&request.data) {
            Ok(integration_type) => integration_type,
            Err(err) => {
                self.logger.warn(format!("Inbound payload rejected: {}", err));
                self.metrics.record(None, false, started.elapsed());
                return Err(err);
            }
        };

        let source = request
            .source
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| default_source(integration_type))
            .to_string();

        self.logger.info(format!(
            "Processing {} inbound from {}",
            integration_type, source
        ));

        let result = match self
            .run_branch(integration_type, &source, &request, started)
            .await
        {
            Ok(response) => Ok(response),
            Err(err) => {
                self.record_failure(integration_type, &source, &request, &err, started)
                    .await;
                Err(err)
            }
        };

        self.metrics
            .record(Some(integration_type), result.is_ok(), started.elapsed());
        result
    }

    async fn run_branch(
        &self,
        integration_type: IntegrationType,
        source: &str,
        request: &InboundRequest,
        started: Instant,
    ) -> Result<InboundResponse> {
        let prepared = self.prepare(integration_type, &request.data)?;
        let event_id = generate_event_id();
        let topic = prepared.event_type.topic();

        let mut entry = NewAuditEntry::inbound(integration_type, source, request.data.as_str())
            .with_event_id(event_id.as_str())
            .with_message_id(event_id.as_str())
            .with_metadata(request.meta_data.clone())
            .with_processing_time(elapsed_millis(started))
            .succeeded(topic.as_str());
        if let Some(resource) = prepared.transformed {
            entry = entry.with_transformed_resource(resource);
        }
        let record = self.audit.create(entry).await?;

        let mut event = IntegrationEvent::new(
            record.event_id.as_str(),
            prepared.event_type,
            prepared.resource_type,
            prepared.data.clone(),
        )
        .with_source(self.event_source.as_str())
        .with_metadata(request.meta_data.clone());
        if let Some(resource_id) = prepared.resource_id {
            event = event.with_resource_id(resource_id);
        }
        self.publisher.publish(topic, &event).await?;

        self.logger.info(format!(
            "{} inbound processed: {}",
            integration_type, record.event_id
        ));
        Ok(InboundResponse {
            success: true,
            event_id: record.event_id,
            integration_type,
            topic: topic.as_str().to_string(),
            resource: prepared.data,
        })
    }

    fn prepare(&self, integration_type: IntegrationType, payload: &str) -> Result<PreparedResource> {
        match integration_type {
            IntegrationType::Hl7 => {
                let observation = self.transformer.transform(payload)?;
                let resource_id = observation.id.clone();
                let resource = serde_json::to_value(&observation)?;
                Ok(PreparedResource {
                    event_type: EventType::InboundHl7Received,
                    resource_type: "Observation",
                    resource_id: Some(resource_id),
                    data: resource.clone(),
                    transformed: Some(resource),
                })
            }
            // TISS 不解析 XML，只做封装
            IntegrationType::Tiss => Ok(PreparedResource {
                event_type: EventType::InboundTissReceived,
                resource_type: "TISS",
                resource_id: None,
                data: json!({
                    "rawXml": payload,
                    "type": IntegrationType::Tiss.as_str(),
                    "receivedAt": iso_now(),
                }),
                transformed: None,
            }),
            IntegrationType::Erp => {
                let data: Value = serde_json::from_str(payload)
                    .map_err(|e| MedbridgeError::MalformedJson(e.to_string()))?;
                Ok(PreparedResource {
                    event_type: EventType::InboundErpReceived,
                    resource_type: "ERP",
                    resource_id: None,
                    data,
                    transformed: None,
                })
            }
            IntegrationType::Fhir => Err(MedbridgeError::UnsupportedFormat(
                "FHIR payloads are not accepted inbound".to_string(),
            )),
        }
    }

    /// 记录失败审计；写入失败只记日志
    async fn record_failure(
        &self,
        integration_type: IntegrationType,
        source: &str,
        request: &InboundRequest,
        err: &MedbridgeError,
        started: Instant,
    ) {
        match hl7_message_type(integration_type, &request.data) {
            Some(message_type) => self.logger.error(format!(
                "{} inbound ({}) failed from {}: {}",
                integration_type, message_type, source, err
            )),
            None => self.logger.error(format!(
                "{} inbound failed from {}: {}",
                integration_type, source, err
            )),
        }

        let entry = NewAuditEntry::inbound(integration_type, source, request.data.as_str())
            .with_event_id(generate_event_id())
            .with_metadata(request.meta_data.clone())
            .with_processing_time(elapsed_millis(started))
            .failed(err.to_string(), format!("{:?}", err));

        if let Err(audit_err) = self.audit.create(entry).await {
            self.logger
                .warn(format!("Failed to record error audit entry: {}", audit_err));
        }
    }
}

/// HL7 报文的 MSH-9，用于失败日志
fn hl7_message_type(integration_type: IntegrationType, payload: &str) -> Option<String> {
    match integration_type {
        IntegrationType::Hl7 => extract_message_type(payload).filter(|t| !t.is_empty()),
        _ => None,
    }
}

fn elapsed_millis(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditStore;
    use crate::events::Topic;
    use crate::message_queue::{EventTransport, InMemoryTransport};
    use async_trait::async_trait;
    use medbridge_core::{AuditQuery, AuditStatus};
    use tokio::sync::mpsc;

    const ORU_MESSAGE: &str = "MSH|^~\\&|LAB|ExtLab|||20250126||ORU^R01|MSG001|P|2.5\rPID|1||P001||Silva^João||19900101|M\rOBR|1||ORD001|GLU^Glicose\rOBX|1|NM|GLU^Glucose^LOINC||95|mg/dL|70-100|N";

    struct Harness {
        audit: Arc<InMemoryAuditStore>,
        transport: Arc<InMemoryTransport>,
        pipeline: PipelineOrchestrator,
    }

    fn harness() -> Harness {
        let logging = LoggerRegistry::new("integration-service");
        let audit = Arc::new(InMemoryAuditStore::new(&logging));
        let transport = Arc::new(InMemoryTransport::new(&logging));
        let publisher = Arc::new(EventPublisher::new(transport.clone(), &logging));
        let pipeline = PipelineOrchestrator::new(
            audit.clone(),
            publisher,
            InboundMetrics::new().unwrap(),
            &logging,
        );
        Harness {
            audit,
            transport,
            pipeline,
        }
    }

    async fn published(transport: &InMemoryTransport) -> Vec<IntegrationEvent> {
        transport
            .messages(Topic::Integration.as_str())
            .await
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_hl7_end_to_end() {
        let h = harness();
        let response = h
            .pipeline
            .process_inbound(InboundRequest::new(ORU_MESSAGE))
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(response.integration_type, IntegrationType::Hl7);
        assert_eq!(response.topic, "integration.events");
        assert_eq!(response.resource["resourceType"], "Observation");
        assert_eq!(response.resource["id"], "LAB-UNKNOWN-1");
        assert_eq!(response.resource["valueQuantity"]["value"], 95.0);

        let entry = h
            .audit
            .find_by_event_id(&response.event_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, AuditStatus::Success);
        assert_eq!(entry.source, "external-lab");
        assert_eq!(entry.topic.as_deref(), Some("integration.events"));
        assert_eq!(entry.message_id.as_deref(), Some(response.event_id.as_str()));
        assert!(entry.transformed_resource.is_some());
        assert!(entry.processing_time_ms.is_some());
        assert!(entry.error.is_none());

        let events = published(&h.transport).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, response.event_id);
        assert_eq!(events[0].event_type, EventType::InboundHl7Received);
        assert_eq!(events[0].source, "integration-service");
        assert_eq!(events[0].resource_type, "Observation");
        assert_eq!(events[0].resource_id.as_deref(), Some("LAB-UNKNOWN-1"));

        assert_eq!(h.pipeline.metrics().count("HL7", "success"), 1);
    }

    #[tokio::test]
    async fn test_hl7_without_msh_segment_is_audited_as_error() {
        let h = harness();
        let payload = "MSHX|^~\\&|LAB\rOBX|1|NM|GLU^Glucose^LOINC||95|mg/dL";
        let err = h
            .pipeline
            .process_inbound(InboundRequest::new(payload))
            .await
            .unwrap_err();
        assert!(matches!(err, MedbridgeError::MissingSegment(ref s) if s == "MSH"));

        let all = h
            .audit
            .find_recent(&AuditQuery::default().with_limit(10))
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, AuditStatus::Error);
        assert_eq!(all[0].payload, payload);
        assert!(all[0].error_trace.is_some());
        assert!(published(&h.transport).await.is_empty());
    }

    #[tokio::test]
    async fn test_non_numeric_value_is_reraised_unchanged() {
        let h = harness();
        let payload = ORU_MESSAGE.replace("||95|", "||POS|");
        let err = h
            .pipeline
            .process_inbound(InboundRequest::new(payload).with_source("lab-a"))
            .await
            .unwrap_err();
        assert!(matches!(err, MedbridgeError::NonNumericValue(ref v) if v == "POS"));

        let errors = h.audit.find_errors(10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].source, "lab-a");
        assert!(errors[0]
            .error
            .as_deref()
            .unwrap()
            .starts_with("HL7 to FHIR transformation failed"));
        assert_eq!(h.pipeline.metrics().count("HL7", "error"), 1);
    }

    #[tokio::test]
    async fn test_tiss_is_wrapped() {
        let h = harness();
        let xml = "  <guia><numero>1</numero></guia>";
        let response = h
            .pipeline
            .process_inbound(InboundRequest::new(xml))
            .await
            .unwrap();

        assert_eq!(response.integration_type, IntegrationType::Tiss);
        assert_eq!(response.resource["rawXml"], xml);
        assert_eq!(response.resource["type"], "TISS");
        assert!(response.resource["receivedAt"].is_string());

        let entry = h
            .audit
            .find_by_event_id(&response.event_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.source, "external-insurance");
        assert!(entry.transformed_resource.is_none());

        let events = published(&h.transport).await;
        assert_eq!(events[0].event_type, EventType::InboundTissReceived);
        assert_eq!(events[0].resource_type, "TISS");
    }

    #[tokio::test]
    async fn test_erp_passthrough_with_metadata() {
        let h = harness();
        let mut metadata = Map::new();
        metadata.insert("batch".to_string(), json!("B-7"));

        let response = h
            .pipeline
            .process_inbound(
                InboundRequest::new(r#"{"invoice": 42, "items": []}"#)
                    .with_source("sap")
                    .with_metadata(metadata),
            )
            .await
            .unwrap();

        assert_eq!(response.integration_type, IntegrationType::Erp);
        assert_eq!(response.resource["invoice"], 42);

        let entry = h
            .audit
            .find_by_event_id(&response.event_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.source, "sap");
        assert_eq!(entry.metadata.as_ref().unwrap()["batch"], "B-7");

        let events = published(&h.transport).await;
        assert_eq!(events[0].event_type, EventType::InboundErpReceived);
        assert_eq!(events[0].metadata.as_ref().unwrap()["batch"], "B-7");
    }

    #[tokio::test]
    async fn test_unknown_format_writes_no_audit_entry() {
        let h = harness();
        let err = h
            .pipeline
            .process_inbound(InboundRequest::new("hello there"))
            .await
            .unwrap_err();
        assert!(matches!(err, MedbridgeError::UnsupportedFormat(_)));
        assert_eq!(h.audit.len().await, 0);
        assert_eq!(h.pipeline.metrics().count("unknown", "error"), 1);
    }

    struct BrokenTransport;

    #[async_trait]
    impl EventTransport for BrokenTransport {
        async fn send(&self, _topic: &str, _key: &str, _payload: Vec<u8>) -> Result<()> {
            Err(MedbridgeError::Transport("broker unavailable".to_string()))
        }

        async fn consume(&self, _topic: &str, _group: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
            Err(MedbridgeError::Transport("broker unavailable".to_string()))
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_success_entry() {
        let logging = LoggerRegistry::default();
        let audit = Arc::new(InMemoryAuditStore::new(&logging));
        let publisher = Arc::new(EventPublisher::new(Arc::new(BrokenTransport), &logging));
        let pipeline = PipelineOrchestrator::new(
            audit.clone(),
            publisher,
            InboundMetrics::new().unwrap(),
            &logging,
        );

        let err = pipeline
            .process_inbound(InboundRequest::new("{}"))
            .await
            .unwrap_err();
        assert!(err.is_collaborator_error());

        let counts = audit.count_by_status().await.unwrap();
        assert_eq!(counts.get(&AuditStatus::Success), Some(&1));
        assert_eq!(counts.get(&AuditStatus::Error), Some(&1));
    }

    #[test]
    fn test_failure_log_message_type() {
        assert_eq!(
            hl7_message_type(IntegrationType::Hl7, ORU_MESSAGE).as_deref(),
            Some("ORU^R01")
        );
        let adt = ORU_MESSAGE.replace("ORU^R01", "ADT^A01");
        assert_eq!(
            hl7_message_type(IntegrationType::Hl7, &adt).as_deref(),
            Some("ADT^A01")
        );
        assert_eq!(hl7_message_type(IntegrationType::Hl7, "MSH|^~\\&|LAB"), None);
        assert_eq!(hl7_message_type(IntegrationType::Erp, ORU_MESSAGE), None);
    }
}
