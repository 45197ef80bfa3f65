//! # MedBridge 集成模块
//!
//! 外部医疗数据的入站处理，包括：
//! - 格式识别（HL7 / TISS / ERP）
//! - HL7 v2.5 ORU^R01 到 FHIR Observation 的转换
//! - 审计日志（内存实现）
//! - 事件路由与发布（进程内 / RabbitMQ）
//! - 入站流水线与 HTTP 接入层

pub mod api;
pub mod audit;
pub mod convert;
pub mod detector;
pub mod events;
pub mod hl7;
pub mod mappings;
pub mod message_queue;
pub mod metrics;
pub mod pipeline;

pub use api::{create_api_routes, ApiServer, ApiState};
pub use audit::InMemoryAuditStore;
pub use convert::{extract_message_type, is_valid_hl7};
pub use detector::detect_format;
pub use events::{validate_routing, EventType, IntegrationEvent, Topic, TopicConfig};
pub use hl7::{Hl7Error, Hl7Message, Hl7Parser, Hl7ToFhirTransformer};
pub use message_queue::{
    AmqpConfig, AmqpTransport, EventHandler, EventPublisher, EventTransport, InMemoryTransport,
    DEFAULT_MEMORY_RETENTION,
};
pub use metrics::InboundMetrics;
pub use pipeline::{InboundRequest, InboundResponse, PipelineOrchestrator};
