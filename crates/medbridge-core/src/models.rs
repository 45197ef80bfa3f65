//! 核心数据模型定义
//!
//! 审计日志条目及其状态机。所有存储实现共享这里的校验与合并规则，
//! 保证 error/errorTrace 只在 status = error 时出现、状态只能向前推进。

use crate::error::{MedbridgeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// 集成数据类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IntegrationType {
    Hl7,  // 实验室结果
    Tiss, // 医保结算 XML
    Erp,  // ERP JSON
    Fhir, // 内部 FHIR 资源
}

impl IntegrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hl7 => "HL7",
            Self::Tiss => "TISS",
            Self::Erp => "ERP",
            Self::Fhir => "FHIR",
        }
    }
}

impl fmt::Display for IntegrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrationType {
    type Err = MedbridgeError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "HL7" => Ok(Self::Hl7),
            "TISS" => Ok(Self::Tiss),
            "ERP" => Ok(Self::Erp),
            "FHIR" => Ok(Self::Fhir),
            _ => Err(MedbridgeError::Validation(format!("unknown integration type: {}", value))),
        }
    }
}

/// 数据流向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,  // 外部 → 内部
    Outbound, // 内部 → 外部
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl FromStr for Direction {
    type Err = MedbridgeError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            _ => Err(MedbridgeError::Validation(format!("unknown direction: {}", value))),
        }
    }
}

/// 审计状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Pending,
    Processing,
    Success,
    Error,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// 检查状态转换是否有效
    pub fn can_transition_to(&self, next: AuditStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Pending, Self::Success)
                | (Self::Pending, Self::Error)
                | (Self::Processing, Self::Success)
                | (Self::Processing, Self::Error)
        )
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditStatus {
    type Err = MedbridgeError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            _ => Err(MedbridgeError::Validation(format!("unknown audit status: {}", value))),
        }
    }
}

/// 审计日志条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub event_id: String,
    #[serde(rename = "type")]
    pub integration_type: IntegrationType,
    pub direction: Direction,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// 原始报文
    pub payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transformed_resource: Option<Value>,
    pub status: AuditStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_trace: Option<String>,
    /// 发布到的主题
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// 待写入的审计条目，event_id 缺省时由存储分配
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub event_id: Option<String>,
    pub integration_type: IntegrationType,
    pub direction: Direction,
    pub source: String,
    pub target: Option<String>,
    pub payload: String,
    pub transformed_resource: Option<Value>,
    pub status: AuditStatus,
    pub error: Option<String>,
    pub error_trace: Option<String>,
    pub topic: Option<String>,
    pub message_id: Option<String>,
    pub processing_time_ms: Option<u64>,
    pub metadata: Option<Map<String, Value>>,
}

impl NewAuditEntry {
    /// 创建入站审计条目（初始状态 pending）
    pub fn inbound(
        integration_type: IntegrationType,
        source: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            event_id: None,
            integration_type,
            direction: Direction::Inbound,
            source: source.into(),
            target: None,
            payload: payload.into(),
            transformed_resource: None,
            status: AuditStatus::Pending,
            error: None,
            error_trace: None,
            topic: None,
            message_id: None,
            processing_time_ms: None,
            metadata: None,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_transformed_resource(mut self, resource: Value) -> Self {
        self.transformed_resource = Some(resource);
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_processing_time(mut self, millis: u64) -> Self {
        self.processing_time_ms = Some(millis);
        self
    }

    pub fn with_metadata(mut self, metadata: Option<Map<String, Value>>) -> Self {
        self.metadata = metadata;
        self
    }

    /// 标记为成功并记录发布主题
    pub fn succeeded(mut self, topic: impl Into<String>) -> Self {
        self.status = AuditStatus::Success;
        self.topic = Some(topic.into());
        self.error = None;
        self.error_trace = None;
        self
    }

    /// 标记为失败
    pub fn failed(mut self, error: impl Into<String>, trace: impl Into<String>) -> Self {
        self.status = AuditStatus::Error;
        self.error = Some(error.into());
        self.error_trace = Some(trace.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_error_fields(self.status, self.error.is_some(), self.error_trace.is_some())
    }

    /// 落盘前转换为完整条目
    pub fn into_entry(self, event_id: String, timestamp: DateTime<Utc>) -> Result<AuditLogEntry> {
        self.validate()?;
        Ok(AuditLogEntry {
            event_id,
            integration_type: self.integration_type,
            direction: self.direction,
            source: self.source,
            target: self.target,
            payload: self.payload,
            transformed_resource: self.transformed_resource,
            status: self.status,
            error: self.error,
            error_trace: self.error_trace,
            topic: self.topic,
            message_id: self.message_id,
            processing_time_ms: self.processing_time_ms,
            timestamp,
            metadata: self.metadata,
        })
    }
}

/// 审计条目的部分更新
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditUpdate {
    pub status: Option<AuditStatus>,
    pub target: Option<String>,
    pub transformed_resource: Option<Value>,
    pub error: Option<String>,
    pub error_trace: Option<String>,
    pub topic: Option<String>,
    pub message_id: Option<String>,
    pub processing_time_ms: Option<u64>,
    pub metadata: Option<Map<String, Value>>,
}

impl AuditUpdate {
    pub fn status(status: AuditStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

impl AuditLogEntry {
    /// 合并更新字段；校验失败时条目保持不变
    pub fn apply(&mut self, update: AuditUpdate) -> Result<()> {
        let next = update.status.unwrap_or(self.status);
        if next != self.status && !self.status.can_transition_to(next) {
            return Err(MedbridgeError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let has_error = update.error.is_some() || self.error.is_some();
        let has_trace = update.error_trace.is_some() || self.error_trace.is_some();
        check_error_fields(next, has_error, has_trace)?;

        self.status = next;
        if update.target.is_some() {
            self.target = update.target;
        }
        if update.transformed_resource.is_some() {
            self.transformed_resource = update.transformed_resource;
        }
        if update.error.is_some() {
            self.error = update.error;
        }
        if update.error_trace.is_some() {
            self.error_trace = update.error_trace;
        }
        if update.topic.is_some() {
            self.topic = update.topic;
        }
        if update.message_id.is_some() {
            self.message_id = update.message_id;
        }
        if update.processing_time_ms.is_some() {
            self.processing_time_ms = update.processing_time_ms;
        }
        if let Some(extra) = update.metadata {
            self.metadata.get_or_insert_with(Map::new).extend(extra);
        }
        Ok(())
    }
}

fn check_error_fields(status: AuditStatus, has_error: bool, has_trace: bool) -> Result<()> {
    match (status, has_error) {
        (AuditStatus::Error, false) => Err(MedbridgeError::Validation(
            "error entries must carry an error message".to_string(),
        )),
        (AuditStatus::Error, true) => Ok(()),
        (_, true) => Err(MedbridgeError::Validation(format!(
            "{} entries cannot carry an error message",
            status
        ))),
        (_, false) if has_trace => Err(MedbridgeError::Validation(format!(
            "{} entries cannot carry an error trace",
            status
        ))),
        _ => Ok(()),
    }
}
