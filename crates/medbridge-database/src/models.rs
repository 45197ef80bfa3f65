//! 数据库模型

use chrono::{DateTime, Utc};
use medbridge_core::{AuditLogEntry, MedbridgeError, Result};
use serde_json::{Map, Value};
use sqlx::FromRow;

/// 审计日志表行；JSON 字段以文本存储
#[derive(Debug, Clone, FromRow)]
pub struct DbAuditLog {
    pub event_id: String,
    pub integration_type: String, // 存储为字符串，转换为IntegrationType枚举
    pub direction: String,
    pub source: String,
    pub target: Option<String>,
    pub payload: String,
    pub transformed_resource: Option<String>,
    pub status: String,
    pub error: Option<String>,
    pub error_trace: Option<String>,
    pub topic: Option<String>,
    pub message_id: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub metadata: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbAuditLog> for AuditLogEntry {
    type Error = MedbridgeError;

    fn try_from(row: DbAuditLog) -> Result<Self> {
        let metadata = row
            .metadata
            .as_deref()
            .map(serde_json::from_str::<Map<String, Value>>)
            .transpose()?;
        let transformed_resource = row
            .transformed_resource
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()?;

        Ok(AuditLogEntry {
            event_id: row.event_id,
            integration_type: row.integration_type.parse()?,
            direction: row.direction.parse()?,
            source: row.source,
            target: row.target,
            payload: row.payload,
            transformed_resource,
            status: row.status.parse()?,
            error: row.error,
            error_trace: row.error_trace,
            topic: row.topic,
            message_id: row.message_id,
            processing_time_ms: row
                .processing_time_ms
                .and_then(|ms| u64::try_from(ms).ok()),
            timestamp: row.created_at,
            metadata,
        })
    }
}

/// 写入用的 JSON 文本
pub fn json_text<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map_err(MedbridgeError::from)
}
