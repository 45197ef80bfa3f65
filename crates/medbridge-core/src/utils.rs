//! 通用工具函数

use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

/// 生成事件ID（UUID v4）
pub fn generate_event_id() -> String {
    Uuid::new_v4().to_string()
}

/// 生成审计日志ID，格式 log-{毫秒时间戳}-{9位随机串}
pub fn generate_log_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("log-{}-{}", Utc::now().timestamp_millis(), &random[..9])
}

/// 当前时间的 ISO-8601 字符串（毫秒精度，UTC）
pub fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
