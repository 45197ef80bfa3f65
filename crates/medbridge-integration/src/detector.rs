//! 入站报文格式识别
//!
//! 规则按顺序匹配，先命中者生效：MSH 开头为 HL7，去空白后以 `<` 开头为 TISS，
//! 合法 JSON 为 ERP，其余一律拒绝。

use medbridge_core::{IntegrationType, MedbridgeError, Result};

/// 识别报文类型；无法识别时返回 UnsupportedFormat
pub fn detect_format(payload: &str) -> Result<IntegrationType> {
    if payload.starts_with("MSH") {
        return Ok(IntegrationType::Hl7);
    }

    if payload.trim_start().starts_with('<') {
        return Ok(IntegrationType::Tiss);
    }

    if serde_json::from_str::<serde::de::IgnoredAny>(payload).is_ok() {
        return Ok(IntegrationType::Erp);
    }

    let preview: String = payload.chars().take(32).collect();
    Err(MedbridgeError::UnsupportedFormat(preview))
}
