//! 错误定义模块

use thiserror::Error;

/// 集成网关统一错误类型
#[derive(Error, Debug)]
pub enum MedbridgeError {
    #[error("Unsupported payload format: {0}")]
    UnsupportedFormat(String),

    #[error("HL7 to FHIR transformation failed: unsupported message type {0:?}, only ORU^R01 is accepted")]
    UnsupportedMessageType(String),

    #[error("HL7 to FHIR transformation failed: {0} segment not found")]
    MissingSegment(String),

    #[error("HL7 to FHIR transformation failed: non-numeric observation value {0:?}")]
    NonNumericValue(String),

    #[error("Malformed JSON payload: {0}")]
    MalformedJson(String),

    #[error("Audit entry already exists: {0}")]
    DuplicateEventId(String),

    #[error("Audit entry not found: {0}")]
    NotFound(String),

    #[error("Topic already has a subscriber: {0}")]
    AlreadySubscribed(String),

    #[error("Invalid status transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MedbridgeError {
    /// 是否为输入数据本身的问题（格式识别或转换失败）
    pub fn is_payload_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedFormat(_)
                | Self::UnsupportedMessageType(_)
                | Self::MissingSegment(_)
                | Self::NonNumericValue(_)
                | Self::MalformedJson(_)
        )
    }

    /// 是否来自外部协作方（存储或消息传输）
    pub fn is_collaborator_error(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Transport(_))
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, MedbridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(MedbridgeError::MissingSegment("MSH".into()).is_payload_error());
        assert!(MedbridgeError::MalformedJson("eof".into()).is_payload_error());
        assert!(!MedbridgeError::DuplicateEventId("x".into()).is_payload_error());
        assert!(MedbridgeError::Transport("down".into()).is_collaborator_error());
    }

    #[test]
    fn test_transformation_context_in_message() {
        let err = MedbridgeError::NonNumericValue("POS".into());
        assert!(err.to_string().starts_with("HL7 to FHIR transformation failed"));
    }
}
