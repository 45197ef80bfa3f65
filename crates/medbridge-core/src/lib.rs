//! # MedBridge Core
//!
//! 集成网关的核心模块，提供数据模型、FHIR 资源、错误定义、审计存储契约和通用工具。

pub mod audit;
pub mod error;
pub mod fhir;
pub mod logging;
pub mod models;
pub mod utils;

pub use audit::{AuditQuery, AuditStore, ProcessingStats};
pub use error::{MedbridgeError, Result};
pub use fhir::*;
pub use logging::{ComponentLogger, LoggerRegistry};
pub use models::*;
