//! # MedBridge 数据库模块
//!
//! 审计日志的 PostgreSQL 存储，实现 [`medbridge_core::AuditStore`] 契约。

pub mod connection;
pub mod models;
pub mod queries;

// 重新导出主要类型
pub use connection::{DatabaseConfig, DatabasePool};
pub use models::DbAuditLog;
pub use queries::PgAuditStore;
