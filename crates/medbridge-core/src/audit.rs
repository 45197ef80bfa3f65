//! 审计存储契约
//!
//! 存储引擎本身不在本模块范围内，这里只定义查询语义：
//! event_id 唯一、按时间倒序返回、只能按时间批量清理。

use crate::error::Result;
use crate::models::{AuditLogEntry, AuditStatus, AuditUpdate, Direction, IntegrationType, NewAuditEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 最近记录查询的默认条数
pub const DEFAULT_RECENT_LIMIT: usize = 10;

/// 审计查询过滤器
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditQuery {
    pub integration_type: Option<IntegrationType>,
    pub status: Option<AuditStatus>,
    pub direction: Option<Direction>,
    pub source: Option<String>,
    pub limit: usize,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            integration_type: None,
            status: None,
            direction: None,
            source: None,
            limit: DEFAULT_RECENT_LIMIT,
        }
    }
}

impl AuditQuery {
    pub fn with_type(mut self, integration_type: IntegrationType) -> Self {
        self.integration_type = Some(integration_type);
        self
    }

    pub fn with_status(mut self, status: AuditStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// 条目是否满足过滤条件（不考虑 limit）
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.integration_type.map_or(true, |t| entry.integration_type == t)
            && self.status.map_or(true, |s| entry.status == s)
            && self.direction.map_or(true, |d| entry.direction == d)
            && self.source.as_deref().map_or(true, |s| entry.source == s)
    }
}

/// 处理耗时统计（仅统计记录了耗时的成功条目）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    pub avg_time_ms: u64,
    pub min_time_ms: u64,
    pub max_time_ms: u64,
    pub count: u64,
}

impl ProcessingStats {
    pub fn from_samples<I: IntoIterator<Item = u64>>(samples: I) -> Self {
        let mut stats = Self::default();
        let mut total: u128 = 0;
        for sample in samples {
            if stats.count == 0 {
                stats.min_time_ms = sample;
                stats.max_time_ms = sample;
            } else {
                stats.min_time_ms = stats.min_time_ms.min(sample);
                stats.max_time_ms = stats.max_time_ms.max(sample);
            }
            total += u128::from(sample);
            stats.count += 1;
        }
        if stats.count > 0 {
            stats.avg_time_ms = (total as f64 / stats.count as f64).round() as u64;
        }
        stats
    }
}

/// 审计日志存储接口
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// 写入新条目；event_id 已存在时返回 DuplicateEventId
    async fn create(&self, entry: NewAuditEntry) -> Result<AuditLogEntry>;

    /// 合并字段；条目不存在时返回 NotFound
    async fn update(&self, event_id: &str, update: AuditUpdate) -> Result<AuditLogEntry>;

    async fn find_by_event_id(&self, event_id: &str) -> Result<Option<AuditLogEntry>>;

    /// 最近的 N 条（按时间倒序）
    async fn find_recent(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>>;

    /// 闭区间 [start, end] 内的条目（按时间倒序）
    async fn find_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AuditLogEntry>>;

    async fn count_by_status(&self) -> Result<HashMap<AuditStatus, u64>>;

    async fn find_errors(&self, limit: usize) -> Result<Vec<AuditLogEntry>>;

    /// 满足过滤条件的总数（忽略 limit）
    async fn count(&self, query: &AuditQuery) -> Result<u64>;

    /// 按类型分页，page 从 1 开始
    async fn find_by_type(
        &self,
        integration_type: IntegrationType,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<AuditLogEntry>>;

    async fn processing_stats(&self) -> Result<ProcessingStats>;

    /// 删除早于 cutoff 的条目，返回删除数量
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// 分页偏移量，page 为 0 时按第 1 页处理
pub fn page_offset(page: usize, page_size: usize) -> usize {
    page.max(1).saturating_sub(1).saturating_mul(page_size)
}
