//! 内存审计日志存储
//!
//! 实现与 PostgreSQL 存储相同的契约，用于测试和单机部署。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medbridge_core::audit::page_offset;
use medbridge_core::utils::generate_log_id;
use medbridge_core::{
    AuditLogEntry, AuditQuery, AuditStatus, AuditStore, AuditUpdate, ComponentLogger,
    IntegrationType, LoggerRegistry, MedbridgeError, NewAuditEntry, ProcessingStats, Result,
};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// 内存审计存储
pub struct InMemoryAuditStore {
    entries: RwLock<Vec<AuditLogEntry>>,
    logger: ComponentLogger,
}

impl InMemoryAuditStore {
    pub fn new(logging: &LoggerRegistry) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            logger: logging.scoped("AuditLog"),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// 最新的在前；时间相同时后写入的在前
    fn newest_first<'a, I>(entries: I) -> Vec<AuditLogEntry>
    where
        I: DoubleEndedIterator<Item = &'a AuditLogEntry>,
    {
        let mut selected: Vec<AuditLogEntry> = entries.rev().cloned().collect();
        selected.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        selected
    }
}

impl Default for InMemoryAuditStore {
    fn default() -> Self {
        Self::new(&LoggerRegistry::default())
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn create(&self, entry: NewAuditEntry) -> Result<AuditLogEntry> {
        let event_id = entry.event_id.clone().unwrap_or_else(generate_log_id);
        let record = entry.into_entry(event_id, Utc::now())?;

        let mut entries = self.entries.write().await;
        if entries.iter().any(|e| e.event_id == record.event_id) {
            self.logger
                .warn(format!("Duplicate audit entry rejected: {}", record.event_id));
            return Err(MedbridgeError::DuplicateEventId(record.event_id));
        }
        entries.push(record.clone());

        self.logger.info(format!("Log created: {}", record.event_id));
        Ok(record)
    }

    async fn update(&self, event_id: &str, update: AuditUpdate) -> Result<AuditLogEntry> {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.iter_mut().find(|e| e.event_id == event_id) else {
            self.logger.warn(format!("Log not found: {}", event_id));
            return Err(MedbridgeError::NotFound(event_id.to_string()));
        };

        entry.apply(update)?;
        self.logger.info(format!("Log updated: {}", event_id));
        Ok(entry.clone())
    }

    async fn find_by_event_id(&self, event_id: &str) -> Result<Option<AuditLogEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.iter().find(|e| e.event_id == event_id).cloned())
    }

    async fn find_recent(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>> {
        let entries = self.entries.read().await;
        let mut selected = Self::newest_first(entries.iter().filter(|e| query.matches(e)));
        selected.truncate(query.limit);
        Ok(selected)
    }

    async fn find_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AuditLogEntry>> {
        let entries = self.entries.read().await;
        Ok(Self::newest_first(
            entries
                .iter()
                .filter(|e| e.timestamp >= start && e.timestamp <= end),
        ))
    }

    async fn count_by_status(&self) -> Result<HashMap<AuditStatus, u64>> {
        let entries = self.entries.read().await;
        let mut counts = HashMap::new();
        for entry in entries.iter() {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn find_errors(&self, limit: usize) -> Result<Vec<AuditLogEntry>> {
        let query = AuditQuery::default()
            .with_status(AuditStatus::Error)
            .with_limit(limit);
        self.find_recent(&query).await
    }

    async fn count(&self, query: &AuditQuery) -> Result<u64> {
        let entries = self.entries.read().await;
        Ok(entries.iter().filter(|e| query.matches(e)).count() as u64)
    }

    async fn find_by_type(
        &self,
        integration_type: IntegrationType,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<AuditLogEntry>> {
        let entries = self.entries.read().await;
        let selected = Self::newest_first(
            entries
                .iter()
                .filter(|e| e.integration_type == integration_type),
        );
        Ok(selected
            .into_iter()
            .skip(page_offset(page, page_size))
            .take(page_size)
            .collect())
    }

    async fn processing_stats(&self) -> Result<ProcessingStats> {
        let entries = self.entries.read().await;
        Ok(ProcessingStats::from_samples(
            entries
                .iter()
                .filter(|e| e.status == AuditStatus::Success)
                .filter_map(|e| e.processing_time_ms),
        ))
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.timestamp >= cutoff);
        let deleted = (before - entries.len()) as u64;

        self.logger.info(format!("Deleted {} old logs", deleted));
        Ok(deleted)
    }
}
