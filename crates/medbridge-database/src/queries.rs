//! 审计日志查询操作

use crate::connection::DatabasePool;
use crate::models::{json_text, DbAuditLog};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medbridge_core::audit::page_offset;
use medbridge_core::utils::generate_log_id;
use medbridge_core::{
    AuditLogEntry, AuditQuery, AuditStatus, AuditStore, AuditUpdate, ComponentLogger,
    IntegrationType, LoggerRegistry, MedbridgeError, NewAuditEntry, ProcessingStats, Result,
};
use sqlx::{Postgres, QueryBuilder, Row};
use std::collections::HashMap;

const TABLE: &str = "integration_logs";

fn store_error(err: sqlx::Error) -> MedbridgeError {
    MedbridgeError::Store(err.to_string())
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// 把过滤条件追加到 WHERE 子句
fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &AuditQuery) {
    builder.push(" WHERE 1 = 1");
    if let Some(integration_type) = query.integration_type {
        builder
            .push(" AND integration_type = ")
            .push_bind(integration_type.as_str());
    }
    if let Some(status) = query.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(direction) = query.direction {
        builder.push(" AND direction = ").push_bind(direction.as_str());
    }
    if let Some(source) = &query.source {
        builder.push(" AND source = ").push_bind(source.clone());
    }
}

fn recent_query(query: &AuditQuery) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!("SELECT * FROM {}", TABLE));
    push_filters(&mut builder, query);
    builder
        .push(" ORDER BY created_at DESC LIMIT ")
        .push_bind(to_i64(query.limit));
    builder
}

fn count_query(query: &AuditQuery) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", TABLE));
    push_filters(&mut builder, query);
    builder
}

/// PostgreSQL 审计存储
pub struct PgAuditStore {
    pool: DatabasePool,
    logger: ComponentLogger,
}

impl PgAuditStore {
    pub fn new(pool: DatabasePool, logging: &LoggerRegistry) -> Self {
        Self {
            pool,
            logger: logging.scoped("AuditLog"),
        }
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let pool = self.pool.pool();

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS integration_logs (
                event_id VARCHAR(128) PRIMARY KEY,
                integration_type VARCHAR(8) NOT NULL,
                direction VARCHAR(16) NOT NULL,
                source VARCHAR(255) NOT NULL,
                target VARCHAR(255),
                payload TEXT NOT NULL,
                transformed_resource TEXT,
                status VARCHAR(16) NOT NULL DEFAULT 'pending',
                error TEXT,
                error_trace TEXT,
                topic VARCHAR(128),
                message_id VARCHAR(128),
                processing_time_ms BIGINT,
                metadata TEXT,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
            )
        "#,
        )
        .execute(pool)
        .await
        .map_err(store_error)?;

        self.create_indexes().await?;

        self.logger.info("Audit tables created successfully");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let pool = self.pool.pool();

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_integration_logs_type_created ON integration_logs(integration_type, created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_integration_logs_status_created ON integration_logs(status, created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_integration_logs_created ON integration_logs(created_at DESC)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql)
                .execute(pool)
                .await
                .map_err(store_error)?;
        }
        Ok(())
    }

    fn into_entries(rows: Vec<DbAuditLog>) -> Result<Vec<AuditLogEntry>> {
        rows.into_iter().map(AuditLogEntry::try_from).collect()
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn create(&self, entry: NewAuditEntry) -> Result<AuditLogEntry> {
        let event_id = entry.event_id.clone().unwrap_or_else(generate_log_id);
        let record = entry.into_entry(event_id, Utc::now())?;

        let result = sqlx::query(
            r#"
            INSERT INTO integration_logs (
                event_id, integration_type, direction, source, target, payload,
                transformed_resource, status, error, error_trace, topic, message_id,
                processing_time_ms, metadata, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
        )
        .bind(&record.event_id)
        .bind(record.integration_type.as_str())
        .bind(record.direction.as_str())
        .bind(&record.source)
        .bind(&record.target)
        .bind(&record.payload)
        .bind(json_text(record.transformed_resource.as_ref())?)
        .bind(record.status.as_str())
        .bind(&record.error)
        .bind(&record.error_trace)
        .bind(&record.topic)
        .bind(&record.message_id)
        .bind(record.processing_time_ms.map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)))
        .bind(json_text(record.metadata.as_ref())?)
        .bind(record.timestamp)
        .execute(self.pool.pool())
        .await;

        match result {
            Ok(_) => {
                self.logger.info(format!("Log created: {}", record.event_id));
                Ok(record)
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                self.logger
                    .warn(format!("Duplicate audit entry rejected: {}", record.event_id));
                Err(MedbridgeError::DuplicateEventId(record.event_id))
            }
            Err(e) => {
                self.logger.error(format!("Failed to create log: {}", e));
                Err(store_error(e))
            }
        }
    }

    async fn update(&self, event_id: &str, update: AuditUpdate) -> Result<AuditLogEntry> {
        let mut tx = self.pool.pool().begin().await.map_err(store_error)?;

        let row = sqlx::query_as::<_, DbAuditLog>(
            "SELECT * FROM integration_logs WHERE event_id = $1 FOR UPDATE",
        )
        .bind(event_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error)?;

        let Some(row) = row else {
            self.logger.warn(format!("Log not found: {}", event_id));
            return Err(MedbridgeError::NotFound(event_id.to_string()));
        };

        let mut entry = AuditLogEntry::try_from(row)?;
        entry.apply(update)?;

        sqlx::query(
            r#"
            UPDATE integration_logs
            SET target = $2, transformed_resource = $3, status = $4, error = $5,
                error_trace = $6, topic = $7, message_id = $8, processing_time_ms = $9,
                metadata = $10
            WHERE event_id = $1
        "#,
        )
        .bind(&entry.event_id)
        .bind(&entry.target)
        .bind(json_text(entry.transformed_resource.as_ref())?)
        .bind(entry.status.as_str())
        .bind(&entry.error)
        .bind(&entry.error_trace)
        .bind(&entry.topic)
        .bind(&entry.message_id)
        .bind(entry.processing_time_ms.map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)))
        .bind(json_text(entry.metadata.as_ref())?)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        tx.commit().await.map_err(store_error)?;

        self.logger.info(format!("Log updated: {}", event_id));
        Ok(entry)
    }

    async fn find_by_event_id(&self, event_id: &str) -> Result<Option<AuditLogEntry>> {
        let row = sqlx::query_as::<_, DbAuditLog>(
            "SELECT * FROM integration_logs WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(store_error)?;

        row.map(AuditLogEntry::try_from).transpose()
    }

    async fn find_recent(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>> {
        let rows = recent_query(query)
            .build_query_as::<DbAuditLog>()
            .fetch_all(self.pool.pool())
            .await
            .map_err(store_error)?;
        Self::into_entries(rows)
    }

    async fn find_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AuditLogEntry>> {
        let rows = sqlx::query_as::<_, DbAuditLog>(
            "SELECT * FROM integration_logs WHERE created_at BETWEEN $1 AND $2 ORDER BY created_at DESC",
        )
        .bind(start)
        .bind(end)
        .fetch_all(self.pool.pool())
        .await
        .map_err(store_error)?;
        Self::into_entries(rows)
    }

    async fn count_by_status(&self) -> Result<HashMap<AuditStatus, u64>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM integration_logs GROUP BY status",
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(store_error)?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status").map_err(store_error)?;
            let count: i64 = row.try_get("count").map_err(store_error)?;
            counts.insert(status.parse()?, u64::try_from(count).unwrap_or_default());
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
        let row = count_query(query)
            .build()
            .fetch_one(self.pool.pool())
            .await
            .map_err(store_error)?;
        let count: i64 = row.try_get(0).map_err(store_error)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn find_by_type(
        &self,
        integration_type: IntegrationType,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<AuditLogEntry>> {
        let rows = sqlx::query_as::<_, DbAuditLog>(
            "SELECT * FROM integration_logs WHERE integration_type = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(integration_type.as_str())
        .bind(to_i64(page_size))
        .bind(to_i64(page_offset(page, page_size)))
        .fetch_all(self.pool.pool())
        .await
        .map_err(store_error)?;
        Self::into_entries(rows)
    }

    async fn processing_stats(&self) -> Result<ProcessingStats> {
        let row = sqlx::query(
            r#"
            SELECT
                ROUND(AVG(processing_time_ms))::BIGINT AS avg_time,
                MIN(processing_time_ms) AS min_time,
                MAX(processing_time_ms) AS max_time,
                COUNT(*) AS count
            FROM integration_logs
            WHERE status = 'success' AND processing_time_ms IS NOT NULL
        "#,
        )
        .fetch_one(self.pool.pool())
        .await
        .map_err(store_error)?;

        let read = |column: &str| -> Result<u64> {
            let value: Option<i64> = row.try_get(column).map_err(store_error)?;
            Ok(value.and_then(|v| u64::try_from(v).ok()).unwrap_or_default())
        };
        Ok(ProcessingStats {
            avg_time_ms: read("avg_time")?,
            min_time_ms: read("min_time")?,
            max_time_ms: read("max_time")?,
            count: read("count")?,
        })
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM integration_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(self.pool.pool())
            .await
            .map_err(store_error)?;

        let removed = result.rows_affected();
        self.logger
            .info(format!("Purged {} audit entries older than {}", removed, cutoff));
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbridge_core::Direction;

    #[test]
    fn test_recent_query_without_filters() {
        let builder = recent_query(&AuditQuery::default());
        assert_eq!(
            builder.sql(),
            "SELECT * FROM integration_logs WHERE 1 = 1 ORDER BY created_at DESC LIMIT $1"
        );
    }

    #[test]
    fn test_recent_query_with_filters() {
        let query = AuditQuery::default()
            .with_type(IntegrationType::Hl7)
            .with_status(AuditStatus::Error)
            .with_direction(Direction::Inbound)
            .with_source("external-lab")
            .with_limit(5);
        let builder = recent_query(&query);
        assert_eq!(
            builder.sql(),
            "SELECT * FROM integration_logs WHERE 1 = 1 AND integration_type = $1 AND status = $2 AND direction = $3 AND source = $4 ORDER BY created_at DESC LIMIT $5"
        );
    }

    #[test]
    fn test_count_query_ignores_limit() {
        let query = AuditQuery::default().with_status(AuditStatus::Success);
        let builder = count_query(&query);
        assert_eq!(
            builder.sql(),
            "SELECT COUNT(*) FROM integration_logs WHERE 1 = 1 AND status = $1"
        );
    }
}
