//! MedBridge 入站流水线演示程序
//!
//! 展示完整的进程内链路：
//! - HL7 ORU^R01 转换为 FHIR Observation
//! - TISS / ERP 原样封装
//! - 审计记录与事件订阅

use anyhow::Result;
use async_trait::async_trait;
use medbridge_core::{AuditQuery, AuditStore, LoggerRegistry};
use medbridge_integration::{
    EventHandler, EventPublisher, InMemoryAuditStore, InMemoryTransport, InboundMetrics,
    InboundRequest, IntegrationEvent, PipelineOrchestrator, Topic,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const ORU_MESSAGE: &str = "MSH|^~\\&|LAB|ExtLab|||20250126||ORU^R01|MSG001|P|2.5\r\
PID|1||P001||Silva^João||19900101|M\r\
OBR|1||ORD001|GLU^Glicose\r\
OBX|1|NM|GLU^Glucose^LOINC||95|mg/dL|70-100|N";

/// 打印收到的集成事件
struct PrintingHandler;

#[async_trait]
impl EventHandler for PrintingHandler {
    async fn handle(&self, event: IntegrationEvent) -> medbridge_core::Result<()> {
        info!(
            "📨 收到事件 {} ({}) resourceType={}",
            event.event_id, event.event_type, event.resource_type
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("🚀 启动MedBridge入站流水线演示");

    let logging = LoggerRegistry::new("integration-service");
    let audit = Arc::new(InMemoryAuditStore::new(&logging));
    let transport = Arc::new(InMemoryTransport::new(&logging));
    let publisher = Arc::new(EventPublisher::new(transport, &logging));
    publisher
        .subscribe(Topic::Integration, Arc::new(PrintingHandler))
        .await?;

    let pipeline = PipelineOrchestrator::new(
        audit.clone(),
        publisher.clone(),
        InboundMetrics::new()?,
        &logging,
    );

    let requests = vec![
        ("HL7", InboundRequest::new(ORU_MESSAGE).with_source("ext-lab")),
        (
            "TISS",
            InboundRequest::new("<guia><numero>123</numero></guia>"),
        ),
        (
            "ERP",
            InboundRequest::new(r#"{"invoice": "INV-42", "amount": 180.5}"#),
        ),
        ("HL7 (非数值结果)", InboundRequest::new(ORU_MESSAGE.replace("||95|", "||POS|"))),
        ("未知格式", InboundRequest::new("just some text")),
    ];

    for (label, request) in requests {
        match pipeline.process_inbound(request).await {
            Ok(response) => {
                info!("✅ {} 处理成功: eventId={}", label, response.event_id);
                info!("   {}", serde_json::to_string(&response.resource)?);
            }
            Err(e) => warn!("❌ {} 处理失败: {}", label, e),
        }
    }

    // 等待订阅者处理完
    tokio::time::sleep(Duration::from_millis(100)).await;

    let recent = audit.find_recent(&AuditQuery::default()).await?;
    info!("\n📋 审计记录 ({} 条)", recent.len());
    for entry in recent {
        info!(
            "   {} {} {} {}",
            entry.integration_type,
            entry.status,
            entry.source,
            entry.error.unwrap_or_default()
        );
    }

    let stats = audit.processing_stats().await?;
    info!(
        "📊 成功 {} 条, 平均耗时 {}ms",
        stats.count, stats.avg_time_ms
    );

    publisher.shutdown().await;
    info!("✅ 演示完成");
    Ok(())
}
