//! MedBridge 服务主程序

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use medbridge_core::{AuditStore, LoggerRegistry};
use medbridge_database::{DatabasePool, PgAuditStore};
use medbridge_integration::{
    validate_routing, AmqpTransport, ApiServer, ApiState, EventPublisher, EventTransport,
    EventType, InMemoryAuditStore, InMemoryTransport, InboundMetrics, PipelineOrchestrator, Topic,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{AppConfig, StoreKind, TransportKind};

/// MedBridge 命令行参数
#[derive(Parser, Debug)]
#[command(name = "medbridge-server")]
#[command(about = "医疗外部数据接入网关：HL7/TISS/ERP 入站、FHIR 转换、审计与事件发布")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 日志级别（覆盖配置文件）
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 启动 HTTP 接入服务（默认）
    Serve,
    /// 打印主题、分区与消费组
    Topics,
    /// 清理过期审计记录
    Purge {
        /// 保留天数
        #[arg(long)]
        older_than_days: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // 初始化日志
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    validate_routing().context("Event routing table is incomplete")?;

    let logging = LoggerRegistry::new(config.service.source_name.clone());

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, logging).await,
        Command::Topics => {
            print_topics();
            Ok(())
        }
        Command::Purge { older_than_days } => purge(config, logging, older_than_days).await,
    }
}

async fn build_store(config: &AppConfig, logging: &LoggerRegistry) -> Result<Arc<dyn AuditStore>> {
    match config.store.kind {
        StoreKind::Memory => Ok(Arc::new(InMemoryAuditStore::new(logging))),
        StoreKind::Postgres => {
            let pool = DatabasePool::connect(&config.store.postgres)
                .await
                .context("Failed to connect to PostgreSQL")?;
            let store = PgAuditStore::new(pool, logging);
            store
                .create_tables()
                .await
                .context("Failed to prepare audit tables")?;
            Ok(Arc::new(store))
        }
    }
}

async fn build_transport(
    config: &AppConfig,
    logging: &LoggerRegistry,
) -> Result<Arc<dyn EventTransport>> {
    match config.transport.kind {
        TransportKind::Memory => Ok(Arc::new(InMemoryTransport::with_retention(
            config.transport.memory_retention,
            logging,
        ))),
        TransportKind::Amqp => {
            let transport = AmqpTransport::connect(config.transport.amqp.clone(), logging)
                .await
                .context("Failed to connect to message broker")?;
            transport
                .provision()
                .await
                .context("Failed to provision topics")?;
            Ok(Arc::new(transport))
        }
    }
}

async fn serve(config: AppConfig, logging: LoggerRegistry) -> Result<()> {
    info!("启动MedBridge服务...");

    let store = build_store(&config, &logging).await?;
    let transport = build_transport(&config, &logging).await?;
    let publisher = Arc::new(EventPublisher::new(transport, &logging));
    let metrics = InboundMetrics::new().context("Failed to register metrics")?;

    let pipeline = PipelineOrchestrator::new(store, publisher.clone(), metrics, &logging)
        .with_event_source(config.service.source_name.clone());

    info!("MedBridge服务配置:");
    info!("  监听地址: {}", config.bind_addr());
    info!("  事件传输: {}", publisher.transport_name());
    info!("  审计存储: {:?}", config.store.kind);

    let server = ApiServer::new(ApiState::new(Arc::new(pipeline)));
    server
        .run(&config.bind_addr(), shutdown_signal())
        .await
        .context("HTTP server failed")?;

    publisher.shutdown().await;
    info!("MedBridge服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn print_topics() {
    println!(
        "{:<24} {:>10} {:>11} {:>7}  {}",
        "TOPIC", "PARTITIONS", "REPLICATION", "EVENTS", "CONSUMER GROUP"
    );
    for topic in Topic::ALL {
        let config = topic.config();
        let routed = EventType::ALL
            .iter()
            .filter(|event_type| event_type.topic() == topic)
            .count();
        println!(
            "{:<24} {:>10} {:>11} {:>7}  {}",
            topic.as_str(),
            config.partitions,
            config.replication_factor,
            routed,
            topic.consumer_group()
        );
    }
}

async fn purge(config: AppConfig, logging: LoggerRegistry, older_than_days: u32) -> Result<()> {
    if config.store.kind == StoreKind::Memory {
        warn!("Audit store is in-memory, nothing to purge");
        return Ok(());
    }

    let store = build_store(&config, &logging).await?;
    let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(older_than_days));
    let removed = store
        .delete_older_than(cutoff)
        .await
        .context("Failed to purge audit entries")?;

    info!("已清理 {} 条审计记录（早于 {}）", removed, cutoff.to_rfc3339());
    Ok(())
}
