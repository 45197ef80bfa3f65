//! 入站处理指标

use medbridge_core::{IntegrationType, MedbridgeError, Result};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

fn metrics_error(err: prometheus::Error) -> MedbridgeError {
    MedbridgeError::Metrics(err.to_string())
}

/// 入站指标收集器
#[derive(Clone)]
pub struct InboundMetrics {
    registry: Registry,
    /// 按类型与结果计数
    inbound_total: IntCounterVec,
    /// 处理耗时
    inbound_duration: HistogramVec,
}

impl InboundMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let inbound_total = IntCounterVec::new(
            Opts::new("medbridge_inbound_total", "Total number of inbound messages"),
            &["type", "status"],
        )
        .map_err(metrics_error)?;

        let inbound_duration = HistogramVec::new(
            HistogramOpts::new(
                "medbridge_inbound_duration_seconds",
                "Inbound processing duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["type"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(inbound_total.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(inbound_duration.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            inbound_total,
            inbound_duration,
        })
    }

    /// 记录一次处理结果；格式未识别时类型记为 unknown
    pub fn record(&self, integration_type: Option<IntegrationType>, success: bool, elapsed: Duration) {
        let type_label = integration_type.map(|t| t.as_str()).unwrap_or("unknown");
        let status_label = if success { "success" } else { "error" };

        self.inbound_total
            .with_label_values(&[type_label, status_label])
            .inc();
        self.inbound_duration
            .with_label_values(&[type_label])
            .observe(elapsed.as_secs_f64());
    }

    pub fn count(&self, integration_type: &str, status: &str) -> u64 {
        self.inbound_total
            .with_label_values(&[integration_type, status])
            .get()
    }

    /// Prometheus 文本格式导出
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).map_err(metrics_error)?;

        String::from_utf8(buffer).map_err(|e| MedbridgeError::Metrics(e.to_string()))
    }
}
