//! 组件级日志
//!
//! 进程启动时创建一个 [`LoggerRegistry`]，显式传给各组件；
//! 每个组件在构造时通过 `scoped` 拿到带组件名的 [`ComponentLogger`]。

use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 应用生命周期内的日志注册表
#[derive(Debug, Clone)]
pub struct LoggerRegistry {
    service: Arc<str>,
}

impl LoggerRegistry {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: Arc::from(service.into()),
        }
    }

    /// 为组件创建日志器
    pub fn scoped(&self, component: &'static str) -> ComponentLogger {
        ComponentLogger {
            service: Arc::clone(&self.service),
            component,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

impl Default for LoggerRegistry {
    fn default() -> Self {
        Self::new("integration-service")
    }
}

/// 带组件上下文的分级日志器
#[derive(Debug, Clone)]
pub struct ComponentLogger {
    service: Arc<str>,
    component: &'static str,
}

impl ComponentLogger {
    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn info(&self, message: impl Display) {
        info!(service = %self.service, component = self.component, "{}", message);
    }

    pub fn warn(&self, message: impl Display) {
        warn!(service = %self.service, component = self.component, "{}", message);
    }

    pub fn error(&self, message: impl Display) {
        error!(service = %self.service, component = self.component, "{}", message);
    }

    pub fn debug(&self, message: impl Display) {
        debug!(service = %self.service, component = self.component, "{}", message);
    }
}
