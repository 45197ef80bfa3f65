//! 服务配置
//!
//! 加载顺序：内置默认值 → 配置文件（可选）→ `MEDBRIDGE__` 前缀的环境变量。

use ::config::{Config, Environment, File};
use medbridge_core::{MedbridgeError, Result};
use medbridge_database::DatabaseConfig;
use medbridge_integration::{AmqpConfig, DEFAULT_MEMORY_RETENTION};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// EnvFilter 语法，如 `info` 或 `medbridge_integration=debug`
    pub level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Memory,
    Amqp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    pub kind: TransportKind,
    /// 进程内传输每个分区保留的消息数
    pub memory_retention: usize,
    pub amqp: AmqpConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    pub kind: StoreKind,
    pub postgres: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// 事件信封中的 source
    pub source_name: String,
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub transport: TransportSettings,
    pub store: StoreSettings,
    pub service: ServiceSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 3010,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
            transport: TransportSettings {
                kind: TransportKind::Memory,
                memory_retention: DEFAULT_MEMORY_RETENTION,
                amqp: AmqpConfig::default(),
            },
            store: StoreSettings {
                kind: StoreKind::Memory,
                postgres: DatabaseConfig::default(),
            },
            service: ServiceSettings {
                source_name: "integration-service".to_string(),
            },
        }
    }
}

fn config_error(err: ::config::ConfigError) -> MedbridgeError {
    MedbridgeError::Config(err.to_string())
}

impl AppConfig {
    /// 加载并校验配置
    pub fn load(path: Option<&str>) -> Result<Self> {
        let defaults = Config::try_from(&AppConfig::default()).map_err(config_error)?;

        let mut builder = Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("MEDBRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?;

        let config: AppConfig = settings.try_deserialize().map_err(config_error)?;
        config.validate()?;

        tracing::debug!("Configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(MedbridgeError::Config("server.port must be non-zero".to_string()));
        }
        if self.server.host.trim().is_empty() {
            return Err(MedbridgeError::Config("server.host must not be empty".to_string()));
        }
        if self.service.source_name.trim().is_empty() {
            return Err(MedbridgeError::Config(
                "service.source_name must not be empty".to_string(),
            ));
        }
        if self.transport.kind == TransportKind::Memory && self.transport.memory_retention == 0 {
            return Err(MedbridgeError::Config(
                "transport.memory_retention must be non-zero".to_string(),
            ));
        }
        if self.transport.kind == TransportKind::Amqp {
            if self.transport.amqp.url.trim().is_empty() {
                return Err(MedbridgeError::Config(
                    "transport.amqp.url is required for the amqp transport".to_string(),
                ));
            }
            if self.transport.amqp.exchange.trim().is_empty() {
                return Err(MedbridgeError::Config(
                    "transport.amqp.exchange must not be empty".to_string(),
                ));
            }
        }
        if self.store.kind == StoreKind::Postgres {
            if self.store.postgres.url.trim().is_empty() {
                return Err(MedbridgeError::Config(
                    "store.postgres.url is required for the postgres store".to_string(),
                ));
            }
            if self.store.postgres.max_connections == 0 {
                return Err(MedbridgeError::Config(
                    "store.postgres.max_connections must be non-zero".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
