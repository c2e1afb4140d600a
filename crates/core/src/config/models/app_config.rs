use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    database::DatabaseConfig, jobs::JobsConfig, message_queue::MessageQueueConfig,
    observability::ObservabilityConfig,
};

fn default_server_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "job-scheduler".to_string())
}

/// 调度服务的完整配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 当前调度器实例的标识，用于领导者租约
    pub server_id: String,
    pub jobs: JobsConfig,
    pub database: DatabaseConfig,
    pub message_queue: MessageQueueConfig,
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            jobs: JobsConfig::default(),
            database: DatabaseConfig::default(),
            message_queue: MessageQueueConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// 未指定配置文件时依次尝试的位置
const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/scheduler.toml",
    "scheduler.toml",
    "/etc/scheduler/config.toml",
];

impl AppConfig {
    /// 合并默认值、配置文件与环境变量
    ///
    /// 环境变量以 `SCHEDULER_` 开头，嵌套字段用 `__` 连接，
    /// 例如 `SCHEDULER_JOBS__PENDING_BATCH_SIZE=200`。显式给出的路径不存在时报错。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = match config_path {
            Some(path) if !Path::new(path).exists() => {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            Some(path) => Some(path),
            None => DEFAULT_CONFIG_PATHS
                .into_iter()
                .find(|p| Path::new(p).exists()),
        };

        let mut builder = ConfigBuilder::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }
        let config: AppConfig = builder
            .add_source(
                Environment::with_prefix("SCHEDULER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// 从TOML字符串解析，不读取环境变量
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// 逐节校验，错误信息带上所属配置节
    pub fn validate(&self) -> Result<()> {
        if self.server_id.is_empty() {
            return Err(anyhow::anyhow!("server_id不能为空"));
        }

        self.jobs.validate().context("作业调度配置验证失败")?;

        self.database.validate().context("数据库配置验证失败")?;

        self.message_queue
            .validate()
            .context("消息队列配置验证失败")?;

        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}
