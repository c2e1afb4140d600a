pub mod log_level;

pub use log_level::LogLevel;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, ObservabilityConfig};

/// 初始化日志系统
///
/// `RUST_LOG` 优先于配置中的日志级别。
pub fn init_logging(config: &ObservabilityConfig) -> anyhow::Result<()> {
    let level: LogLevel = config
        .log_level
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("初始化JSON日志格式失败")?,
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("初始化Pretty日志格式失败")?,
    }

    Ok(())
}
