mod app;
mod shutdown;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use scheduler_core::config::{AppConfig, LogFormat};
use scheduler_core::logging::init_logging;

use crate::app::Application;
use crate::shutdown::{wait_for_shutdown_signal, ShutdownManager};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "scheduler")]
#[command(version)]
#[command(about = "分布式作业调度服务")]
#[command(long_about = "从待调度队列中选取作业请求，为其在Ant上预留资源并下发执行")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config/scheduler.toml")]
    config: String,

    /// 覆盖配置中的日志级别 (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// 覆盖配置中的日志格式 (pretty, json)
    #[arg(long)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 启动调度服务（默认）
    Run,
    /// 校验配置并打印合并后的结果
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(Some(cli.config.as_str()))
        .with_context(|| format!("加载配置文件失败: {}", cli.config))?;
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.observability.log_format = format;
    }
    config.validate()?;

    if let Some(Command::CheckConfig) = cli.command {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    init_logging(&config.observability)?;
    if config.observability.metrics_enabled {
        install_metrics_exporter(&config.observability.metrics_listen_addr)?;
    }

    info!("配置文件: {}", cli.config);
    let app = Arc::new(Application::new(config).await?);
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e:#}");
            }
        })
    };

    wait_for_shutdown_signal().await?;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("作业调度服务已退出");
    Ok(())
}

fn install_metrics_exporter(listen_addr: &str) -> Result<()> {
    let addr: SocketAddr = listen_addr
        .parse()
        .with_context(|| format!("无效的指标监听地址: {listen_addr}"))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("安装Prometheus导出器失败: {e}"))?;
    info!("Prometheus指标导出已启用: {addr}");
    Ok(())
}
