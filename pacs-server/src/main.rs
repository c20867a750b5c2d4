//! PACS同步服务主程序

use anyhow::{Context, Result};
use clap::Parser;
use pacs_admin::{init_logging, ConfigManager};
use pacs_database::{DatabasePool, DatabaseQueries};
use pacs_integration::{ApiServer, ApiState, OrthancClient};
use pacs_sync::SyncCoordinator;
use std::sync::Arc;
use tracing::{info, warn};

/// PACS同步服务命令行参数
#[derive(Parser, Debug)]
#[command(name = "pacs-server")]
#[command(about = "Orthanc 影像缓存同步服务")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 管理API端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 本地缓存数据库连接字符串
    #[arg(long)]
    database_url: Option<String>,

    /// Orthanc地址
    #[arg(long)]
    orthanc_url: Option<String>,

    /// 日志级别
    #[arg(short, long)]
    log_level: Option<String>,

    /// 启动时不执行全量同步
    #[arg(long)]
    skip_initial_sync: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut manager = ConfigManager::new(args.config.as_deref())?;
    manager.update(|config| {
        if let Some(port) = args.port {
            config.server.port = port;
        }
        if let Some(url) = &args.database_url {
            config.database.url = url.clone();
        }
        if let Some(url) = &args.orthanc_url {
            config.orthanc.url = url.clone();
        }
        if let Some(level) = &args.log_level {
            config.logging.level = level.clone();
        }
        if args.skip_initial_sync {
            config.sync.sync_on_startup = false;
        }
    })?;
    init_logging(&manager.config().logging)?;

    info!("启动PACS同步服务...");
    if let Some(path) = manager.config_path() {
        info!("  配置文件: {}", path);
    }
    let config = manager.into_config();
    info!("  Orthanc: {}", config.orthanc.url);
    info!("  数据库: {}", config.database.url);
    info!("  管理API: {}", config.server.bind_address());

    let database = DatabasePool::new(&config.database.to_pool_config())
        .await
        .context("Failed to open local cache database")?;
    DatabaseQueries::new(&database)
        .create_tables()
        .await
        .context("Failed to create cache schema")?;

    let orthanc = Arc::new(OrthancClient::new(&config.orthanc)?);
    if let Err(e) = orthanc.check_connection().await {
        // 远端暂时不可达时继续启动，监听器会在恢复后追上
        warn!("Orthanc at {} is not reachable yet: {}", orthanc.base_url(), e);
    }

    let coordinator = Arc::new(SyncCoordinator::new(
        database.clone(),
        orthanc.clone(),
        config.sync.to_settings(),
    )?);
    coordinator.start().await;

    let server = ApiServer::new(ApiState::new(coordinator.clone()).with_orthanc(orthanc));
    let served = server
        .run(&config.server.bind_address(), shutdown_signal())
        .await;

    info!("正在停止同步服务...");
    coordinator.shutdown().await;
    database.close().await;

    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("收到停止信号");
}
