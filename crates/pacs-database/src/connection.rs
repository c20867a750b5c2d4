//! 数据库连接管理

use pacs_core::{PacsError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// 数据库连接配置
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// 连接字符串，例如 `sqlite://db/studies.db` 或 `sqlite::memory:`
    pub url: String,
    /// 最大连接数
    pub max_connections: u32,
    /// 获取连接的超时时间
    pub connect_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://db/studies.db".to_string(),
            max_connections: 5,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// 数据库连接池
#[derive(Debug, Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// 按配置打开连接池，必要时创建数据库文件及其目录
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let in_memory = config.url.contains(":memory:");

        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| PacsError::Config(format!("无效的数据库连接字符串 {}: {}", config.url, e)))?
            .create_if_missing(true)
            .foreign_keys(true);

        if !in_memory {
            if let Some(parent) = database_file(&config.url).and_then(Path::parent) {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // 内存数据库随最后一个连接关闭而消失，只保留一个常驻连接
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options
            .acquire_timeout(config.connect_timeout)
            .connect_with(options)
            .await
            .map_err(|e| PacsError::Database(format!("无法连接数据库 {}: {}", config.url, e)))?;

        tracing::info!("Connected to database: {}", config.url);
        Ok(Self { pool })
    }

    /// 打开一个内存数据库
    pub async fn in_memory() -> Result<Self> {
        Self::new(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    /// 获取底层连接池
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 关闭连接池
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// 从连接字符串中提取数据库文件路径
fn database_file(url: &str) -> Option<&Path> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        None
    } else {
        Some(Path::new(path))
    }
}
