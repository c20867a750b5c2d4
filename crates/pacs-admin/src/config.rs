//! 配置管理
//!
//! 配置按以下顺序叠加，后者覆盖前者：
//! 1. 内置默认值
//! 2. 配置文件（TOML/JSON/YAML，按扩展名识别）
//! 3. `PACS__` 前缀的环境变量，例如 `PACS__SYNC__WATCH_INTERVAL_MS=2000`
//! 4. 兼容旧部署的环境变量 `ORTHANC_URL`、`ORTHANC_USERNAME`、`ORTHANC_PASSWORD`、`DB_PATH`

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use pacs_database::DatabaseConfig;
use pacs_integration::OrthancConfig;
use pacs_sync::SyncSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info};

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    config: PacsConfig,
    config_path: Option<String>,
    validator: ConfigValidator,
}

/// 服务完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PacsConfig {
    pub server: ServerConfig,
    pub database: DatabaseSection,
    pub orthanc: OrthancConfig,
    pub sync: SyncSection,
    pub logging: LoggingConfig,
}

/// 管理API监听配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// 本地缓存数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// 连接字符串，例如 `sqlite://db/studies.db`
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

/// 同步调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub watch_interval_ms: u64,
    pub change_batch_limit: u32,
    pub full_sync_interval_secs: u64,
    pub sync_on_startup: bool,
    pub prune_missing: bool,
    pub max_event_retries: u32,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` 过滤指令，例如 `info` 或 `pacs_sync=debug,info`
    pub level: String,
    /// 输出格式：`compact`、`pretty` 或 `full`
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite://db/studies.db".to_string(),
            max_connections: 5,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for SyncSection {
    fn default() -> Self {
        let settings = SyncSettings::default();
        Self {
            watch_interval_ms: settings.watch_interval.as_millis() as u64,
            change_batch_limit: settings.change_batch_limit,
            full_sync_interval_secs: settings.full_sync_interval.as_secs(),
            sync_on_startup: settings.sync_on_startup,
            prune_missing: settings.prune_missing,
            max_event_retries: settings.max_event_retries,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl DatabaseSection {
    pub fn to_pool_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            url: self.url.clone(),
            max_connections: self.max_connections,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

impl SyncSection {
    pub fn to_settings(&self) -> SyncSettings {
        SyncSettings {
            watch_interval: Duration::from_millis(self.watch_interval_ms),
            change_batch_limit: self.change_batch_limit,
            full_sync_interval: Duration::from_secs(self.full_sync_interval_secs),
            sync_on_startup: self.sync_on_startup,
            prune_missing: self.prune_missing,
            max_event_retries: self.max_event_retries,
        }
    }
}

impl ConfigManager {
    /// 从可选的配置文件和进程环境变量加载配置
    pub fn new(config_path: Option<&str>) -> Result<Self> {
        Self::with_env(config_path, std::env::vars().collect())
    }

    /// 使用给定的环境变量集合加载配置
    pub fn with_env(config_path: Option<&str>, env: HashMap<String, String>) -> Result<Self> {
        let config = Self::load_config(config_path, env)?;
        let validator = ConfigValidator::new();
        validator.validate(&config)?;

        Ok(Self {
            config,
            config_path: config_path.map(str::to_string),
            validator,
        })
    }

    fn load_config(config_path: Option<&str>, env: HashMap<String, String>) -> Result<PacsConfig> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path));
        }

        for (key, value) in legacy_overrides(&env) {
            builder = builder
                .set_override(key, value)
                .context("Failed to apply legacy environment override")?;
        }

        let settings = builder
            .add_source(
                Environment::with_prefix("PACS")
                    .separator("__")
                    .try_parsing(true)
                    .source(Some(env)),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: PacsConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        match config_path {
            Some(path) => info!("Configuration loaded from: {}", path),
            None => info!("Configuration loaded from defaults and environment"),
        }
        Ok(config)
    }

    pub fn config(&self) -> &PacsConfig {
        &self.config
    }

    pub fn config_path(&self) -> Option<&str> {
        self.config_path.as_deref()
    }

    /// 应用命令行等外部覆盖后重新验证
    pub fn update<F>(&mut self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut PacsConfig),
    {
        let mut updated = self.config.clone();
        apply(&mut updated);
        self.validator.validate(&updated)?;
        self.config = updated;
        Ok(())
    }

    pub fn into_config(self) -> PacsConfig {
        self.config
    }
}

/// 旧部署使用的环境变量
fn legacy_overrides(env: &HashMap<String, String>) -> Vec<(&'static str, String)> {
    let mut overrides = Vec::new();
    for (var, key) in [
        ("ORTHANC_URL", "orthanc.url"),
        ("ORTHANC_USERNAME", "orthanc.username"),
        ("ORTHANC_PASSWORD", "orthanc.password"),
    ] {
        if let Some(value) = env.get(var) {
            overrides.push((key, value.clone()));
        }
    }
    if let Some(path) = env.get("DB_PATH").filter(|p| !p.is_empty()) {
        overrides.push(("database.url", format!("sqlite://{}", path)));
    }
    overrides
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    validation_rules: Vec<ValidationRule>,
}

#[derive(Debug)]
struct ValidationRule {
    field_path: &'static str,
    validator: fn(&PacsConfig) -> Result<()>,
}

impl ConfigValidator {
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "server.port",
                validator: |config| {
                    anyhow::ensure!(config.server.port != 0, "Server port cannot be 0");
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "database.url",
                validator: |config| {
                    anyhow::ensure!(
                        config.database.url.starts_with("sqlite:"),
                        "Only sqlite URLs are supported, got {}",
                        config.database.url
                    );
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "database.max_connections",
                validator: |config| {
                    anyhow::ensure!(config.database.max_connections > 0, "Database max connections cannot be 0");
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "orthanc.url",
                validator: |config| {
                    let url = &config.orthanc.url;
                    anyhow::ensure!(
                        url.starts_with("http://") || url.starts_with("https://"),
                        "Orthanc URL must start with http:// or https://, got {}",
                        url
                    );
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "sync.watch_interval_ms",
                validator: |config| {
                    anyhow::ensure!(config.sync.watch_interval_ms > 0, "Watch interval cannot be 0");
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "sync.full_sync_interval_secs",
                validator: |config| {
                    anyhow::ensure!(config.sync.full_sync_interval_secs > 0, "Full sync interval cannot be 0");
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "sync.change_batch_limit",
                validator: |config| {
                    anyhow::ensure!(
                        (1..=1000).contains(&config.sync.change_batch_limit),
                        "Change batch limit must be between 1 and 1000"
                    );
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "sync.max_event_retries",
                validator: |config| {
                    anyhow::ensure!(config.sync.max_event_retries > 0, "Max event retries cannot be 0");
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "logging.format",
                validator: |config| {
                    anyhow::ensure!(
                        matches!(config.logging.format.as_str(), "compact" | "pretty" | "full"),
                        "Unknown log format: {}",
                        config.logging.format
                    );
                    Ok(())
                },
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置，返回第一个失败的规则
    pub fn validate(&self, config: &PacsConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(e.context(format!("Invalid configuration value: {}", rule.field_path)));
            }
        }
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}
