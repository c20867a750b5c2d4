//! 日志初始化

use crate::config::LoggingConfig;
use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

/// 构造日志过滤器，`RUST_LOG` 优先于配置
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("Invalid log filter: {}", level)),
    }
}

/// 初始化全局 `tracing` 订阅器，只能调用一次
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(&config.level)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let result = match config.format.as_str() {
        "pretty" => builder.pretty().try_init(),
        "full" => builder.try_init(),
        _ => builder.compact().try_init(),
    };
    result.map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_accepts_directives() {
        assert!(EnvFilter::try_new("info").is_ok());
        assert!(EnvFilter::try_new("pacs_sync=debug,info").is_ok());
    }

    #[test]
    fn test_init_twice_fails() {
        let config = LoggingConfig::default();
        // 第一次调用的结果取决于其他测试是否已初始化
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
