//! # PACS管理模块
//!
//! 运维相关的公共功能：分层配置加载与验证、日志初始化。

pub mod config;
pub mod logging;

pub use config::{
    ConfigManager, ConfigValidator, DatabaseSection, LoggingConfig, PacsConfig, ServerConfig,
    SyncSection,
};
pub use logging::init_logging;
