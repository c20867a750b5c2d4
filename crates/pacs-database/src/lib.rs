//! # PACS数据库模块
//!
//! 本地影像元数据缓存：SQLite连接池、表结构、检查/系列/实例的幂等写入，
//! 以及同步游标的持久化（比较后写入，保证游标不回退）。

pub mod connection;
pub mod models;
pub mod queries;

// 重新导出主要类型
pub use connection::{DatabaseConfig, DatabasePool};
pub use models::*;
pub use queries::{CacheStats, DatabaseQueries, LAST_CHANGE_SEQ_KEY};
