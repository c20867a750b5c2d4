//! # PACS同步模块
//!
//! 让本地缓存与远端PACS保持一致：
//! - 全量同步：批量拉取所有检查、系列和实例，并把游标重置到远端当前最大序号
//! - 增量监听：每5秒轮询变更日志，按序号顺序应用新建/稳定/删除事件
//! - 同步协调器：启动时全量同步、每24小时重复、仅启动一次监听器，支持手动同步
//!
//! 全量同步与监听器通过共享的 [`SyncState`] 互斥，游标通过存储层的比较写入保证不回退。

pub mod coordinator;
pub mod full_sync;
pub mod metrics;
pub mod source;
pub mod state;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

// 重新导出主要类型
pub use coordinator::{SyncCoordinator, SyncNowResponse, SyncSettings};
pub use full_sync::{FullSyncEngine, FullSyncReport};
pub use metrics::SyncMetrics;
pub use source::ChangeSource;
pub use state::{CycleBlocked, SyncLockGuard, SyncState, SyncStatus};
pub use watcher::{BatchSummary, PollOutcome, Watcher, WatcherSettings};
