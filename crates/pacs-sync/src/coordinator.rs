//! 同步协调器
//!
//! 进程启动时调用一次 [`SyncCoordinator::start`]：立即执行全量同步并每24小时重复，
//! 同时启动唯一的增量监听器。管理接口通过 [`SyncCoordinator::sync_now`] 手动触发全量同步。

use crate::full_sync::FullSyncEngine;
use crate::metrics::SyncMetrics;
use crate::source::ChangeSource;
use crate::state::{SyncState, SyncStatus};
use crate::watcher::{Watcher, WatcherSettings};
use pacs_core::{PacsError, Result};
use pacs_database::{DatabasePool, DatabaseQueries};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 同步调度配置
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// 监听器轮询间隔
    pub watch_interval: Duration,
    /// 每次请求的最大变更数
    pub change_batch_limit: u32,
    /// 周期性全量同步间隔
    pub full_sync_interval: Duration,
    /// 启动时立即执行全量同步
    pub sync_on_startup: bool,
    /// 全量同步时删除远端已不存在的检查
    pub prune_missing: bool,
    /// 非瞬时错误的事件最多尝试次数
    pub max_event_retries: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            watch_interval: Duration::from_millis(5000),
            change_batch_limit: 100,
            full_sync_interval: Duration::from_secs(24 * 60 * 60),
            sync_on_startup: true,
            prune_missing: true,
            max_event_retries: 3,
        }
    }
}

/// 手动同步的结果
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SyncNowResponse {
    pub success: bool,
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct SyncCoordinator {
    database: DatabasePool,
    state: Arc<SyncState>,
    metrics: Arc<SyncMetrics>,
    engine: Arc<FullSyncEngine>,
    watcher: Arc<Watcher>,
    settings: SyncSettings,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncCoordinator {
    pub fn new(database: DatabasePool, source: Arc<dyn ChangeSource>, settings: SyncSettings) -> Result<Self> {
        if settings.watch_interval.is_zero() || settings.full_sync_interval.is_zero() {
            return Err(PacsError::Config("同步间隔必须大于0".to_string()));
        }

        let state = Arc::new(SyncState::new());
        let metrics = Arc::new(SyncMetrics::new()?);

        let engine = Arc::new(FullSyncEngine::new(
            database.clone(),
            source.clone(),
            state.clone(),
            metrics.clone(),
            settings.prune_missing,
        ));
        let watcher = Arc::new(Watcher::new(
            database.clone(),
            source,
            state.clone(),
            metrics.clone(),
            WatcherSettings {
                interval: settings.watch_interval,
                batch_limit: settings.change_batch_limit.max(1),
                max_event_retries: settings.max_event_retries.max(1),
            },
        ));

        Ok(Self {
            database,
            state,
            metrics,
            engine,
            watcher,
            settings,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// 启动全量同步调度和增量监听器
    ///
    /// 重复调用不会再启动新的任务，返回 `false`。
    pub async fn start(&self) -> bool {
        if !self.state.mark_started() {
            warn!("Sync coordinator already started");
            return false;
        }

        let scheduler = tokio::spawn(schedule_full_sync(
            self.engine.clone(),
            self.settings.full_sync_interval,
            self.settings.sync_on_startup,
            self.cancel.child_token(),
        ));
        let watcher = tokio::spawn(self.watcher.clone().run(self.cancel.child_token()));

        self.tasks.lock().await.extend([scheduler, watcher]);
        info!(
            "Sync coordinator started (full sync every {:?}, watcher every {:?})",
            self.settings.full_sync_interval, self.settings.watch_interval
        );
        true
    }

    /// 立即执行一次全量同步，错误折叠进返回值
    ///
    /// 同步在独立任务中运行，调用方被取消时同步照常完成。
    pub async fn sync_now(&self) -> SyncNowResponse {
        let engine = self.engine.clone();
        let outcome = match tokio::spawn(async move { engine.run().await }).await {
            Ok(result) => result,
            Err(e) => Err(PacsError::Internal(format!("全量同步任务异常退出: {}", e))),
        };
        match outcome {
            Ok(report) => SyncNowResponse {
                success: true,
                total: report.studies,
                error: None,
            },
            Err(e) => SyncNowResponse {
                success: false,
                total: 0,
                error: Some(e.to_string()),
            },
        }
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        let cursor = DatabaseQueries::new(&self.database).get_cursor().await?;
        Ok(self.state.snapshot(cursor).await)
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    pub fn database(&self) -> &DatabasePool {
        &self.database
    }

    /// 停止所有后台任务，等待正在进行的周期结束
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Sync task ended abnormally: {}", e);
            }
        }
        info!("Sync coordinator stopped");
    }
}

async fn schedule_full_sync(
    engine: Arc<FullSyncEngine>,
    period: Duration,
    run_immediately: bool,
    cancel: CancellationToken,
) {
    let first = if run_immediately { Instant::now() } else { Instant::now() + period };
    let mut interval = tokio::time::interval_at(first, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match engine.run().await {
                    Ok(_) => {}
                    Err(PacsError::SyncInProgress) => info!("Scheduled full sync skipped: another one is running"),
                    // 失败已在引擎中记录，等待下一个周期
                    Err(_) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_database, FakeSource};
    use pacs_core::ChangeType;

    fn settings() -> SyncSettings {
        SyncSettings {
            watch_interval: Duration::from_millis(20),
            ..SyncSettings::default()
        }
    }

    #[tokio::test]
    async fn test_start_runs_full_sync_and_watcher() {
        let db = test_database().await;
        let source = Arc::new(FakeSource::new());
        source.add_study("st1", "A");
        source.add_study("st2", "B");
        source.set_last(42);

        let coordinator = SyncCoordinator::new(db.clone(), source.clone(), settings()).unwrap();
        assert!(coordinator.start().await);
        assert!(!coordinator.start().await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        source.add_study("st3", "C");
        source.push_change(43, ChangeType::NewStudy, "st3");
        tokio::time::sleep(Duration::from_millis(100)).await;
        coordinator.shutdown().await;

        let queries = DatabaseQueries::new(&db);
        assert_eq!(queries.cache_stats().await.unwrap().studies, 3);
        assert_eq!(queries.get_cursor().await.unwrap(), Some(43));
        assert_eq!(source.since_requests().last(), Some(&43));

        let status = coordinator.status().await.unwrap();
        assert!(status.started);
        assert_eq!(status.last_full_sync.map(|r| r.studies), Some(2));
    }

    #[tokio::test]
    async fn test_sync_now_reports_total() {
        let db = test_database().await;
        let source = Arc::new(FakeSource::new());
        source.add_study("st1", "A");
        source.add_study("st2", "B");
        source.add_study("st3", "C");

        let coordinator = SyncCoordinator::new(db, source, settings()).unwrap();
        let response = coordinator.sync_now().await;

        assert_eq!(response, SyncNowResponse { success: true, total: 3, error: None });
    }

    #[tokio::test]
    async fn test_sync_now_folds_errors() {
        let db = test_database().await;
        let source = Arc::new(FakeSource::new());
        source.set_offline(true);

        let coordinator = SyncCoordinator::new(db, source, settings()).unwrap();
        let response = coordinator.sync_now().await;

        assert!(!response.success);
        assert_eq!(response.total, 0);
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn test_sync_now_rejected_while_running() {
        let db = test_database().await;
        let coordinator = SyncCoordinator::new(db, Arc::new(FakeSource::new()), settings()).unwrap();

        let _lock = coordinator.state.acquire_sync_lock().await.unwrap();
        let response = coordinator.sync_now().await;
        assert!(!response.success);
        assert_eq!(response.error, Some(PacsError::SyncInProgress.to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_sync_now_still_completes() {
        let db = test_database().await;
        let source = Arc::new(FakeSource::new());
        source.add_study("st1", "A");
        source.set_last(7);
        let coordinator = SyncCoordinator::new(db.clone(), source, settings()).unwrap();

        // 监听器周期占住写入闸门，调用方在等待期间放弃
        let cycle = coordinator.state.try_begin_cycle().unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(20), coordinator.sync_now()).await;
        assert!(waited.is_err());

        drop(cycle);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!coordinator.state.is_syncing());
        assert_eq!(DatabaseQueries::new(&db).get_cursor().await.unwrap(), Some(7));
        assert!(coordinator.sync_now().await.success);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let db = test_database().await;
        let result = SyncCoordinator::new(
            db,
            Arc::new(FakeSource::new()),
            SyncSettings {
                watch_interval: Duration::ZERO,
                ..SyncSettings::default()
            },
        );
        assert!(matches!(result, Err(PacsError::Config(_))));
    }
}
