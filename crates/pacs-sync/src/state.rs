//! 同步共享状态
//!
//! 全量同步与监听器共享同一个 [`SyncState`]：
//! - `syncing` 标记全量同步正在进行，第二个全量同步直接被拒绝
//! - `write_gate` 串行化两类写入者：全量同步等待它，监听器只尝试获取
//! - `processing` 防止监听器周期重入
//! - `generation` 每次全量同步写入游标后递增，监听器据此重新对齐游标
//!
//! 所有标记都由守卫在 `Drop` 时释放，失败的同步不会把锁永久占住。

use crate::full_sync::FullSyncReport;
use chrono::{DateTime, Utc};
use pacs_core::{PacsError, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, MutexGuard, RwLock};

/// 同步状态快照，供管理接口展示
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub syncing: bool,
    pub watcher_processing: bool,
    pub started: bool,
    pub cursor: Option<i64>,
    pub last_full_sync: Option<FullSyncReport>,
    pub last_full_sync_error: Option<String>,
    pub last_poll_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct History {
    last_full_sync: Option<FullSyncReport>,
    last_full_sync_error: Option<String>,
    last_poll_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct SyncState {
    syncing: AtomicBool,
    processing: AtomicBool,
    started: AtomicBool,
    generation: AtomicU64,
    write_gate: Mutex<()>,
    history: RwLock<History>,
}

/// `syncing` 标记的所有者，等待写入闸门期间被取消也会复位
#[derive(Debug)]
struct SyncingFlag<'a> {
    state: &'a SyncState,
}

impl Drop for SyncingFlag<'_> {
    fn drop(&mut self) {
        self.state.syncing.store(false, Ordering::SeqCst);
    }
}

/// 全量同步锁，持有期间监听器跳过所有周期
#[derive(Debug)]
pub struct SyncLockGuard<'a> {
    // 先释放闸门再复位标记
    _gate: MutexGuard<'a, ()>,
    flag: SyncingFlag<'a>,
}

impl SyncLockGuard<'_> {
    /// 游标已被全量同步重写，通知监听器重新对齐
    pub fn bump_generation(&self) {
        self.flag.state.generation.fetch_add(1, Ordering::SeqCst);
    }
}

/// 监听器周期守卫
#[derive(Debug)]
pub struct CycleGuard<'a> {
    state: &'a SyncState,
    _gate: MutexGuard<'a, ()>,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.state.processing.store(false, Ordering::SeqCst);
    }
}

/// 监听器无法进入周期的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleBlocked {
    FullSyncRunning,
    AlreadyProcessing,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    /// 已完成的全量同步游标写入次数
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// 标记协调器已启动，只有第一次调用返回 `true`
    pub fn mark_started(&self) -> bool {
        self.started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// 获取全量同步锁
    ///
    /// 已有全量同步时立即返回 [`PacsError::SyncInProgress`]；
    /// 监听器周期正在写入时等待其结束。
    pub async fn acquire_sync_lock(&self) -> Result<SyncLockGuard<'_>> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PacsError::SyncInProgress);
        }
        let flag = SyncingFlag { state: self };

        let gate = self.write_gate.lock().await;
        Ok(SyncLockGuard { _gate: gate, flag })
    }

    /// 尝试进入监听器周期，不等待
    pub fn try_begin_cycle(&self) -> std::result::Result<CycleGuard<'_>, CycleBlocked> {
        if self.is_syncing() {
            return Err(CycleBlocked::FullSyncRunning);
        }
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CycleBlocked::AlreadyProcessing);
        }

        match self.write_gate.try_lock() {
            Ok(gate) => Ok(CycleGuard { state: self, _gate: gate }),
            Err(_) => {
                self.processing.store(false, Ordering::SeqCst);
                Err(CycleBlocked::FullSyncRunning)
            }
        }
    }

    pub async fn record_full_sync(&self, report: &FullSyncReport) {
        let mut history = self.history.write().await;
        history.last_full_sync = Some(report.clone());
        history.last_full_sync_error = None;
    }

    pub async fn record_full_sync_error(&self, error: &PacsError) {
        self.history.write().await.last_full_sync_error = Some(error.to_string());
    }

    pub async fn record_poll(&self) {
        self.history.write().await.last_poll_at = Some(Utc::now());
    }

    /// 生成状态快照，游标由调用方从存储读取
    pub async fn snapshot(&self, cursor: Option<i64>) -> SyncStatus {
        let history = self.history.read().await;
        SyncStatus {
            syncing: self.is_syncing(),
            watcher_processing: self.is_processing(),
            started: self.is_started(),
            cursor,
            last_full_sync: history.last_full_sync.clone(),
            last_full_sync_error: history.last_full_sync_error.clone(),
            last_poll_at: history.last_poll_at,
        }
    }
}
