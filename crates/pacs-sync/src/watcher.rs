//! 增量监听器
//!
//! 定时轮询远端变更日志，按序号顺序把检查的新建、稳定和删除事件应用到本地缓存。
//!
//! 失败处理：某个事件应用失败时本批次在此停止，游标只推进到最后一个成功的事件，
//! 下个周期从失败的事件重试。非瞬时错误累计 `max_event_retries` 次后跳过该事件并记录错误日志，
//! 瞬时错误（远端不可达、5xx）不计入重试次数。

use crate::metrics::SyncMetrics;
use crate::source::ChangeSource;
use crate::state::{CycleBlocked, SyncState};
use pacs_core::{ChangeEvent, ChangeType, PacsError, Result};
use pacs_database::{DatabasePool, DatabaseQueries, NewInstance, NewSeries, NewStudy};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// 监听器配置
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub interval: Duration,
    pub batch_limit: u32,
    pub max_event_retries: u32,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5000),
            batch_limit: 100,
            max_event_retries: 3,
        }
    }
}

/// 单个周期的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Skipped(CycleBlocked),
    Idle { cursor: i64 },
    Applied(BatchSummary),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub upserted: usize,
    pub deleted: usize,
    pub ignored: usize,
    pub dropped: usize,
    /// 本批次停在这个序号，下个周期重试
    pub stopped_at: Option<i64>,
    pub cursor: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
    Upserted,
    Vanished,
    Deleted,
    Ignored,
}

#[derive(Debug, Default)]
struct Progress {
    last_seq: i64,
    /// 上次对齐时的全量同步代数
    generation: u64,
    failing_seq: Option<i64>,
    failures: u32,
}

impl Progress {
    fn record_failure(&mut self, seq: i64) -> u32 {
        if self.failing_seq != Some(seq) {
            self.failing_seq = Some(seq);
            self.failures = 0;
        }
        self.failures += 1;
        self.failures
    }

    fn reset(&mut self, cursor: i64, generation: u64) {
        self.last_seq = cursor;
        self.generation = generation;
        self.failing_seq = None;
        self.failures = 0;
    }

    fn clear_failure(&mut self, seq: i64) {
        if self.failing_seq == Some(seq) {
            self.failing_seq = None;
            self.failures = 0;
        }
    }
}

pub struct Watcher {
    database: DatabasePool,
    source: Arc<dyn ChangeSource>,
    state: Arc<SyncState>,
    metrics: Arc<SyncMetrics>,
    settings: WatcherSettings,
    progress: Mutex<Progress>,
}

impl Watcher {
    pub fn new(
        database: DatabasePool,
        source: Arc<dyn ChangeSource>,
        state: Arc<SyncState>,
        metrics: Arc<SyncMetrics>,
        settings: WatcherSettings,
    ) -> Self {
        Self {
            database,
            source,
            state,
            metrics,
            settings,
            progress: Mutex::new(Progress::default()),
        }
    }

    /// 轮询循环，直到 `cancel` 被触发
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Orthanc watcher started, polling every {:?}", self.settings.interval);

        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }

        info!("Orthanc watcher stopped");
    }

    /// 执行一个周期并记录错误，从不向上传播
    pub async fn tick(&self) {
        match self.poll_once().await {
            Ok(PollOutcome::Applied(summary)) => {
                debug!("Watcher cycle applied changes through {}", summary.cursor);
            }
            Ok(outcome) => trace!("Watcher cycle: {:?}", outcome),
            Err(e @ PacsError::RemoteUnavailable(_)) => {
                self.metrics.transient_errors_total.inc();
                debug!("Orthanc unreachable, retrying next cycle: {}", e);
            }
            Err(e) if e.is_transient() => {
                self.metrics.transient_errors_total.inc();
                warn!("Watcher cycle failed, retrying next cycle: {}", e);
            }
            Err(e) if e.is_remote() => warn!("Orthanc rejected watcher request, retrying next cycle: {}", e),
            Err(e) => error!("Watcher cycle failed: {}", e),
        }
    }

    /// 执行一个轮询周期
    pub async fn poll_once(&self) -> Result<PollOutcome> {
        let _cycle = match self.state.try_begin_cycle() {
            Ok(guard) => guard,
            Err(reason) => {
                self.metrics.watcher_skipped_total.inc();
                return Ok(PollOutcome::Skipped(reason));
            }
        };
        self.metrics.watcher_cycles_total.inc();
        self.state.record_poll().await;

        let queries = DatabaseQueries::new(&self.database);
        let mut progress = self.progress.lock().await;

        // 全量同步重写过游标时以存储为准，即使比内存中的小
        let generation = self.state.generation();
        let persisted = queries.get_cursor().await?;
        if generation != progress.generation {
            let cursor = persisted.unwrap_or(progress.last_seq);
            if cursor != progress.last_seq {
                info!("Full sync reset the cursor to {} (watcher was at {})", cursor, progress.last_seq);
            }
            progress.reset(cursor, generation);
        } else if let Some(persisted) = persisted {
            if persisted > progress.last_seq {
                debug!("Adopting persisted cursor {} (was {})", persisted, progress.last_seq);
                progress.last_seq = persisted;
            }
        }

        let page = self
            .source
            .changes(progress.last_seq, self.settings.batch_limit)
            .await?;
        if page.changes.is_empty() {
            return Ok(PollOutcome::Idle { cursor: progress.last_seq });
        }

        let mut changes = page.changes;
        changes.sort_by_key(|c| c.seq);

        let start = progress.last_seq;
        let mut summary = BatchSummary {
            cursor: start,
            ..BatchSummary::default()
        };

        for change in &changes {
            if change.seq <= summary.cursor {
                continue;
            }

            match self.apply_change(&queries, change).await {
                Ok(effect) => {
                    progress.clear_failure(change.seq);
                    self.metrics.changes_applied_total.inc();
                    match effect {
                        Effect::Upserted => summary.upserted += 1,
                        Effect::Deleted | Effect::Vanished => summary.deleted += 1,
                        Effect::Ignored => summary.ignored += 1,
                    }
                    summary.cursor = change.seq;
                }
                Err(e) if e.is_transient() => {
                    warn!("Change {} ({} {}) hit a transient error: {}", change.seq, change.change_type.as_str(), change.id, e);
                    summary.stopped_at = Some(change.seq);
                    break;
                }
                Err(e) => {
                    self.metrics.change_failures_total.inc();
                    let attempts = progress.record_failure(change.seq);
                    if attempts >= self.settings.max_event_retries {
                        error!(
                            "Dropping change {} ({} {}) after {} failed attempts: {}",
                            change.seq, change.change_type.as_str(), change.id, attempts, e
                        );
                        self.metrics.changes_dropped_total.inc();
                        progress.clear_failure(change.seq);
                        summary.dropped += 1;
                        summary.cursor = change.seq;
                    } else {
                        warn!(
                            "Change {} ({} {}) failed (attempt {}/{}): {}",
                            change.seq, change.change_type.as_str(), change.id, attempts, self.settings.max_event_retries, e
                        );
                        summary.stopped_at = Some(change.seq);
                        break;
                    }
                }
            }
        }

        // 写回前再读一次，以免覆盖其他写入者推进过的游标
        let persisted = queries.get_cursor().await?;
        match persisted {
            Some(seq) if seq > summary.cursor => {
                debug!("Persisted cursor {} is ahead of batch cursor {}", seq, summary.cursor);
                summary.cursor = seq;
            }
            _ if summary.cursor > start || persisted.is_none() => {
                queries.advance_cursor(summary.cursor).await?;
            }
            _ => {}
        }

        progress.last_seq = summary.cursor;
        self.metrics.cursor.set(summary.cursor);
        Ok(PollOutcome::Applied(summary))
    }

    async fn apply_change(&self, queries: &DatabaseQueries<'_>, change: &ChangeEvent) -> Result<Effect> {
        match &change.change_type {
            kind if kind.is_study_upsert() => self.refresh_study(queries, &change.id).await,
            ChangeType::DeletedStudy => {
                if queries.delete_study(&change.id).await? {
                    info!("Study {} removed from cache", change.id);
                    Ok(Effect::Deleted)
                } else {
                    debug!("Deleted study {} was not cached", change.id);
                    Ok(Effect::Vanished)
                }
            }
            kind => {
                trace!("Ignoring change {} ({})", change.seq, kind.as_str());
                Ok(Effect::Ignored)
            }
        }
    }

    /// 拉取检查及其系列、实例并整体替换本地记录
    ///
    /// 远端404视为检查已被删除，事件按已应用处理。
    async fn refresh_study(&self, queries: &DatabaseQueries<'_>, study_id: &str) -> Result<Effect> {
        let fetched = async {
            let study = self.source.study(study_id).await?;
            let series = self.source.study_series(study_id).await?;
            let instances = self.source.study_instances(study_id).await?;
            Ok::<_, PacsError>((study, series, instances))
        }
        .await;

        let (study, series, instances) = match fetched {
            Ok(resources) => resources,
            Err(e) if e.is_remote_not_found() => {
                debug!("Study {} vanished before it could be fetched", study_id);
                return Ok(Effect::Vanished);
            }
            Err(e) => return Err(e),
        };

        let study_row = NewStudy::from_resource(&study)?;
        let series_rows = series
            .iter()
            .map(|s| NewSeries::from_resource(s, &study.id))
            .collect::<Result<Vec<_>>>()?;
        let series_ids: HashSet<&str> = series_rows.iter().map(|s| s.id.as_str()).collect();
        let instance_rows = instances
            .iter()
            .filter(|i| series_ids.contains(i.parent_series.as_str()))
            .map(|i| NewInstance::from_resource(i, &study.id))
            .collect::<Result<Vec<_>>>()?;

        let existed = queries.study_exists(&study.id).await?;
        queries
            .replace_study_tree(&study_row, &series_rows, &instance_rows)
            .await?;

        if existed {
            debug!("Study {} refreshed", study.id);
        } else {
            info!("New study cached: {} ({})", study.id, study_row.patient_name);
        }
        Ok(Effect::Upserted)
    }
}
