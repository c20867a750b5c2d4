//! 全量同步引擎
//!
//! 批量拉取远端所有检查、系列和实例并写入本地缓存，然后把持久化游标
//! 重置为远端当前的最大变更序号，监听器从这里继续。

use crate::metrics::SyncMetrics;
use crate::source::ChangeSource;
use crate::state::{SyncLockGuard, SyncState};
use chrono::{DateTime, Utc};
use pacs_core::Result;
use pacs_database::{DatabasePool, DatabaseQueries, NewInstance, NewSeries, NewStudy};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const LAST_FULL_SYNC_AT_KEY: &str = "last_full_sync_at";
pub const LAST_FULL_SYNC_COUNT_KEY: &str = "last_full_sync_count";

/// 一次全量同步的结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullSyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub studies: u64,
    pub series: u64,
    pub instances: u64,
    pub pruned: u64,
    pub last_seq: i64,
    pub duration_ms: u64,
}

pub struct FullSyncEngine {
    database: DatabasePool,
    source: Arc<dyn ChangeSource>,
    state: Arc<SyncState>,
    metrics: Arc<SyncMetrics>,
    prune_missing: bool,
}

impl FullSyncEngine {
    pub fn new(
        database: DatabasePool,
        source: Arc<dyn ChangeSource>,
        state: Arc<SyncState>,
        metrics: Arc<SyncMetrics>,
        prune_missing: bool,
    ) -> Self {
        Self {
            database,
            source,
            state,
            metrics,
            prune_missing,
        }
    }

    /// 执行全量同步
    ///
    /// 已有全量同步在运行时返回 `SyncInProgress`；监听器周期正在写入时先等待其结束。
    pub async fn run(&self) -> Result<FullSyncReport> {
        let lock = self.state.acquire_sync_lock().await?;

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let timer = Instant::now();
        info!(%run_id, "Starting full sync");

        match self.sync_all(&lock, run_id, started_at, timer).await {
            Ok(report) => {
                info!(
                    %run_id,
                    "Full sync finished: {} studies, {} series, {} instances, {} pruned, cursor {} ({} ms)",
                    report.studies, report.series, report.instances, report.pruned, report.last_seq, report.duration_ms
                );
                self.metrics.record_full_sync(report.studies, timer.elapsed());
                self.metrics.cursor.set(report.last_seq);
                self.state.record_full_sync(&report).await;
                Ok(report)
            }
            Err(e) => {
                error!(%run_id, "Full sync failed: {}", e);
                self.metrics.full_sync_failures_total.inc();
                self.state.record_full_sync_error(&e).await;
                Err(e)
            }
        }
    }

    async fn sync_all(
        &self,
        lock: &SyncLockGuard<'_>,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        timer: Instant,
    ) -> Result<FullSyncReport> {
        let queries = DatabaseQueries::new(&self.database);

        let studies = self.source.all_studies().await?;
        let study_rows = studies
            .iter()
            .map(NewStudy::from_resource)
            .collect::<Result<Vec<_>>>()?;
        let study_ids: HashSet<String> = study_rows.iter().map(|s| s.id.clone()).collect();
        let studies_written = queries.bulk_upsert_studies(&study_rows).await?;
        info!(%run_id, "Cached {} studies", studies_written);

        let series = self.source.all_series().await?;
        let mut series_study: HashMap<String, String> = HashMap::with_capacity(series.len());
        let mut series_rows = Vec::with_capacity(series.len());
        for s in &series {
            if !study_ids.contains(&s.parent_study) {
                warn!(%run_id, "Skipping series {} of unknown study {}", s.id, s.parent_study);
                continue;
            }
            series_study.insert(s.id.clone(), s.parent_study.clone());
            series_rows.push(NewSeries::from_resource(s, &s.parent_study)?);
        }
        let series_written = queries.bulk_upsert_series(&series_rows).await?;

        let instances = self.source.all_instances().await?;
        let mut instance_rows = Vec::with_capacity(instances.len());
        let mut orphans = 0usize;
        for instance in &instances {
            match series_study.get(&instance.parent_series) {
                Some(study_id) => instance_rows.push(NewInstance::from_resource(instance, study_id)?),
                None => orphans += 1,
            }
        }
        if orphans > 0 {
            warn!(%run_id, "Skipped {} instances without a cached series", orphans);
        }
        let instances_written = queries.bulk_upsert_instances(&instance_rows).await?;

        let pruned = if self.prune_missing {
            queries.prune_studies(&study_ids).await?
        } else {
            0
        };
        if pruned > 0 {
            info!(%run_id, "Pruned {} studies no longer present remotely", pruned);
        }

        let last_seq = self.source.last_change_seq().await?;
        debug!(%run_id, "Remote change log is at {}", last_seq);
        queries.store_cursor(last_seq).await?;
        lock.bump_generation();
        queries
            .set_metadata(LAST_FULL_SYNC_AT_KEY, &Utc::now().to_rfc3339())
            .await?;
        queries
            .set_metadata(LAST_FULL_SYNC_COUNT_KEY, &studies_written.to_string())
            .await?;

        Ok(FullSyncReport {
            run_id,
            started_at,
            studies: studies_written,
            series: series_written,
            instances: instances_written,
            pruned,
            last_seq,
            duration_ms: timer.elapsed().as_millis() as u64,
        })
    }
}
