//! 同步指标
//!
//! 以Prometheus文本格式暴露全量同步与增量监听的运行情况。

use pacs_core::{PacsError, Result};
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::time::Duration;

fn metrics_error(err: prometheus::Error) -> PacsError {
    PacsError::Internal(format!("指标注册失败: {}", err))
}

/// 同步指标收集器
#[derive(Debug, Clone)]
pub struct SyncMetrics {
    registry: Registry,
    pub full_syncs_total: IntCounter,
    pub full_sync_failures_total: IntCounter,
    pub full_sync_duration: Histogram,
    pub studies_synced_total: IntCounter,
    pub watcher_cycles_total: IntCounter,
    pub watcher_skipped_total: IntCounter,
    pub changes_applied_total: IntCounter,
    pub change_failures_total: IntCounter,
    pub changes_dropped_total: IntCounter,
    pub transient_errors_total: IntCounter,
    pub cursor: IntGauge,
}

impl SyncMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let full_syncs_total = IntCounter::with_opts(Opts::new(
            "pacs_full_syncs_total",
            "Completed full synchronizations",
        ))
        .map_err(metrics_error)?;
        let full_sync_failures_total = IntCounter::with_opts(Opts::new(
            "pacs_full_sync_failures_total",
            "Failed full synchronizations",
        ))
        .map_err(metrics_error)?;
        let full_sync_duration = Histogram::with_opts(
            HistogramOpts::new(
                "pacs_full_sync_duration_seconds",
                "Full synchronization duration in seconds",
            )
            .buckets(vec![0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
        )
        .map_err(metrics_error)?;
        let studies_synced_total = IntCounter::with_opts(Opts::new(
            "pacs_studies_synced_total",
            "Studies written by full synchronizations",
        ))
        .map_err(metrics_error)?;
        let watcher_cycles_total = IntCounter::with_opts(Opts::new(
            "pacs_watcher_cycles_total",
            "Watcher poll cycles that reached the remote",
        ))
        .map_err(metrics_error)?;
        let watcher_skipped_total = IntCounter::with_opts(Opts::new(
            "pacs_watcher_skipped_total",
            "Watcher poll cycles skipped because another writer was active",
        ))
        .map_err(metrics_error)?;
        let changes_applied_total = IntCounter::with_opts(Opts::new(
            "pacs_changes_applied_total",
            "Change events applied to the local cache",
        ))
        .map_err(metrics_error)?;
        let change_failures_total = IntCounter::with_opts(Opts::new(
            "pacs_change_failures_total",
            "Change events that failed to apply",
        ))
        .map_err(metrics_error)?;
        let changes_dropped_total = IntCounter::with_opts(Opts::new(
            "pacs_changes_dropped_total",
            "Change events skipped after exhausting retries",
        ))
        .map_err(metrics_error)?;
        let transient_errors_total = IntCounter::with_opts(Opts::new(
            "pacs_transient_errors_total",
            "Transient remote errors seen by the watcher",
        ))
        .map_err(metrics_error)?;
        let cursor = IntGauge::with_opts(Opts::new(
            "pacs_change_cursor",
            "Last change sequence number applied locally",
        ))
        .map_err(metrics_error)?;

        registry.register(Box::new(full_syncs_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(full_sync_failures_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(full_sync_duration.clone())).map_err(metrics_error)?;
        registry.register(Box::new(studies_synced_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(watcher_cycles_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(watcher_skipped_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(changes_applied_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(change_failures_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(changes_dropped_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(transient_errors_total.clone())).map_err(metrics_error)?;
        registry.register(Box::new(cursor.clone())).map_err(metrics_error)?;

        Ok(Self {
            registry,
            full_syncs_total,
            full_sync_failures_total,
            full_sync_duration,
            studies_synced_total,
            watcher_cycles_total,
            watcher_skipped_total,
            changes_applied_total,
            change_failures_total,
            changes_dropped_total,
            transient_errors_total,
            cursor,
        })
    }

    pub fn record_full_sync(&self, studies: u64, duration: Duration) {
        self.full_syncs_total.inc();
        self.studies_synced_total.inc_by(studies);
        self.full_sync_duration.observe(duration.as_secs_f64());
    }

    /// 导出Prometheus文本格式
    pub fn render(&self) -> Result<String> {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        prometheus::Encoder::encode(&encoder, &metric_families, &mut buffer).map_err(metrics_error)?;

        String::from_utf8(buffer).map_err(|e| PacsError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_metrics() {
        let metrics = SyncMetrics::new().unwrap();
        metrics.record_full_sync(3, Duration::from_millis(250));
        metrics.cursor.set(42);

        let text = metrics.render().unwrap();
        assert!(text.contains("pacs_full_syncs_total 1"));
        assert!(text.contains("pacs_studies_synced_total 3"));
        assert!(text.contains("pacs_change_cursor 42"));
    }

    #[test]
    fn test_instances_are_independent() {
        let a = SyncMetrics::new().unwrap();
        let b = SyncMetrics::new().unwrap();
        a.changes_applied_total.inc();

        assert_eq!(a.changes_applied_total.get(), 1);
        assert_eq!(b.changes_applied_total.get(), 0);
    }
}
