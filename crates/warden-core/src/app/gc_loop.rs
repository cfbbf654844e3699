//! GcLoop - 終端タスクとメトリクスのガベージコレクション
//!
//! # フロー
//! 1. `maintenance_interval` ごとに起動
//! 2. `completed_after` より前に終端になった task と run を削除
//! 3. `metrics_retention` より古い metric sample を削除

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::ports::{GcReport, StoreResult, TaskStore};
use crate::store;

pub struct GcLoop {
    store: Arc<dyn TaskStore>,
    completed_after: Duration,
    metrics_retention: Duration,
    interval: Duration,
}

impl GcLoop {
    pub fn new(
        store: Arc<dyn TaskStore>,
        completed_after: Duration,
        metrics_retention: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            completed_after,
            metrics_retention,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.collect().await {
                        warn!(event = "store_error", operation = "gc", error = %err, "garbage collection failed");
                    }
                }
            }
        }
        info!(event = "gc_stopped", "garbage collection loop stopped");
    }

    pub async fn collect(&self) -> StoreResult<GcReport> {
        let completed_after = self.completed_after;
        let metrics_retention = self.metrics_retention;
        let report = store::call(&self.store, move |s| {
            let mut report = s.gc(completed_after)?;
            report.metrics = s.gc_metrics(metrics_retention)?;
            Ok(report)
        })
        .await?;

        if report != GcReport::default() {
            info!(
                event = "gc_completed",
                tasks = report.tasks,
                runs = report.runs,
                metrics = report.metrics,
                "removed expired records"
            );
        }
        Ok(report)
    }
}
