//! ReaperLoop - Lease 期限切れの回収
//!
//! # フロー
//! 1. `maintenance_interval` ごとに `TaskStore::recover_stale()` を呼ぶ
//! 2. heartbeat が `lease_timeout` より古い reserved / in_progress を queued に戻す
//! 3. attempt は消費しない（インフラ側の失敗として扱う）

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::domain::TaskId;
use crate::ports::{StoreResult, TaskStore};
use crate::store;

pub struct ReaperLoop {
    store: Arc<dyn TaskStore>,
    lease_timeout: Duration,
    interval: Duration,
}

impl ReaperLoop {
    pub fn new(store: Arc<dyn TaskStore>, lease_timeout: Duration, interval: Duration) -> Self {
        Self {
            store,
            lease_timeout,
            interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // startup recovery is done by the engine before the loops start
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep().await {
                        warn!(event = "store_error", operation = "recover_stale", error = %err, "stale lease sweep failed");
                    }
                }
            }
        }
        info!(event = "reaper_stopped", "stale lease reaper stopped");
    }

    /// One sweep; logs and returns the requeued ids.
    pub async fn sweep(&self) -> StoreResult<Vec<TaskId>> {
        let lease_timeout = self.lease_timeout;
        let recovered = store::call(&self.store, move |s| s.recover_stale(lease_timeout)).await?;
        if !recovered.is_empty() {
            info!(
                event = "stale_recovered",
                count = recovered.len(),
                task_ids = ?recovered.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "requeued tasks with expired leases"
            );
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewTask, TaskState};
    use crate::ports::{Clock, FixedClock, Lease};
    use crate::store::SqliteTaskStore;
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn sweep_requeues_only_expired_leases() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let store: Arc<dyn TaskStore> = Arc::new(
            SqliteTaskStore::open_in_memory(3, Arc::clone(&clock) as Arc<dyn Clock>).unwrap(),
        );
        let id = store
            .enqueue(NewTask::new("demo", json!({})))
            .unwrap()
            .task_id();
        let lease = Lease::new("gone", Duration::from_secs(30));
        store.reserve_batch(1, &lease).unwrap();
        store.mark_in_progress(id, &lease).unwrap();

        let reaper = ReaperLoop::new(Arc::clone(&store), Duration::from_secs(30), Duration::from_secs(1));
        assert!(reaper.sweep().await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(reaper.sweep().await.unwrap(), vec![id]);
        assert_eq!(store.get(id).unwrap().unwrap().state, TaskState::Queued);
    }
}
