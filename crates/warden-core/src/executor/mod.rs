//! Executor - reserve → dispatch → report のループ
//!
//! # 学習ポイント
//! - `JoinSet` で in-flight タスクを管理（len() がそのまま同時実行数）
//! - `watch` channel による shutdown / abandon の伝播
//! - `tokio::select!` で「仕事の完了」「設定の変更」「poll 間隔」「shutdown」を同時に待つ
//!
//! # 並行数の保証
//! 新しい予約は常に `limit - in_flight` 件まで。governance が limit を
//! 下げた場合、既に走っているタスクは止めずに完了を待ちます（in-flight が
//! 新しい limit を下回るまで新規予約は行いません）。

mod control;
mod retry;
mod telemetry;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub use self::control::{ControlSnapshot, ExecutorControl};
pub use self::retry::RetryPolicy;
pub use self::telemetry::{OperationsCounter, OperationsDelta};
pub use self::worker::WorkerOutcome;

use self::worker::WorkerContext;
use crate::ports::{Lease, TaskStore};
use crate::store;
use crate::typed::HandlerRegistry;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Written to `lease_holder`; unique per executor instance.
    pub worker_id: String,
    pub lease_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
    pub cpu_workers: usize,
}

impl ExecutorSettings {
    pub fn generate_worker_id() -> String {
        format!("warden-{}-{}", std::process::id(), ulid::Ulid::new())
    }
}

/// What one `Executor::run` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorReport {
    pub dispatched: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub lease_lost: u64,
    /// In flight when the drain timeout expired; left for lease-expiry recovery.
    pub abandoned: usize,
}

impl ExecutorReport {
    fn record(&mut self, outcome: WorkerOutcome) {
        match outcome {
            WorkerOutcome::Succeeded => self.succeeded += 1,
            WorkerOutcome::RetryScheduled => self.retried += 1,
            WorkerOutcome::Failed => self.failed += 1,
            WorkerOutcome::LeaseLost => self.lease_lost += 1,
            WorkerOutcome::StoreError => {}
        }
    }
}

pub struct Executor {
    store: Arc<dyn TaskStore>,
    control: Arc<ExecutorControl>,
    settings: ExecutorSettings,
    context: Arc<WorkerContext>,
}

impl Executor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        control: Arc<ExecutorControl>,
        counter: Arc<OperationsCounter>,
        retry: RetryPolicy,
        settings: ExecutorSettings,
    ) -> Self {
        let context = Arc::new(WorkerContext {
            store: Arc::clone(&store),
            registry,
            counter,
            retry,
            lease: Lease::new(settings.worker_id.clone(), settings.lease_timeout),
            heartbeat_interval: settings.heartbeat_interval,
            cpu_pool: Arc::new(Semaphore::new(settings.cpu_workers.max(1))),
        });
        Self {
            store,
            control,
            settings,
            context,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.settings.worker_id
    }

    /// Dispatch until `shutdown` flips to `true` (or its sender is dropped),
    /// then drain in-flight work for at most `drain_timeout`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ExecutorReport {
        let (abandon_tx, abandon_rx) = watch::channel(false);
        let mut in_flight: JoinSet<WorkerOutcome> = JoinSet::new();
        let mut report = ExecutorReport::default();
        let lease = self.context.lease.clone();

        info!(
            event = "executor_started",
            worker_id = %self.settings.worker_id,
            limit = self.control.snapshot().limit,
            "executor started"
        );

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                record_joined(&mut report, joined);
            }
            if *shutdown.borrow() {
                break;
            }

            let snapshot = self.control.snapshot();
            let free = if snapshot.paused {
                0
            } else {
                snapshot.limit.saturating_sub(in_flight.len())
            };

            if free > 0 {
                let lease = lease.clone();
                match store::call(&self.store, move |s| s.reserve_batch(free, &lease)).await {
                    Ok(batch) if !batch.is_empty() => {
                        for task in batch {
                            debug!(
                                event = "task_reserved",
                                task_id = %task.id,
                                task_type = %task.task_type,
                                priority = task.priority,
                                "task reserved"
                            );
                            report.dispatched += 1;
                            in_flight.spawn(worker::run_task(
                                Arc::clone(&self.context),
                                task,
                                abandon_rx.clone(),
                            ));
                        }
                        continue;
                    }
                    Ok(_) => {}
                    Err(err) if err.is_busy() => {
                        debug!(event = "store_busy", operation = "reserve_batch", error = %err, "database locked; backing off");
                    }
                    Err(err) => {
                        warn!(event = "store_error", operation = "reserve_batch", error = %err, "poll failed; backing off");
                    }
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = self.control.changed() => {}
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    record_joined(&mut report, joined);
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        info!(
            event = "executor_draining",
            in_flight = in_flight.len(),
            "executor stopping; draining in-flight tasks"
        );
        let drained = tokio::time::timeout(self.settings.drain_timeout, async {
            while let Some(joined) = in_flight.join_next().await {
                record_joined(&mut report, joined);
            }
        })
        .await;

        if drained.is_err() {
            report.abandoned = in_flight.len();
            warn!(
                event = "drain_timeout",
                abandoned = report.abandoned,
                drain_timeout_ms = u64::try_from(self.settings.drain_timeout.as_millis()).unwrap_or(u64::MAX),
                "drain timeout; leaving in-flight tasks to lease-expiry recovery"
            );
            let _ = abandon_tx.send(true);
            in_flight.detach_all();
        }

        info!(
            event = "executor_stopped",
            dispatched = report.dispatched,
            succeeded = report.succeeded,
            failed = report.failed,
            abandoned = report.abandoned,
            "executor stopped"
        );
        report
    }
}

fn record_joined(report: &mut ExecutorReport, joined: Result<WorkerOutcome, tokio::task::JoinError>) {
    match joined {
        Ok(outcome) => report.record(outcome),
        Err(err) => error!(event = "worker_panicked", error = %err, "worker task ended abnormally"),
    }
}
