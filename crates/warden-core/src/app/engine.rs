//! Engine - Store / Executor / Governance を束ねる実行コンテキスト
//!
//! # 学習ポイント
//! - グローバル状態は持たない。Engine が各コンポーネントを所有し、明示的に渡す
//! - `run()` は 1 セッション: 起動時回収 → 4 つのループ → drain → セッション記録
//! - ループ間で共有するのは store と `ExecutorControl` だけ

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::gc_loop::GcLoop;
use super::reaper_loop::ReaperLoop;
use super::status::{StatsView, TaskView};
use crate::config::WardenConfig;
use crate::domain::{Enqueued, NewTask, SessionId, SessionStatus, TaskId};
use crate::error::EngineError;
use crate::executor::{Executor, ExecutorControl, ExecutorReport, OperationsCounter};
use crate::governance::{GovernanceLoop, Governor};
use crate::ports::{Clock, EscalationSink, SystemProbe, TaskStore};
use crate::store;
use crate::typed::{HandlerRegistry, Task};

/// What one `Engine::run` session did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    /// Tasks requeued by the startup sweep.
    pub recovered_at_startup: usize,
    pub executor: ExecutorReport,
}

pub struct Engine {
    config: WardenConfig,
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    probe: Box<dyn SystemProbe>,
    sink: Option<Arc<dyn EscalationSink>>,
    worker_id: String,
}

impl Engine {
    pub(crate) fn new(
        config: WardenConfig,
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        probe: Box<dyn SystemProbe>,
        sink: Option<Arc<dyn EscalationSink>>,
        worker_id: String,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            clock,
            probe,
            sink,
            worker_id,
        }
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.registry.registered_types()
    }

    pub async fn enqueue(&self, task: NewTask) -> Result<Enqueued, EngineError> {
        if !self.registry.contains(task.task_type.as_str()) {
            warn!(
                event = "unregistered_task_type",
                task_type = %task.task_type,
                "no handler registered in this process; the task will fail unless another worker handles it"
            );
        }

        let task_type = task.task_type.clone();
        let enqueued = store::call(&self.store, move |s| s.enqueue(task)).await?;
        match &enqueued {
            Enqueued::Created(task_id) => info!(
                event = "task_enqueued",
                task_id = %task_id,
                task_type = %task_type,
                "task enqueued"
            ),
            Enqueued::Pending(task_id) => info!(
                event = "task_deduplicated",
                task_id = %task_id,
                task_type = %task_type,
                existing_state = "pending",
                "idempotency key already in flight"
            ),
            Enqueued::Completed { task_id, .. } => info!(
                event = "task_deduplicated",
                task_id = %task_id,
                task_type = %task_type,
                existing_state = "succeeded",
                "idempotency key already succeeded; returning stored result"
            ),
        }
        Ok(enqueued)
    }

    /// Enqueue a typed task under `T::TYPE`.
    pub async fn enqueue_task<T: Task>(
        &self,
        task: &T,
        idempotency_key: Option<&str>,
    ) -> Result<Enqueued, EngineError> {
        let mut request = NewTask::new(T::TYPE, serde_json::to_value(task)?);
        if let Some(key) = idempotency_key {
            request = request.with_idempotency_key(key);
        }
        self.enqueue(request).await
    }

    pub async fn stats(&self) -> Result<StatsView, EngineError> {
        let (counts, latest) = store::call(&self.store, |s| {
            Ok((s.counts_by_state()?, s.recent_metrics(1)?.into_iter().next()))
        })
        .await?;
        Ok(StatsView::new(counts, latest))
    }

    pub async fn inspect(&self, task_id: TaskId) -> Result<TaskView, EngineError> {
        let (task, runs) = store::call(&self.store, move |s| {
            Ok((s.get(task_id)?, s.runs_for(task_id)?))
        })
        .await?;
        let task = task.ok_or(EngineError::TaskNotFound(task_id))?;
        Ok(TaskView { task, runs })
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// The session row is closed as `stopped` on a clean exit and `failed`
    /// otherwise.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<SessionSummary, EngineError> {
        let store = Arc::clone(&self.store);
        let session_id = store::call(&store, |s| s.start_session()).await?;
        info!(
            event = "session_started",
            session_id = %session_id,
            worker_id = %self.worker_id,
            handlers = ?self.registry.registered_types(),
            max_concurrent = self.config.bulk.max_concurrent,
            "engine starting"
        );

        let outcome = self.supervise(session_id, shutdown).await;

        let (status, stats) = match &outcome {
            Ok(summary) => (
                SessionStatus::Stopped,
                serde_json::to_value(summary).unwrap_or_else(|_| json!({})),
            ),
            Err(err) => (SessionStatus::Failed, json!({ "error": err.to_string() })),
        };
        if let Err(err) =
            store::call(&store, move |s| s.finish_session(session_id, status, &stats)).await
        {
            warn!(event = "store_error", operation = "finish_session", error = %err, "session not closed");
        }
        match &outcome {
            Ok(summary) => info!(
                event = "session_finished",
                session_id = %session_id,
                dispatched = summary.executor.dispatched,
                succeeded = summary.executor.succeeded,
                failed = summary.executor.failed,
                abandoned = summary.executor.abandoned,
                "engine stopped"
            ),
            Err(err) => warn!(
                event = "session_failed",
                session_id = %session_id,
                error = %err,
                "engine stopped with an error"
            ),
        }
        outcome
    }

    async fn supervise(
        self,
        session_id: SessionId,
        shutdown: watch::Receiver<bool>,
    ) -> Result<SessionSummary, EngineError> {
        let Engine {
            config,
            store,
            registry,
            clock,
            probe,
            sink,
            worker_id,
        } = self;

        let reaper = ReaperLoop::new(
            Arc::clone(&store),
            config.lease_timeout(),
            config.maintenance_interval(),
        );
        let recovered_at_startup = reaper.sweep().await?.len();

        let control = Arc::new(ExecutorControl::new(config.bulk.max_concurrent));
        let counter = Arc::new(OperationsCounter::new());
        let executor = Executor::new(
            Arc::clone(&store),
            registry,
            Arc::clone(&control),
            Arc::clone(&counter),
            config.retry_policy(),
            config.executor_settings(worker_id),
        );
        let governance = GovernanceLoop::new(
            Governor::new(config.governor_config()),
            control,
            counter,
            Arc::clone(&store),
            probe,
            sink,
            clock,
            config.sample_interval(),
            config.log_interval(),
        );
        let gc = GcLoop::new(
            Arc::clone(&store),
            config.gc_completed_after(),
            config.metrics_retention(),
            config.maintenance_interval(),
        );

        let mut loops = JoinSet::new();
        loops.spawn(governance.run(shutdown.clone()));
        loops.spawn(reaper.run(shutdown.clone()));
        loops.spawn(gc.run(shutdown.clone()));

        let executor = tokio::spawn(executor.run(shutdown)).await?;
        while let Some(joined) = loops.join_next().await {
            joined?;
        }

        Ok(SessionSummary {
            session_id,
            recovered_at_startup,
            executor,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::app::EngineBuilder;
    use crate::domain::{HandlerError, TaskState};
    use crate::governance::ScriptedProbe;
    use crate::ports::FixedClock;
    use crate::store::SqliteTaskStore;
    use crate::typed::task::fixtures::Double;

    fn engine() -> Engine {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc::now()));
        let store = SqliteTaskStore::open_in_memory(3, Arc::clone(&clock)).unwrap();
        let mut config = WardenConfig::default();
        config.bulk.poll_interval_ms = 10;
        EngineBuilder::new(config)
            .with_store(Arc::new(store))
            .with_clock(clock)
            .with_probe(Box::new(ScriptedProbe::steady(10.0, 10.0)))
            .register_fn("demo", |payload| async move {
                let value = payload
                    .get("value")
                    .cloned()
                    .ok_or_else(|| HandlerError::permanent("missing value"))?;
                Ok::<_, HandlerError>(json!({ "result": value }))
            })
            .unwrap()
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_reports_dedup_by_idempotency_key() {
        let engine = engine();
        let first = engine
            .enqueue(NewTask::new("demo", json!({"value": 1})).with_idempotency_key("k"))
            .await
            .unwrap();
        let second = engine
            .enqueue(NewTask::new("demo", json!({"value": 2})).with_idempotency_key("k"))
            .await
            .unwrap();
        assert!(first.is_created());
        assert_eq!(second, Enqueued::Pending(first.task_id()));
        assert_eq!(engine.stats().await.unwrap().counts.queued, 1);
    }

    #[tokio::test]
    async fn enqueue_task_uses_the_type_constant() {
        let engine = engine();
        let id = engine
            .enqueue_task(&Double { value: 21 }, None)
            .await
            .unwrap()
            .task_id();
        let view = engine.inspect(id).await.unwrap();
        assert_eq!(view.task.task_type.as_str(), "test.double.v1");
        assert_eq!(view.task.payload, json!({"value": 21}));
        assert!(view.runs.is_empty());
    }

    #[tokio::test]
    async fn inspect_unknown_task_is_not_found() {
        let engine = engine();
        let missing = TaskId::generate();
        assert!(matches!(
            engine.inspect(missing).await,
            Err(EngineError::TaskNotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn run_processes_queue_and_records_session() {
        let engine = engine();
        let id = engine
            .enqueue(NewTask::new("demo", json!({"value": 7})))
            .await
            .unwrap()
            .task_id();
        let store = Arc::clone(engine.store());

        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(engine.run(rx));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let task = store.get(id).unwrap().unwrap();
            if task.state == TaskState::Succeeded {
                assert_eq!(task.result, Some(json!({"result": 7})));
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "task did not finish");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        tx.send(true).unwrap();
        let summary = running.await.unwrap().unwrap();
        assert_eq!(summary.executor.succeeded, 1);
        assert_eq!(summary.recovered_at_startup, 0);
    }
}
