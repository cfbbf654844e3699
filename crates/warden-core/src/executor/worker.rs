//! Per-task worker: in_progress → handler (with heartbeats) → complete / fail.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Semaphore, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use super::telemetry::OperationsCounter;
use crate::domain::{HandlerError, TaskRecord, TaskState};
use crate::ports::{Lease, TaskFailure, TaskStore};
use crate::store::{self, StoreError};
use crate::typed::{HandlerEntry, HandlerRegistry};

/// How a single dispatch ended, from the executor's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Succeeded,
    RetryScheduled,
    Failed,
    /// The lease was reclaimed; the result (if any) was discarded.
    LeaseLost,
    /// A store call failed; the lease is left to expire.
    StoreError,
}

/// Shared by every worker spawned by one executor.
pub(crate) struct WorkerContext {
    pub store: Arc<dyn TaskStore>,
    pub registry: Arc<HandlerRegistry>,
    pub counter: Arc<OperationsCounter>,
    pub retry: RetryPolicy,
    pub lease: Lease,
    pub heartbeat_interval: Duration,
    pub cpu_pool: Arc<Semaphore>,
}

pub(crate) async fn run_task(
    ctx: Arc<WorkerContext>,
    task: TaskRecord,
    abandon: watch::Receiver<bool>,
) -> WorkerOutcome {
    let task_id = task.id;
    let lease = ctx.lease.clone();
    let record = match store::call(&ctx.store, move |s| s.mark_in_progress(task_id, &lease)).await
    {
        Ok(record) => record,
        Err(err) => return store_failure(&task, "mark_in_progress", err),
    };

    let Some(entry) = ctx.registry.get(record.task_type.as_str()) else {
        let error = HandlerError::permanent(format!(
            "no handler registered for task type '{}'",
            record.task_type
        ));
        ctx.counter.record_failure(record.task_type.as_str());
        return report_failure(&ctx, &record, error).await;
    };

    debug!(
        event = "task_dispatched",
        task_id = %record.id,
        task_type = %record.task_type,
        attempt = record.attempt,
        blocking = entry.is_blocking(),
        "dispatching"
    );

    let work = execute(entry, record.payload.clone(), Arc::clone(&ctx.cpu_pool));
    let Some(result) = with_heartbeats(&ctx, &record, work, abandon).await else {
        return WorkerOutcome::LeaseLost;
    };

    match result {
        Ok(value) => {
            ctx.counter.record_success();
            report_success(&ctx, &record, value).await
        }
        Err(error) => {
            ctx.counter.record_failure(record.task_type.as_str());
            report_failure(&ctx, &record, error).await
        }
    }
}

/// Drive `work` to completion while renewing the lease.
///
/// Returns `None` when a heartbeat finds the lease reclaimed; `work` is
/// dropped at that point. After an abandon signal the lease is no longer
/// renewed, but the handler keeps running.
async fn with_heartbeats(
    ctx: &WorkerContext,
    record: &TaskRecord,
    work: impl Future<Output = Result<Value, HandlerError>>,
    mut abandon: watch::Receiver<bool>,
) -> Option<Result<Value, HandlerError>> {
    tokio::pin!(work);

    let period = ctx.heartbeat_interval.max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeating = !*abandon.borrow();
    let mut watching = heartbeating;

    loop {
        tokio::select! {
            result = &mut work => return Some(result),
            _ = ticker.tick(), if heartbeating => {
                let task_id = record.id;
                let lease = ctx.lease.clone();
                match store::call(&ctx.store, move |s| s.heartbeat(task_id, &lease)).await {
                    Ok(()) => {}
                    Err(err) if err.is_lease_lost() => {
                        warn!(
                            event = "lease_lost",
                            task_id = %record.id,
                            task_type = %record.task_type,
                            attempt = record.attempt,
                            "lease reclaimed while running; abandoning work"
                        );
                        return None;
                    }
                    Err(err) => {
                        warn!(
                            event = "heartbeat_failed",
                            task_id = %record.id,
                            error = %err,
                            "heartbeat failed; retrying next tick"
                        );
                    }
                }
            }
            changed = abandon.changed(), if watching => {
                match changed {
                    Ok(()) if *abandon.borrow() => {
                        debug!(event = "task_abandoned", task_id = %record.id, "abandoned; lease left to expire");
                        heartbeating = false;
                        watching = false;
                    }
                    Ok(()) => {}
                    Err(_) => watching = false,
                }
            }
        }
    }
}

async fn execute(
    entry: HandlerEntry,
    payload: Value,
    cpu_pool: Arc<Semaphore>,
) -> Result<Value, HandlerError> {
    match entry {
        HandlerEntry::Async(handler) => {
            // Own task, so a panicking handler is contained and reported.
            let join = tokio::spawn(async move { handler.handle_dyn(payload).await });
            let _guard = AbortOnDrop(join.abort_handle());
            join.await.unwrap_or_else(|err| Err(panicked(err)))
        }
        HandlerEntry::Blocking(handler) => {
            let permit = cpu_pool
                .acquire_owned()
                .await
                .map_err(|_| HandlerError::transient("cpu pool closed"))?;
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                handler.handle_dyn(payload)
            })
            .await
            .unwrap_or_else(|err| Err(panicked(err)))
        }
    }
}

fn panicked(err: tokio::task::JoinError) -> HandlerError {
    if err.is_panic() {
        HandlerError::permanent("handler panicked")
    } else {
        HandlerError::transient("handler cancelled")
    }
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn report_success(ctx: &WorkerContext, record: &TaskRecord, value: Value) -> WorkerOutcome {
    let task_id = record.id;
    let lease = ctx.lease.clone();
    match store::call(&ctx.store, move |s| s.complete(task_id, &lease, &value)).await {
        Ok(()) => {
            info!(
                event = "task_completed",
                task_id = %record.id,
                task_type = %record.task_type,
                attempt = record.attempt,
                "task completed"
            );
            WorkerOutcome::Succeeded
        }
        Err(err) => store_failure(record, "complete", err),
    }
}

async fn report_failure(
    ctx: &WorkerContext,
    record: &TaskRecord,
    error: HandlerError,
) -> WorkerOutcome {
    let task_id = record.id;
    let lease = ctx.lease.clone();
    let failure = TaskFailure {
        error: error.to_string(),
        retryable: error.is_retryable(),
        backoff: ctx.retry.next_delay(record.counted_attempts()),
    };
    let backoff = failure.backoff;

    match store::call(&ctx.store, move |s| s.fail(task_id, &lease, &failure)).await {
        Ok(TaskState::RetryScheduled) => {
            warn!(
                event = "task_retry_scheduled",
                task_id = %record.id,
                task_type = %record.task_type,
                attempt = record.attempt,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "task failed; retry scheduled"
            );
            WorkerOutcome::RetryScheduled
        }
        Ok(_) => {
            warn!(
                event = "task_failed",
                task_id = %record.id,
                task_type = %record.task_type,
                attempt = record.attempt,
                retryable = error.is_retryable(),
                error = %error,
                "task failed"
            );
            WorkerOutcome::Failed
        }
        Err(err) => store_failure(record, "fail", err),
    }
}

fn store_failure(record: &TaskRecord, operation: &'static str, err: StoreError) -> WorkerOutcome {
    if err.is_lease_lost() {
        warn!(
            event = "lease_lost",
            task_id = %record.id,
            task_type = %record.task_type,
            operation,
            "lease no longer held; result discarded"
        );
        WorkerOutcome::LeaseLost
    } else {
        warn!(
            event = "store_error",
            task_id = %record.id,
            operation,
            error = %err,
            "store call failed; lease left to expire"
        );
        WorkerOutcome::StoreError
    }
}
