//! TaskStore port - タスク状態の正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - 状態（TaskState）とリース（lease_holder / heartbeat_at）
//! - 履歴（runs: append-only）
//! - ガバナンスのメトリクス（metrics）
//! - セッション（sessions）
//!
//! # 設計原則
//! - すべての状態遷移は `(id, state[, lease_holder])` を条件にした原子的 UPDATE
//! - Lease の権威はここにある（executor はリースを「持っているつもり」でしかない）
//! - 同期 API。async 側からは `spawn_blocking` 経由で呼ぶ

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{
    Enqueued, MetricSample, NewTask, QueueCounts, RunRecord, SessionId, SessionStatus, TaskId,
    TaskRecord, TaskState,
};
use crate::store::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

/// Claim parameters for `reserve_batch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Opaque worker identity written to `lease_holder`.
    pub holder: String,
    pub duration: Duration,
}

impl Lease {
    pub fn new(holder: impl Into<String>, duration: Duration) -> Self {
        Self {
            holder: holder.into(),
            duration,
        }
    }
}

/// A handler failure as reported to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub error: String,
    pub retryable: bool,

    /// Delay before the next attempt, used only when the task is retried.
    pub backoff: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    pub tasks: usize,
    pub runs: usize,
    pub metrics: usize,
}

pub trait TaskStore: Send + Sync {
    /// Insert a task, honouring its idempotency key.
    fn enqueue(&self, task: NewTask) -> StoreResult<Enqueued>;

    /// Claim up to `limit` ready tasks for `lease.holder`.
    ///
    /// Ready means `queued`, or `retry_scheduled` with an elapsed
    /// `next_attempt_at`. Ordered by priority, then FIFO.
    fn reserve_batch(&self, limit: usize, lease: &Lease) -> StoreResult<Vec<TaskRecord>>;

    /// Reserved -> InProgress; counts the attempt.
    fn mark_in_progress(&self, task_id: TaskId, lease: &Lease) -> StoreResult<TaskRecord>;

    /// Refresh the lease. `StoreError::LeaseLost` if it was reclaimed.
    fn heartbeat(&self, task_id: TaskId, lease: &Lease) -> StoreResult<()>;

    fn complete(
        &self,
        task_id: TaskId,
        lease: &Lease,
        result: &serde_json::Value,
    ) -> StoreResult<()>;

    /// Returns the state the task ended up in (`retry_scheduled` or `failed`).
    fn fail(&self, task_id: TaskId, lease: &Lease, failure: &TaskFailure)
    -> StoreResult<TaskState>;

    /// Requeue leased tasks whose heartbeat is older than `lease_timeout`.
    fn recover_stale(&self, lease_timeout: Duration) -> StoreResult<Vec<TaskId>>;

    /// Delete terminal tasks (and their runs) untouched for `completed_after`.
    fn gc(&self, completed_after: Duration) -> StoreResult<GcReport>;

    fn get(&self, task_id: TaskId) -> StoreResult<Option<TaskRecord>>;

    fn runs_for(&self, task_id: TaskId) -> StoreResult<Vec<RunRecord>>;

    fn counts_by_state(&self) -> StoreResult<QueueCounts>;

    fn insert_metric(&self, sample: &MetricSample) -> StoreResult<()>;

    /// Newest first.
    fn recent_metrics(&self, limit: usize) -> StoreResult<Vec<MetricSample>>;

    fn gc_metrics(&self, older_than: Duration) -> StoreResult<usize>;

    fn start_session(&self) -> StoreResult<SessionId>;

    fn finish_session(
        &self,
        session_id: SessionId,
        status: SessionStatus,
        stats: &serde_json::Value,
    ) -> StoreResult<()>;
}
