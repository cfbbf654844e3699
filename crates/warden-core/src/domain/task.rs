//! Task model: state machine, persisted record, and enqueue request.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;

/// Task state.
///
/// State transitions:
/// - Queued -> Reserved -> InProgress -> Succeeded
/// - Queued -> Reserved -> InProgress -> RetryScheduled -> Reserved (once `next_attempt_at` elapses)
/// - Queued -> Reserved -> InProgress -> Failed (fatal error or retry budget exhausted)
/// - Reserved | InProgress -> Queued (lease expiry recovery, attempt preserved)
///
/// A task is never dispatched without first being reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Reserved,
    InProgress,
    Succeeded,
    Failed,
    RetryScheduled,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Queued,
        TaskState::Reserved,
        TaskState::InProgress,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::RetryScheduled,
    ];

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    /// Does a worker hold a lease on the task in this state?
    pub fn is_leased(self) -> bool {
        matches!(self, TaskState::Reserved | TaskState::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Reserved => "reserved",
            TaskState::InProgress => "in_progress",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::RetryScheduled => "retry_scheduled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown task state '{s}'"))
    }
}

/// Name that selects a handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Persisted task row. The store is the single source of truth for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub state: TaskState,
    pub priority: i32,

    /// Number of dispatches so far (incremented on Reserved -> InProgress).
    pub attempt: u32,

    /// How many of those dispatches were cut short by lease-expiry recovery.
    pub recoveries: u32,

    pub max_attempts: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub lease_holder: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,

    /// Start of the current dispatch (set on Reserved -> InProgress).
    pub started_at: Option<DateTime<Utc>>,

    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Dispatches that count against `max_attempts`.
    ///
    /// Lease-expiry recoveries are infrastructure failures, not handler
    /// failures, so they are subtracted.
    pub fn counted_attempts(&self) -> u32 {
        self.attempt.saturating_sub(self.recoveries)
    }

    pub fn has_retry_budget(&self) -> bool {
        self.counted_attempts() < self.max_attempts
    }
}

/// Enqueue request.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub priority: i32,

    /// `None` falls back to the store's default (`bulk.retry_attempts`).
    pub max_attempts: Option<u32>,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: TaskType::new(task_type),
            payload,
            idempotency_key: None,
            priority: 0,
            max_attempts: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// What `enqueue` did with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    /// A new row was created in state `queued`.
    Created(TaskId),

    /// The idempotency key belongs to a task that is not terminal yet.
    Pending(TaskId),

    /// The idempotency key belongs to a task that already succeeded.
    Completed {
        task_id: TaskId,
        result: Option<serde_json::Value>,
    },
}

impl Enqueued {
    pub fn task_id(&self) -> TaskId {
        match self {
            Enqueued::Created(id) | Enqueued::Pending(id) => *id,
            Enqueued::Completed { task_id, .. } => *task_id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Enqueued::Created(_))
    }
}

/// Queue depth by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub reserved: usize,
    pub in_progress: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retry_scheduled: usize,
}

impl QueueCounts {
    pub fn add(&mut self, state: TaskState, n: usize) {
        match state {
            TaskState::Queued => self.queued += n,
            TaskState::Reserved => self.reserved += n,
            TaskState::InProgress => self.in_progress += n,
            TaskState::Succeeded => self.succeeded += n,
            TaskState::Failed => self.failed += n,
            TaskState::RetryScheduled => self.retry_scheduled += n,
        }
    }

    /// Tasks that still have work ahead of them.
    pub fn pending(&self) -> usize {
        self.queued + self.reserved + self.in_progress + self.retry_scheduled
    }

    pub fn total(&self) -> usize {
        self.pending() + self.succeeded + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_strings_roundtrip() {
        for state in TaskState::ALL {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
        assert!("running".parse::<TaskState>().is_err());
    }

    #[test]
    fn state_serializes_as_snake_case() {
        let s = serde_json::to_string(&TaskState::RetryScheduled).unwrap();
        assert_eq!(s, "\"retry_scheduled\"");
    }

    #[test]
    fn terminal_and_leased_states() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::RetryScheduled.is_terminal());
        assert!(TaskState::Reserved.is_leased());
        assert!(TaskState::InProgress.is_leased());
        assert!(!TaskState::Queued.is_leased());
    }

    #[test]
    fn recoveries_do_not_consume_budget() {
        let now = Utc::now();
        let record = TaskRecord {
            id: TaskId::generate(),
            task_type: TaskType::new("demo"),
            payload: serde_json::json!({}),
            idempotency_key: None,
            state: TaskState::InProgress,
            priority: 0,
            attempt: 3,
            recoveries: 2,
            max_attempts: 2,
            next_attempt_at: None,
            lease_holder: None,
            lease_expires_at: None,
            heartbeat_at: None,
            started_at: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(record.counted_attempts(), 1);
        assert!(record.has_retry_budget());
    }
}
