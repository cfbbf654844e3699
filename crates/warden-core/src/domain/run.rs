//! Execution history: runs (one per dispatch) and sessions (one per engine lifetime).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{RunId, SessionId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,

    /// The lease expired before the worker reported back.
    Abandoned,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Succeeded => "succeeded",
            RunOutcome::Failed => "failed",
            RunOutcome::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(RunOutcome::Succeeded),
            "failed" => Ok(RunOutcome::Failed),
            "abandoned" => Ok(RunOutcome::Abandoned),
            other => Err(format!("unknown run outcome '{other}'")),
        }
    }
}

/// A single execution attempt of a task.
///
/// Append-only: a run is written once, when the attempt ends, and never
/// updated afterwards. This gives the full attempt history independent of
/// the task's current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub task_id: TaskId,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub error_detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Stopped,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Failed => "failed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SessionStatus::Running),
            "stopped" => Ok(SessionStatus::Stopped),
            "failed" => Ok(SessionStatus::Failed),
            other => Err(format!("unknown session status '{other}'")),
        }
    }
}

/// One `resume` lifetime of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub stats: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_strings_roundtrip() {
        for outcome in [RunOutcome::Succeeded, RunOutcome::Failed, RunOutcome::Abandoned] {
            assert_eq!(outcome.as_str().parse::<RunOutcome>().unwrap(), outcome);
        }
    }

    #[test]
    fn unknown_session_status_is_rejected() {
        assert!("paused".parse::<SessionStatus>().is_err());
    }
}
