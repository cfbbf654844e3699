//! Status - `stats` / `inspect` 用のビュー

use serde::Serialize;

use crate::domain::{MetricSample, QueueCounts, RunRecord, TaskRecord};

/// A task record with its attempt history (oldest run first).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: TaskRecord,
    pub runs: Vec<RunRecord>,
}

/// Queue depth by state plus the latest governance observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsView {
    pub counts: QueueCounts,
    pub pending: usize,
    pub total: usize,
    pub latest_sample: Option<MetricSample>,
}

impl StatsView {
    pub fn new(counts: QueueCounts, latest_sample: Option<MetricSample>) -> Self {
        Self {
            pending: counts.pending(),
            total: counts.total(),
            counts,
            latest_sample,
        }
    }
}
