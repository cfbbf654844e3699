use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One governance observation.
///
/// `op_count` and `error_count` are deltas since the previous sample;
/// `concurrency_limit` and `paused` record the actuator state at the time
/// the sample was taken (before the controller reacted to it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_pct: f64,
    pub mem_pct: f64,
    pub op_count: u64,
    pub error_count: u64,
    pub concurrency_limit: usize,
    pub paused: bool,
}
