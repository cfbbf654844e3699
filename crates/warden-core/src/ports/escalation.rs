//! EscalationSink port - 人間によるレビュー依頼の送出先
//!
//! 実際の配送（webhook / email / chat）は外部コラボレータの責務です。
//! Governance はこの trait にペイロードを渡すだけです。

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationPayload {
    pub reason: String,
    pub pause_count: usize,
    pub window_s: u64,
    pub timestamp: DateTime<Utc>,
    pub concurrency_limit: usize,
    pub cpu_avg: f64,
    pub mem_avg: f64,
    pub window_errors: u64,
    pub top_error_types: BTreeMap<String, u64>,
}

#[derive(Debug, thiserror::Error)]
#[error("escalation delivery failed: {0}")]
pub struct EscalationError(pub String);

#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn escalate(&self, payload: &EscalationPayload) -> Result<(), EscalationError>;
}
