use async_trait::async_trait;
use tracing::error;

use crate::ports::{EscalationError, EscalationPayload, EscalationSink};

/// Records escalations in the structured log.
///
/// Delivery to the configured webhook / mailbox is left to whatever tails
/// the log; the targets are carried on every record so the consumer knows
/// where to route it.
#[derive(Debug, Clone, Default)]
pub struct LogEscalationSink {
    webhook_url: Option<String>,
    email_to: Option<String>,
}

impl LogEscalationSink {
    pub fn new(webhook_url: Option<String>, email_to: Option<String>) -> Self {
        Self {
            webhook_url,
            email_to,
        }
    }
}

#[async_trait]
impl EscalationSink for LogEscalationSink {
    async fn escalate(&self, payload: &EscalationPayload) -> Result<(), EscalationError> {
        let body = serde_json::to_string(payload).map_err(|e| EscalationError(e.to_string()))?;
        error!(
            event = "escalation_requested",
            webhook_url = self.webhook_url.as_deref().unwrap_or(""),
            email_to = self.email_to.as_deref().unwrap_or(""),
            payload = %body,
            "human review requested"
        );
        Ok(())
    }
}
