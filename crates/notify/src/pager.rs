//! Paging channel for critical escalations.
//!
//! Posts events to a paging provider's events API (PagerDuty-compatible
//! shape). Only critical-severity escalations route here; the dispatcher
//! handles that sizing.

use crate::traits::{Notification, Notifier, NotifyError};

/// Sends page events for critical escalations.
#[derive(Debug)]
pub struct PagerNotifier {
    events_url: String,
    routing_key: String,
    client: reqwest::Client,
}

impl PagerNotifier {
    pub fn new(events_url: String, routing_key: String) -> Self {
        Self {
            events_url,
            routing_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for PagerNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        // Event dedup key is the audit id, so provider-side retries of the
        // same escalation collapse into one incident.
        let payload = serde_json::json!({
            "routing_key": self.routing_key,
            "event_action": "trigger",
            "dedup_key": notification.audit_id,
            "payload": {
                "summary": notification.subject,
                "severity": notification.severity,
                "source": "guardian-safety-pipeline",
                "custom_details": {
                    "body": notification.body,
                    "metadata": notification.metadata,
                },
            },
        });

        let response = self
            .client
            .post(&self.events_url)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Config(format!(
                "pager events API returned {status}"
            )));
        }

        tracing::info!(audit_id = %notification.audit_id, "page triggered");
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "pager"
    }
}
