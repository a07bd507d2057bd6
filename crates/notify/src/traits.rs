//! Notifier trait definition and shared error types.

use std::collections::HashMap;

use guardian_core::types::Severity;

/// Errors that can occur during notification delivery.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SMTP delivery failed: {0}")]
    Smtp(String),

    #[error("Template rendering failed: {0}")]
    Template(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// A rendered notification ready for delivery.
///
/// Delivery is idempotent per `(audit_id, channel)`: the dispatcher skips a
/// channel that has already accepted this audit id.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Notification {
    /// The audit id this notification is about (the dedupe key).
    pub audit_id: String,
    pub severity: Severity,
    /// Rendered subject/title.
    pub subject: String,
    /// Rendered body content.
    pub body: String,
    /// Additional metadata (e.g. reason code, subject id).
    pub metadata: HashMap<String, String>,
}

/// Trait for notification channel implementations.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification through this channel.
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;

    /// Test connectivity with a sample notification.
    async fn test(&self) -> Result<(), NotifyError> {
        let test_notification = Notification {
            audit_id: "test-audit".to_string(),
            severity: Severity::Low,
            subject: "[TEST] Safety pipeline notification test".to_string(),
            body: "This is a test notification from the safety escalation handler.".to_string(),
            metadata: HashMap::from([("stage".to_string(), "test".to_string())]),
        };
        self.send(&test_notification).await
    }

    /// Human-readable name for this channel (e.g. "webhook", "pager").
    fn channel_name(&self) -> &str;
}
