//! Routes escalation notifications to channels sized by severity.
//!
//! High severity reaches the primary channels; critical additionally pages.
//! Individual channel failures don't block other channels, and delivery is
//! idempotent per `(audit_id, channel)`.

use std::collections::HashSet;
use std::sync::Mutex;

use guardian_core::types::Severity;

use crate::traits::{Notification, Notifier, NotifyError};

/// Result of dispatching a notification to a single channel.
#[derive(Debug)]
pub struct DispatchResult {
    pub channel: String,
    pub audit_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Severity-sized notification fan-out.
pub struct Dispatcher {
    primary: Vec<Box<dyn Notifier>>,
    paging: Vec<Box<dyn Notifier>>,
    /// `(audit_id, channel)` pairs already delivered by this process.
    delivered: Mutex<HashSet<(String, String)>>,
}

impl Dispatcher {
    pub fn new(primary: Vec<Box<dyn Notifier>>, paging: Vec<Box<dyn Notifier>>) -> Self {
        Self {
            primary,
            paging,
            delivered: Mutex::new(HashSet::new()),
        }
    }

    /// A dispatcher with no channels (notifications become log-only).
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    /// Dispatch to every channel the notification's severity warrants.
    ///
    /// Returns per-channel results. Transport failures are recorded and a
    /// degraded-notification event is emitted, but nothing propagates: the
    /// audit record is the durable artifact, not the page.
    pub async fn dispatch(&self, notification: &Notification) -> Vec<DispatchResult> {
        let mut channels: Vec<&dyn Notifier> = self.primary.iter().map(|c| c.as_ref()).collect();
        if notification.severity >= Severity::Critical {
            channels.extend(self.paging.iter().map(|c| c.as_ref()));
        }

        if channels.is_empty() {
            tracing::debug!(audit_id = %notification.audit_id, "no notification channels configured");
            return Vec::new();
        }

        let mut results = Vec::with_capacity(channels.len());
        for channel in channels {
            let name = channel.channel_name().to_string();
            let dedupe_key = (notification.audit_id.clone(), name.clone());
            {
                let mut delivered = self.delivered.lock().expect("delivered lock poisoned");
                if !delivered.insert(dedupe_key.clone()) {
                    tracing::debug!(
                        audit_id = %notification.audit_id,
                        channel = %name,
                        "duplicate notification suppressed"
                    );
                    continue;
                }
            }

            let start = std::time::Instant::now();
            let result = channel.send(notification).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            let (success, error) = match result {
                Ok(()) => {
                    tracing::info!(
                        audit_id = %notification.audit_id,
                        channel = %name,
                        duration_ms,
                        "notification delivered"
                    );
                    (true, None)
                }
                Err(e) => {
                    // Allow a later retry of the failed channel.
                    self.delivered
                        .lock()
                        .expect("delivered lock poisoned")
                        .remove(&dedupe_key);
                    tracing::warn!(
                        audit_id = %notification.audit_id,
                        channel = %name,
                        error = %e,
                        duration_ms,
                        "notification delivery degraded"
                    );
                    (false, Some(e.to_string()))
                }
            };

            results.push(DispatchResult {
                channel: name,
                audit_id: notification.audit_id.clone(),
                success,
                error,
                duration_ms,
            });
        }

        results
    }

    /// Send a test notification through a primary channel by index.
    pub async fn test_notify(&self, channel_index: usize) -> Result<(), NotifyError> {
        let channel = self.primary.get(channel_index).ok_or_else(|| {
            NotifyError::Config(format!("channel index {channel_index} out of range"))
        })?;
        channel.test().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct MockNotifier {
        name: String,
        send_count: Arc<AtomicUsize>,
        should_fail: bool,
    }

    #[async_trait::async_trait]
    impl Notifier for MockNotifier {
        async fn send(&self, _notification: &Notification) -> Result<(), NotifyError> {
            self.send_count.fetch_add(1, Ordering::SeqCst);
            if self.should_fail {
                Err(NotifyError::Config("mock failure".to_string()))
            } else {
                Ok(())
            }
        }
        fn channel_name(&self) -> &str {
            &self.name
        }
    }

    fn notifier(name: &str, count: &Arc<AtomicUsize>, should_fail: bool) -> Box<dyn Notifier> {
        Box::new(MockNotifier {
            name: name.to_string(),
            send_count: Arc::clone(count),
            should_fail,
        })
    }

    fn notification(audit_id: &str, severity: Severity) -> Notification {
        Notification {
            audit_id: audit_id.to_string(),
            severity,
            subject: "subject".to_string(),
            body: "body".to_string(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_high_severity_skips_paging() {
        let primary_count = Arc::new(AtomicUsize::new(0));
        let paging_count = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(
            vec![notifier("primary", &primary_count, false)],
            vec![notifier("pager", &paging_count, false)],
        );

        let results = dispatcher.dispatch(&notification("a1", Severity::High)).await;
        assert_eq!(results.len(), 1);
        assert_eq!(primary_count.load(Ordering::SeqCst), 1);
        assert_eq!(paging_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_critical_pages_too() {
        let primary_count = Arc::new(AtomicUsize::new(0));
        let paging_count = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(
            vec![notifier("primary", &primary_count, false)],
            vec![notifier("pager", &paging_count, false)],
        );

        let results = dispatcher
            .dispatch(&notification("a1", Severity::Critical))
            .await;
        assert_eq!(results.len(), 2);
        assert_eq!(primary_count.load(Ordering::SeqCst), 1);
        assert_eq!(paging_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_doesnt_block() {
        let failing_count = Arc::new(AtomicUsize::new(0));
        let ok_count = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(
            vec![
                notifier("failing", &failing_count, true),
                notifier("ok", &ok_count, false),
            ],
            Vec::new(),
        );

        let results = dispatcher.dispatch(&notification("a1", Severity::High)).await;
        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert!(results[1].success);
        assert_eq!(ok_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_idempotent_per_audit_and_channel() {
        let count = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(vec![notifier("primary", &count, false)], Vec::new());

        dispatcher.dispatch(&notification("a1", Severity::High)).await;
        dispatcher.dispatch(&notification("a1", Severity::High)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A different audit id is a fresh delivery.
        dispatcher.dispatch(&notification("a2", Severity::High)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_delivery_can_retry() {
        let count = Arc::new(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(vec![notifier("flaky", &count, true)], Vec::new());

        dispatcher.dispatch(&notification("a1", Severity::High)).await;
        dispatcher.dispatch(&notification("a1", Severity::High)).await;
        // Failures are not recorded as delivered, so both attempts sent.
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_dispatcher_returns_nothing() {
        let dispatcher = Dispatcher::empty();
        let results = dispatcher
            .dispatch(&notification("a1", Severity::Critical))
            .await;
        assert!(results.is_empty());
    }
}
