//! In-process broker for tests and explicit degraded mode.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::{QueueHealth, StreamBroker, StreamMessage};
use crate::envelope::QueuedRequest;
use crate::error::QueueError;

struct PendingEntry {
    request: QueuedRequest,
    delivery_count: u32,
}

/// Single-process stream with consumer-group-like pending tracking.
pub struct MemoryBroker {
    queue: Mutex<VecDeque<(String, QueuedRequest, u32)>>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    responses: Mutex<HashMap<String, String>>,
    next_id: AtomicU64,
    failing: Mutex<bool>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            pending: Mutex::new(HashMap::new()),
            responses: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            failing: Mutex::new(false),
        }
    }

    /// Simulate the broker going away (tests only).
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().expect("failing lock poisoned") = failing;
    }

    fn check_failing(&self) -> Result<(), QueueError> {
        if *self.failing.lock().expect("failing lock poisoned") {
            return Err(QueueError::Unreachable("memory broker disabled".to_string()));
        }
        Ok(())
    }

    /// Return a claimed message to the queue, bumping its delivery count.
    /// Used by tests to exercise at-least-once redelivery.
    pub fn redeliver(&self, stream_id: &str) {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        if let Some(entry) = pending.remove(stream_id) {
            self.queue.lock().expect("queue lock poisoned").push_front((
                stream_id.to_string(),
                entry.request,
                entry.delivery_count + 1,
            ));
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamBroker for MemoryBroker {
    async fn publish(&self, request: &QueuedRequest) -> Result<String, QueueError> {
        self.check_failing()?;
        let stream_id = format!("{}-0", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.queue.lock().expect("queue lock poisoned").push_back((
            stream_id.clone(),
            request.clone(),
            1,
        ));
        Ok(stream_id)
    }

    async fn claim(
        &self,
        _consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamMessage>, QueueError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            self.check_failing()?;
            let popped = self.queue.lock().expect("queue lock poisoned").pop_front();
            if let Some((stream_id, request, delivery_count)) = popped {
                self.pending.lock().expect("pending lock poisoned").insert(
                    stream_id.clone(),
                    PendingEntry {
                        request: request.clone(),
                        delivery_count,
                    },
                );
                return Ok(Some(StreamMessage {
                    stream_id,
                    request,
                    delivery_count,
                }));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn ack(&self, stream_id: &str) -> Result<(), QueueError> {
        self.check_failing()?;
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .remove(stream_id);
        Ok(())
    }

    async fn pending(&self) -> Result<u64, QueueError> {
        self.check_failing()?;
        Ok(self.pending.lock().expect("pending lock poisoned").len() as u64)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        self.check_failing()?;
        Ok(self.queue.lock().expect("queue lock poisoned").len() as u64)
    }

    async fn publish_response(
        &self,
        request_id: &str,
        response_text: &str,
    ) -> Result<(), QueueError> {
        self.check_failing()?;
        self.responses
            .lock()
            .expect("responses lock poisoned")
            .insert(request_id.to_string(), response_text.to_string());
        Ok(())
    }

    async fn fetch_response(&self, request_id: &str) -> Result<Option<String>, QueueError> {
        self.check_failing()?;
        Ok(self
            .responses
            .lock()
            .expect("responses lock poisoned")
            .get(request_id)
            .cloned())
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        let connected = self.check_failing().is_ok();
        let depth = if connected {
            Some(self.queue.lock().expect("queue lock poisoned").len() as u64)
        } else {
            None
        };
        Ok(QueueHealth {
            connected,
            depth,
            provider: "memory".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use guardian_core::types::TrustTier;

    use crate::envelope::PreCheckSummary;

    fn request(text: &str) -> QueuedRequest {
        QueuedRequest::new(
            "t1",
            "u1",
            TrustTier::User,
            text,
            PreCheckSummary {
                registry_version: 1,
                highest_severity: None,
                terminal_action: None,
            },
        )
    }

    #[tokio::test]
    async fn test_publish_claim_ack_cycle() {
        let broker = MemoryBroker::new();
        broker.publish(&request("hello")).await.unwrap();
        assert_eq!(broker.depth().await.unwrap(), 1);

        let msg = broker
            .claim("w1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.request.input_text, "hello");
        assert_eq!(msg.delivery_count, 1);
        assert_eq!(broker.depth().await.unwrap(), 0);
        assert_eq!(broker.pending().await.unwrap(), 1);

        broker.ack(&msg.stream_id).await.unwrap();
        assert_eq!(broker.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claim_empty_times_out() {
        let broker = MemoryBroker::new();
        let claimed = broker.claim("w1", Duration::from_millis(10)).await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_redelivery_bumps_count() {
        let broker = MemoryBroker::new();
        broker.publish(&request("retry me")).await.unwrap();

        let first = broker
            .claim("w1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        broker.redeliver(&first.stream_id);

        let second = broker
            .claim("w1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.request.request_id, first.request.request_id);
        assert_eq!(second.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_response_stream() {
        let broker = MemoryBroker::new();
        broker.publish_response("r1", "answer").await.unwrap();
        assert_eq!(
            broker.fetch_response("r1").await.unwrap(),
            Some("answer".to_string())
        );
        assert_eq!(broker.fetch_response("r2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failing_mode() {
        let broker = MemoryBroker::new();
        broker.set_failing(true);
        assert!(broker.publish(&request("x")).await.is_err());
        assert!(!broker.health_check().await.unwrap().connected);
    }
}
