//! Stream broker trait and shared types.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::envelope::QueuedRequest;
use crate::error::QueueError;

/// A claimed message with its broker-side identity.
#[derive(Debug, Clone)]
pub struct StreamMessage {
    /// Broker-specific id used for acknowledgement.
    pub stream_id: String,
    pub request: QueuedRequest,
    /// Number of times this message has been delivered (≥ 2 on redelivery).
    pub delivery_count: u32,
}

/// Health status of a broker connection.
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub connected: bool,
    /// Approximate number of messages waiting (undelivered).
    pub depth: Option<u64>,
    /// Broker backend name (e.g. "redis", "memory").
    pub provider: String,
}

impl fmt::Display for QueueHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QueueHealth {{ connected: {}, depth: {:?}, provider: {} }}",
            self.connected, self.depth, self.provider
        )
    }
}

/// Persistent multi-reader stream with consumer-group semantics.
///
/// Delivery is at-least-once: a claimed-but-unacknowledged message may be
/// redelivered, so consumers must be idempotent on `request_id`. Workers
/// must not share a consumer identity.
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Append a request to the inference stream. Returns the stream id.
    async fn publish(&self, request: &QueuedRequest) -> Result<String, QueueError>;

    /// Claim the next pending message for `consumer`, blocking up to
    /// `block` before returning `None`.
    async fn claim(
        &self,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamMessage>, QueueError>;

    /// Acknowledge successful processing.
    async fn ack(&self, stream_id: &str) -> Result<(), QueueError>;

    /// Number of claimed-but-unacknowledged messages.
    async fn pending(&self) -> Result<u64, QueueError>;

    /// Number of undelivered messages (backpressure signal).
    async fn depth(&self) -> Result<u64, QueueError>;

    /// Publish a completed response for a request.
    async fn publish_response(
        &self,
        request_id: &str,
        response_text: &str,
    ) -> Result<(), QueueError>;

    /// Fetch the published response for a request, if any.
    async fn fetch_response(&self, request_id: &str) -> Result<Option<String>, QueueError>;

    /// Check broker connectivity and return health status.
    async fn health_check(&self) -> Result<QueueHealth, QueueError>;
}
