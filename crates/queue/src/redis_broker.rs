//! Redis Streams broker (requires the `queue-redis` feature).
//!
//! Requests go to one stream consumed through a consumer group
//! (XADD / XREADGROUP / XACK / XPENDING); responses go to a second stream.
//! Workers pass distinct consumer names — sharing one would break pending
//! tracking.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::info;

use crate::broker::{QueueHealth, StreamBroker, StreamMessage};
use crate::envelope::QueuedRequest;
use crate::error::QueueError;

const REQUEST_STREAM: &str = "guardian:requests";
const RESPONSE_STREAM: &str = "guardian:responses";
const CONSUMER_GROUP: &str = "guardian-workers";
const PAYLOAD_FIELD: &str = "payload";

/// Consumer-group stream broker over Redis Streams.
pub struct RedisStreamBroker {
    conn: MultiplexedConnection,
}

impl RedisStreamBroker {
    /// Connect and ensure the consumer group exists (idempotent).
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)
            .map_err(|e| QueueError::Config(format!("invalid redis url: {}", e)))?;
        let mut conn = client.get_multiplexed_tokio_connection().await?;

        // MKSTREAM creates the stream on first boot; BUSYGROUP means the
        // group already exists, which is fine.
        let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(REQUEST_STREAM)
            .arg(CONSUMER_GROUP)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => info!(stream = REQUEST_STREAM, group = CONSUMER_GROUP, "consumer group created"),
            Err(e) if e.to_string().contains("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self { conn })
    }
}

#[async_trait]
impl StreamBroker for RedisStreamBroker {
    async fn publish(&self, request: &QueuedRequest) -> Result<String, QueueError> {
        let payload = serde_json::to_string(request)
            .map_err(|e| QueueError::Payload(e.to_string()))?;
        let mut conn = self.conn.clone();
        let stream_id: String = conn
            .xadd(REQUEST_STREAM, "*", &[(PAYLOAD_FIELD, payload.as_str())])
            .await?;
        Ok(stream_id)
    }

    async fn claim(
        &self,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamMessage>, QueueError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(CONSUMER_GROUP, consumer)
            .count(1)
            .block(block.as_millis() as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[REQUEST_STREAM], &[">"], &options)
            .await?;

        let Some(key) = reply.keys.into_iter().next() else {
            return Ok(None);
        };
        let Some(entry) = key.ids.into_iter().next() else {
            return Ok(None);
        };

        let payload: String = entry
            .map
            .get(PAYLOAD_FIELD)
            .and_then(|v| redis::from_redis_value(v).ok())
            .ok_or_else(|| QueueError::Payload("message missing payload field".to_string()))?;
        let request: QueuedRequest = serde_json::from_str(&payload)
            .map_err(|e| QueueError::Payload(e.to_string()))?;

        Ok(Some(StreamMessage {
            stream_id: entry.id,
            request,
            // New deliveries via `>` are always first delivery; redeliveries
            // surface through pending inspection and XCLAIM tooling.
            delivery_count: 1,
        }))
    }

    async fn ack(&self, stream_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _acked: i64 = conn.xack(REQUEST_STREAM, CONSUMER_GROUP, &[stream_id]).await?;
        Ok(())
    }

    async fn pending(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        // XPENDING summary reply: [count, min-id, max-id, consumers].
        let reply: redis::Value = redis::cmd("XPENDING")
            .arg(REQUEST_STREAM)
            .arg(CONSUMER_GROUP)
            .query_async(&mut conn)
            .await?;
        match reply {
            redis::Value::Array(items) => match items.first() {
                Some(redis::Value::Int(count)) => Ok((*count).max(0) as u64),
                _ => Ok(0),
            },
            _ => Ok(0),
        }
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(REQUEST_STREAM).await?;
        Ok(len)
    }

    async fn publish_response(
        &self,
        request_id: &str,
        response_text: &str,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _id: String = conn
            .xadd(
                RESPONSE_STREAM,
                "*",
                &[("request_id", request_id), ("body", response_text)],
            )
            .await?;
        Ok(())
    }

    async fn fetch_response(&self, request_id: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamRangeReply =
            conn.xrange_all(RESPONSE_STREAM).await?;
        for entry in reply.ids {
            let id: Option<String> = entry
                .map
                .get("request_id")
                .and_then(|v| redis::from_redis_value(v).ok());
            if id.as_deref() == Some(request_id) {
                let body: Option<String> = entry
                    .map
                    .get("body")
                    .and_then(|v| redis::from_redis_value(v).ok());
                return Ok(body);
            }
        }
        Ok(None)
    }

    async fn health_check(&self) -> Result<QueueHealth, QueueError> {
        let mut conn = self.conn.clone();
        let ping: Result<(), redis::RedisError> =
            redis::cmd("PING").query_async(&mut conn).await;
        match ping {
            Ok(()) => {
                let depth: u64 = conn.xlen(REQUEST_STREAM).await.unwrap_or(0);
                Ok(QueueHealth {
                    connected: true,
                    depth: Some(depth),
                    provider: "redis".to_string(),
                })
            }
            Err(_) => Ok(QueueHealth {
                connected: false,
                depth: None,
                provider: "redis".to_string(),
            }),
        }
    }
}
