//! Queue error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue unreachable: {0}")]
    Unreachable(String),

    #[error("queue operation failed: {0}")]
    Backend(String),

    #[error("queue payload invalid: {0}")]
    Payload(String),

    #[error("queue misconfigured: {0}")]
    Config(String),
}

#[cfg(feature = "queue-redis")]
impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            QueueError::Unreachable(e.to_string())
        } else {
            QueueError::Backend(e.to_string())
        }
    }
}
