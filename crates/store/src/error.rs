//! Store error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unreachable(String),

    #[error("store operation failed: {0}")]
    Backend(String),

    #[error("store misconfigured: {0}")]
    Config(String),
}

#[cfg(feature = "store-redis")]
impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            StoreError::Unreachable(e.to_string())
        } else {
            StoreError::Backend(e.to_string())
        }
    }
}
