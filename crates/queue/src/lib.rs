//! Inference queue: the boundary between the synchronous hot path and the
//! asynchronous workers.
//!
//! The [`StreamBroker`] contract is a persistent, ordered, multi-reader
//! stream with consumer groups, at-least-once delivery, acknowledgements,
//! and pending-message inspection. [`MemoryBroker`] backs tests and explicit
//! degraded mode; the Redis Streams backend (`queue-redis` feature) backs
//! production.

pub mod broker;
pub mod envelope;
pub mod error;
pub mod memory;
#[cfg(feature = "queue-redis")]
pub mod redis_broker;

pub use broker::{QueueHealth, StreamBroker, StreamMessage};
pub use envelope::{PreCheckSummary, QueuedRequest};
pub use error::QueueError;
pub use memory::MemoryBroker;
#[cfg(feature = "queue-redis")]
pub use redis_broker::RedisStreamBroker;
