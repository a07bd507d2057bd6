//! The synchronous hot path: admission, pre-check, enqueue.
//!
//! [`SafetyPipeline::submit`] runs every inbound request through the
//! fail-closed gate, the suspension check, adaptive rate limiting, canary
//! replay detection, and the Guardian pre-check, then enqueues admitted
//! work for the asynchronous workers. Refusals are values carrying a
//! support ticket (audit id); infrastructure failures surface as
//! `SAFETY_UNAVAILABLE` and never fall through to the model.

pub mod auth;
pub mod pipeline;

pub use auth::{AuthError, AuthProvider, AuthedSubject, Credentials, StaticKeyAuth};
pub use pipeline::{
    spawn_backpressure_monitor, PipelineConfig, SafetyPipeline, SubmitOutcome,
};
