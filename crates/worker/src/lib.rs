//! Asynchronous inference worker.
//!
//! Workers claim admitted requests from the queue, re-verify the subject is
//! not suspended, call the model inside a sandbox policy with bounded
//! retries, post-check the output with the Guardian engine (and optional ML
//! collaborator), watermark risky subjects, and route the result to the
//! response stream or the escalation handler. Processing is idempotent on
//! `request_id`, so at-least-once queue delivery yields exactly-once
//! effects.

pub mod model;
pub mod postcheck;
pub mod runner;
pub mod worker;

pub use model::{HttpModelClient, ModelClient, ModelError, SandboxPolicy};
pub use postcheck::{MlPostCheck, MlThresholds};
pub use runner::{ShutdownSignal, WorkerRunner, WorkerRunnerConfig};
pub use worker::{InferenceWorker, WorkerConfig, WorkerError};
