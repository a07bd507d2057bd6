//! Shared types and configuration for the safety enforcement pipeline.
//!
//! This crate provides:
//! - Environment-driven [`config::Config`] with a redacted startup summary
//! - The severity / action / trust-tier taxonomy used by every stage
//! - The closed [`types::ReasonCode`] set surfaced in refusals
//! - Request and refusal envelopes

pub mod config;
pub mod envelope;
pub mod types;

pub use envelope::{RefusalEnvelope, RequestEnvelope};
pub use types::{ReasonCode, RuleAction, RuleCategory, Severity, TrustTier};
