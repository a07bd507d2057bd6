//! Escalation handling: record, notify, gate, and learn.
//!
//! The handler writes the escalation to the audit ledger first (the durable
//! artifact), then fans out notifications sized to severity, then applies
//! the systematic-misuse policy. Human review appends to the audit lineage
//! and either releases held output or feeds the dynamic blocklist. The
//! privileged injection channel turns reviewer knowledge into globally
//! propagated rules without a restart.

pub mod error;
pub mod handler;
pub mod inject;

pub use error::EscalationError;
pub use handler::{EscalationConfig, EscalationHandler, ReviewDecision};
pub use inject::RuleInjector;
