//! Append-only audit ledger.
//!
//! Every safety decision leaves an immutable [`AuditRecord`]. Amendments
//! never rewrite history: a follow-up record joins the original's lineage,
//! and the full chain is read back with
//! [`AuditStore::read_by_lineage`]. The audit id doubles as the
//! user-facing support ticket id, so every refusal is traceable.
//!
//! The ledger is durable storage: its unavailability fails the admission
//! gate closed.

pub mod error;
pub mod memory;
#[cfg(feature = "audit-postgres")]
pub mod postgres;
pub mod record;

use std::time::Duration;

use async_trait::async_trait;

pub use error::AuditError;
pub use memory::MemoryAuditStore;
#[cfg(feature = "audit-postgres")]
pub use postgres::PgAuditStore;
pub use record::{AuditDecision, AuditRecord, AuditStage, AuditStatus};

/// Durable, append-only audit storage.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append one record. Records are immutable once written.
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError>;

    /// Append several records atomically (all or none).
    async fn append_all(&self, records: Vec<AuditRecord>) -> Result<(), AuditError>;

    /// Read the full lineage chain for a root audit id, oldest first.
    async fn read_by_lineage(&self, lineage_id: &str) -> Result<Vec<AuditRecord>, AuditError>;

    /// Records for a subject within the trailing window, newest first,
    /// optionally filtered by stage. Drives the systematic-misuse policy.
    async fn recent_for_subject(
        &self,
        subject_id: &str,
        window: Duration,
        stage: Option<AuditStage>,
    ) -> Result<Vec<AuditRecord>, AuditError>;

    /// Reachability probe for the fail-closed admission gate.
    async fn ping(&self) -> Result<(), AuditError>;
}
