//! Escalation error types.

use thiserror::Error;

use guardian_audit::AuditError;
use guardian_limiter::LimiterError;
use guardian_queue::QueueError;
use guardian_rules::RegistryError;
use guardian_store::StoreError;

#[derive(Error, Debug)]
pub enum EscalationError {
    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Limiter(#[from] LimiterError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("unknown audit id: {0}")]
    UnknownAudit(String),

    #[error("injection channel requires the privileged tier")]
    Unauthorized,
}
