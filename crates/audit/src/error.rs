//! Audit store error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit store unreachable: {0}")]
    Unreachable(String),

    #[error("audit store operation failed: {0}")]
    Backend(String),
}

#[cfg(feature = "audit-postgres")]
impl From<sqlx::Error> for AuditError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                AuditError::Unreachable(e.to_string())
            }
            other => AuditError::Backend(other.to_string()),
        }
    }
}
