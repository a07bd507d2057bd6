//! Subject suspensions, consulted before rate limiting on every admission.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use guardian_store::{KvStore, StoreError};

/// An active suspension for a subject.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Suspension {
    pub subject_id: String,
    pub reason: String,
    pub created_ts: DateTime<Utc>,
    /// `None` means indefinite (manual lift required).
    pub expires_ts: Option<DateTime<Utc>>,
}

impl Suspension {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_ts.map(|at| now >= at).unwrap_or(false)
    }
}

/// Suspension records in the shared store, keyed `suspension:{subject}`.
pub struct SuspensionStore {
    store: Arc<dyn KvStore>,
}

impl SuspensionStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn key(subject_id: &str) -> String {
        format!("suspension:{}", subject_id)
    }

    /// Create (or replace) a suspension. The store entry expires with the
    /// suspension so idle subjects cost nothing.
    pub async fn suspend(
        &self,
        subject_id: &str,
        reason: &str,
        duration: Option<Duration>,
    ) -> Result<Suspension, StoreError> {
        let now = Utc::now();
        let suspension = Suspension {
            subject_id: subject_id.to_string(),
            reason: reason.to_string(),
            created_ts: now,
            expires_ts: duration.map(|d| now + chrono::Duration::from_std(d).unwrap_or_default()),
        };
        let serialized = serde_json::to_string(&suspension)
            .map_err(|e| StoreError::Backend(format!("suspension serialize: {}", e)))?;
        self.store
            .set(&Self::key(subject_id), &serialized, duration)
            .await?;
        info!(subject_id, reason, expires = ?suspension.expires_ts, "subject suspended");
        Ok(suspension)
    }

    /// The active suspension for a subject, if any. A store error here must
    /// fail closed upstream.
    pub async fn active(&self, subject_id: &str) -> Result<Option<Suspension>, StoreError> {
        let Some(raw) = self.store.get(&Self::key(subject_id)).await? else {
            return Ok(None);
        };
        let suspension: Suspension = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Backend(format!("suspension decode: {}", e)))?;
        if suspension.is_expired(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(suspension))
    }

    /// Lift a suspension (reviewer action).
    pub async fn lift(&self, subject_id: &str) -> Result<(), StoreError> {
        self.store.delete(&Self::key(subject_id)).await?;
        info!(subject_id, "suspension lifted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use guardian_store::MemoryStore;

    fn store() -> SuspensionStore {
        SuspensionStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_suspend_and_query() {
        let suspensions = store();
        suspensions
            .suspend("u1", "systematic misuse", Some(Duration::from_secs(24 * 3600)))
            .await
            .unwrap();

        let active = suspensions.active("u1").await.unwrap().unwrap();
        assert_eq!(active.subject_id, "u1");
        assert!(active.expires_ts.is_some());
        assert!(suspensions.active("u2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lift() {
        let suspensions = store();
        suspensions.suspend("u1", "test", None).await.unwrap();
        suspensions.lift("u1").await.unwrap();
        assert!(suspensions.active("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_suspension_reads_none() {
        let suspensions = store();
        suspensions
            .suspend("u1", "short", Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(suspensions.active("u1").await.unwrap().is_none());
    }
}
