//! In-process audit store for tests and explicit degraded mode.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::AuditError;
use crate::record::{AuditRecord, AuditStage};
use crate::AuditStore;

/// Append-only vector of records behind a lock.
pub struct MemoryAuditStore {
    records: RwLock<Vec<AuditRecord>>,
    failing: RwLock<bool>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            failing: RwLock::new(false),
        }
    }

    /// Simulate the ledger going away (tests only).
    pub fn set_failing(&self, failing: bool) {
        *self.failing.write().expect("failing lock poisoned") = failing;
    }

    fn check_failing(&self) -> Result<(), AuditError> {
        if *self.failing.read().expect("failing lock poisoned") {
            return Err(AuditError::Unreachable("memory audit store disabled".to_string()));
        }
        Ok(())
    }

    /// Every record ever appended (tests only).
    pub fn all(&self) -> Vec<AuditRecord> {
        self.records.read().expect("records lock poisoned").clone()
    }
}

impl Default for MemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.check_failing()?;
        self.records
            .write()
            .expect("records lock poisoned")
            .push(record);
        Ok(())
    }

    async fn append_all(&self, records: Vec<AuditRecord>) -> Result<(), AuditError> {
        self.check_failing()?;
        self.records
            .write()
            .expect("records lock poisoned")
            .extend(records);
        Ok(())
    }

    async fn read_by_lineage(&self, lineage_id: &str) -> Result<Vec<AuditRecord>, AuditError> {
        self.check_failing()?;
        let records = self.records.read().expect("records lock poisoned");
        let mut chain: Vec<AuditRecord> = records
            .iter()
            .filter(|r| r.lineage_id == lineage_id)
            .cloned()
            .collect();
        chain.sort_by_key(|r| r.created_ts);
        Ok(chain)
    }

    async fn recent_for_subject(
        &self,
        subject_id: &str,
        window: Duration,
        stage: Option<AuditStage>,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        self.check_failing()?;
        let cutoff = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
        let records = self.records.read().expect("records lock poisoned");
        let mut matched: Vec<AuditRecord> = records
            .iter()
            .filter(|r| r.subject_id == subject_id && r.created_ts >= cutoff)
            .filter(|r| stage.map(|s| r.stage == s).unwrap_or(true))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_ts.cmp(&a.created_ts));
        Ok(matched)
    }

    async fn ping(&self) -> Result<(), AuditError> {
        self.check_failing()
    }
}
