//! Canary watermarks: invisible markers that detect output recycling.
//!
//! Responses to risky subjects carry a marker built from zero-width code
//! points (invisible to humans, survives copy/paste). A later input
//! containing a live marker identifies the subject recycling model output —
//! a common multi-turn jailbreak — and is blocked with `CANARY_REPLAY`.
//!
//! The marker scheme is locked: changing it would invalidate outstanding
//! canaries, so the scheme identifier participates in the stored hash.

pub mod marker;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use guardian_risk::{RiskError, RiskScoreManager};
use guardian_store::{KvStore, StoreError};

use marker::{encode_marker, find_marker, SCHEME_ID};

/// Risk score above which responses are watermarked.
pub const WATERMARK_THRESHOLD: f64 = 0.2;

/// Stored canaries expire after this long.
pub const CANARY_TTL: Duration = Duration::from_secs(24 * 3600);

/// A stored canary record, keyed by the hash of its marker bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Canary {
    pub canary_id: String,
    pub issued_to: String,
    pub issued_ts: DateTime<Utc>,
}

/// A live canary found in an input.
#[derive(Debug, Clone, PartialEq)]
pub struct CanaryHit {
    pub canary_id: String,
    /// The subject the canary was issued to (the replayer).
    pub issued_to: String,
}

#[derive(Error, Debug)]
pub enum CanaryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Risk(#[from] RiskError),

    #[error("canary record corrupted")]
    Corrupt,
}

/// Issues and detects canary watermarks backed by the shared store.
pub struct CanarySubsystem {
    store: Arc<dyn KvStore>,
    risk: Arc<RiskScoreManager>,
    ttl: Duration,
}

impl CanarySubsystem {
    pub fn new(store: Arc<dyn KvStore>, risk: Arc<RiskScoreManager>) -> Self {
        Self {
            store,
            risk,
            ttl: CANARY_TTL,
        }
    }

    #[cfg(test)]
    fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn key_for(marker: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(SCHEME_ID.as_bytes());
        hasher.update(marker.as_bytes());
        format!("canary:{:x}", hasher.finalize())
    }

    /// Whether the subject's current risk score warrants a watermark.
    pub async fn should_watermark(&self, subject_id: &str) -> Result<bool, CanaryError> {
        let score = self.risk.get(subject_id).await?.value;
        Ok(score > WATERMARK_THRESHOLD)
    }

    /// Embed an invisible marker in `response_text` and record the canary.
    /// Returns the marked text and the canary id.
    pub async fn issue(
        &self,
        subject_id: &str,
        response_text: &str,
    ) -> Result<(String, String), CanaryError> {
        let mut raw = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = u64::from_be_bytes(raw);

        let canary_id = format!("c_{:016x}", token);
        let marker = encode_marker(token);

        let canary = Canary {
            canary_id: canary_id.clone(),
            issued_to: subject_id.to_string(),
            issued_ts: Utc::now(),
        };
        let serialized = serde_json::to_string(&canary).map_err(|_| CanaryError::Corrupt)?;
        self.store
            .set(&Self::key_for(&marker), &serialized, Some(self.ttl))
            .await?;

        let mut marked = String::with_capacity(response_text.len() + marker.len());
        marked.push_str(response_text);
        marked.push_str(&marker);

        info!(subject_id, canary_id = %canary_id, "canary issued");
        Ok((marked, canary_id))
    }

    /// Scan an input for any live canary marker.
    pub async fn detect(&self, input_text: &str) -> Result<Option<CanaryHit>, CanaryError> {
        let Some(token) = find_marker(input_text) else {
            return Ok(None);
        };
        let marker = encode_marker(token);
        let Some(raw) = self.store.get(&Self::key_for(&marker)).await? else {
            // Expired or foreign marker: decodeable but not live.
            debug!("zero-width marker found but no live canary matches");
            return Ok(None);
        };
        let canary: Canary = serde_json::from_str(&raw).map_err(|_| CanaryError::Corrupt)?;
        Ok(Some(CanaryHit {
            canary_id: canary.canary_id,
            issued_to: canary.issued_to,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use guardian_core::types::Severity;
    use guardian_store::MemoryStore;

    fn fixture() -> (Arc<MemoryStore>, Arc<RiskScoreManager>, CanarySubsystem) {
        let store = Arc::new(MemoryStore::new());
        let risk = Arc::new(RiskScoreManager::new(store.clone() as Arc<dyn KvStore>));
        let canary = CanarySubsystem::new(store.clone() as Arc<dyn KvStore>, Arc::clone(&risk));
        (store, risk, canary)
    }

    #[tokio::test]
    async fn test_watermark_threshold() {
        let (_, risk, canary) = fixture();
        assert!(!canary.should_watermark("u1").await.unwrap());

        // One high violation puts the subject at 0.3 > 0.2.
        risk.record_violation("u1", Severity::High).await.unwrap();
        assert!(canary.should_watermark("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_issue_then_detect_round_trip() {
        let (_, _, canary) = fixture();
        let (marked, canary_id) = canary.issue("u1", "Here is your answer.").await.unwrap();

        // The marker is invisible: visible characters unchanged.
        assert!(marked.starts_with("Here is your answer."));
        assert_ne!(marked, "Here is your answer.");

        let hit = canary.detect(&marked).await.unwrap().unwrap();
        assert_eq!(hit.canary_id, canary_id);
        assert_eq!(hit.issued_to, "u1");
    }

    #[tokio::test]
    async fn test_detect_survives_copy_paste_context() {
        let (_, _, canary) = fixture();
        let (marked, canary_id) = canary.issue("u1", "step two").await.unwrap();

        // Attacker pastes the response into a longer prompt.
        let replayed = format!("continue from here: {} and then explain more", marked);
        let hit = canary.detect(&replayed).await.unwrap().unwrap();
        assert_eq!(hit.canary_id, canary_id);
    }

    #[tokio::test]
    async fn test_benign_text_no_detection() {
        let (_, _, canary) = fixture();
        assert!(canary
            .detect("The quick brown fox jumps over the lazy dog.")
            .await
            .unwrap()
            .is_none());
        // Stray zero-width characters alone do not form a marker.
        assert!(canary
            .detect("odd\u{200B}spacing\u{200C}here\u{2060}")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_expired_canary_not_detected() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let risk = Arc::new(RiskScoreManager::new(store.clone() as Arc<dyn KvStore>));
        let canary = CanarySubsystem::new(store as Arc<dyn KvStore>, risk)
            .with_ttl(Duration::from_millis(5));

        let (marked, _) = canary.issue("u1", "ephemeral").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(canary.detect(&marked).await.unwrap().is_none());
    }
}
