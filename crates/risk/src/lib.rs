//! Per-subject cumulative risk scoring.
//!
//! A subject's score erodes trust on observed violations (severity-weighted,
//! saturating at 1.0) and cools linearly over time (0.1 per hour, floor 0.0).
//! All mutations are compare-and-swap round-trips against the shared
//! key-value store so distributed serving instances agree on the score.
//!
//! Decay is centralized in [`decayed_value`]; `get`, `decay`, and
//! `record_violation` all route through it so the score can never be
//! double-cooled.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use guardian_core::types::Severity;
use guardian_store::{KvStore, StoreError};

/// Linear decay applied to the score, per hour since the last update.
pub const DECAY_PER_HOUR: f64 = 0.1;

/// Subjects idle longer than this may be pruned from the store.
const IDLE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// Bounded CAS retries before surfacing contention as a store error.
const CAS_ATTEMPTS: usize = 5;

/// Stored risk state for one subject.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskScore {
    /// Current value in 0.0..1.0 as of `last_update_ts` (decay is applied
    /// on read).
    pub value: f64,
    pub last_update_ts: DateTime<Utc>,
    /// Number of violations ever recorded for this subject.
    pub event_count: u64,
}

impl RiskScore {
    fn zero(now: DateTime<Utc>) -> Self {
        Self {
            value: 0.0,
            last_update_ts: now,
            event_count: 0,
        }
    }
}

#[derive(Error, Debug)]
pub enum RiskError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("risk state corrupted for subject: {0}")]
    Corrupt(String),

    #[error("risk update contention exceeded retry budget")]
    Contention,
}

/// The single decay computation: linear cooling since `last_update`,
/// floored at zero.
pub fn decayed_value(value: f64, last_update: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let elapsed = now.signed_duration_since(last_update);
    if elapsed <= chrono::Duration::zero() {
        return value;
    }
    let hours = elapsed.num_milliseconds() as f64 / 3_600_000.0;
    (value - DECAY_PER_HOUR * hours).max(0.0)
}

/// Per-subject risk score manager over the shared store.
pub struct RiskScoreManager {
    store: Arc<dyn KvStore>,
}

impl RiskScoreManager {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn key(subject_id: &str) -> String {
        format!("risk:{}", subject_id)
    }

    async fn read_raw(&self, subject_id: &str) -> Result<Option<(String, RiskScore)>, RiskError> {
        let Some(raw) = self.store.get(&Self::key(subject_id)).await? else {
            return Ok(None);
        };
        let score: RiskScore = serde_json::from_str(&raw)
            .map_err(|_| RiskError::Corrupt(subject_id.to_string()))?;
        Ok(Some((raw, score)))
    }

    /// Current score with decay applied lazily. Subjects with no recorded
    /// violations read as zero.
    pub async fn get(&self, subject_id: &str) -> Result<RiskScore, RiskError> {
        let now = Utc::now();
        match self.read_raw(subject_id).await? {
            Some((_, stored)) => Ok(RiskScore {
                value: decayed_value(stored.value, stored.last_update_ts, now),
                last_update_ts: stored.last_update_ts,
                event_count: stored.event_count,
            }),
            None => Ok(RiskScore::zero(now)),
        }
    }

    /// Atomically record a violation: decay to now, add the severity
    /// weight, saturate at 1.0. Returns the new value.
    pub async fn record_violation(
        &self,
        subject_id: &str,
        severity: Severity,
    ) -> Result<f64, RiskError> {
        self.update(subject_id, |current, now| {
            let cooled = decayed_value(current.value, current.last_update_ts, now);
            RiskScore {
                value: (cooled + severity.risk_weight()).min(1.0),
                last_update_ts: now,
                event_count: current.event_count + 1,
            }
        })
        .await
    }

    /// Force the score to the ceiling (canary replay: the attacker's own
    /// risk saturates). Returns the new value.
    pub async fn saturate(&self, subject_id: &str) -> Result<f64, RiskError> {
        self.update(subject_id, |current, now| RiskScore {
            value: 1.0,
            last_update_ts: now,
            event_count: current.event_count + 1,
        })
        .await
    }

    /// Persist the decayed value (used by periodic maintenance). Returns the
    /// new value.
    pub async fn decay(&self, subject_id: &str) -> Result<f64, RiskError> {
        self.update(subject_id, |current, now| RiskScore {
            value: decayed_value(current.value, current.last_update_ts, now),
            last_update_ts: now,
            event_count: current.event_count,
        })
        .await
    }

    async fn update(
        &self,
        subject_id: &str,
        apply: impl Fn(&RiskScore, DateTime<Utc>) -> RiskScore,
    ) -> Result<f64, RiskError> {
        let key = Self::key(subject_id);
        for _ in 0..CAS_ATTEMPTS {
            let now = Utc::now();
            let (expected, current) = match self.read_raw(subject_id).await? {
                Some((raw, score)) => (Some(raw), score),
                None => (None, RiskScore::zero(now)),
            };
            let next = apply(&current, now);
            let serialized =
                serde_json::to_string(&next).map_err(|_| RiskError::Corrupt(subject_id.to_string()))?;
            let swapped = self
                .store
                .compare_and_swap(&key, expected.as_deref(), &serialized, Some(IDLE_TTL))
                .await?;
            if swapped {
                debug!(subject_id, value = next.value, events = next.event_count, "risk score updated");
                return Ok(next.value);
            }
        }
        Err(RiskError::Contention)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use guardian_store::MemoryStore;

    fn manager() -> RiskScoreManager {
        RiskScoreManager::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_unknown_subject_reads_zero() {
        let mgr = manager();
        let score = mgr.get("nobody").await.unwrap();
        assert_eq!(score.value, 0.0);
        assert_eq!(score.event_count, 0);
    }

    #[tokio::test]
    async fn test_violation_weights() {
        let mgr = manager();
        assert_eq!(mgr.record_violation("u1", Severity::Critical).await.unwrap(), 0.5);
        assert_eq!(mgr.record_violation("u2", Severity::High).await.unwrap(), 0.3);
        assert_eq!(mgr.record_violation("u3", Severity::Medium).await.unwrap(), 0.15);
        assert_eq!(mgr.record_violation("u4", Severity::Low).await.unwrap(), 0.05);
    }

    #[tokio::test]
    async fn test_violation_strictly_increases_until_saturation() {
        let mgr = manager();
        let mut previous = mgr.get("u1").await.unwrap().value;
        for _ in 0..2 {
            let next = mgr.record_violation("u1", Severity::High).await.unwrap();
            assert!(next > previous);
            previous = next;
        }
    }

    #[tokio::test]
    async fn test_saturates_at_one() {
        let mgr = manager();
        for _ in 0..4 {
            mgr.record_violation("u1", Severity::Critical).await.unwrap();
        }
        let score = mgr.get("u1").await.unwrap();
        assert!(score.value > 0.999);
        // Events are still recorded past saturation.
        assert_eq!(score.event_count, 4);
    }

    #[tokio::test]
    async fn test_saturate_jumps_to_ceiling() {
        let mgr = manager();
        mgr.record_violation("u1", Severity::Low).await.unwrap();
        let value = mgr.saturate("u1").await.unwrap();
        assert_eq!(value, 1.0);
        assert_eq!(mgr.get("u1").await.unwrap().event_count, 2);
    }

    #[tokio::test]
    async fn test_event_count_accumulates() {
        let mgr = manager();
        mgr.record_violation("u1", Severity::Low).await.unwrap();
        mgr.record_violation("u1", Severity::Low).await.unwrap();
        assert_eq!(mgr.get("u1").await.unwrap().event_count, 2);
    }

    #[test]
    fn test_decay_formula() {
        let now = Utc::now();
        let one_hour_ago = now - chrono::Duration::hours(1);
        let value = decayed_value(0.5, one_hour_ago, now);
        assert!((value - 0.4).abs() < 1e-9);

        // Floor at zero.
        let ten_hours_ago = now - chrono::Duration::hours(10);
        assert_eq!(decayed_value(0.5, ten_hours_ago, now), 0.0);

        // Clock skew: never decay into the future.
        let future = now + chrono::Duration::hours(1);
        assert_eq!(decayed_value(0.5, future, now), 0.5);
    }

    #[tokio::test]
    async fn test_explicit_decay_agrees_with_lazy_read() {
        let mgr = manager();
        mgr.record_violation("u1", Severity::Critical).await.unwrap();

        // Immediately decaying changes nothing measurable.
        let persisted = mgr.decay("u1").await.unwrap();
        let read = mgr.get("u1").await.unwrap().value;
        assert!((persisted - read).abs() < 1e-6);
    }
}
