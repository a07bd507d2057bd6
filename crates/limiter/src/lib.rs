//! Adaptive per-subject rate limiting.
//!
//! A token bucket per subject whose capacity and refill rate are recomputed
//! on every admission from the trust tier, the current risk score, any
//! misuse penalty, and the global shed factor. Bucket state lives in the
//! shared store; the consume operation is a compare-and-swap so concurrent
//! admissions for one subject serialize at the store.
//!
//! Store errors never fall through to unlimited admission: the caller maps
//! them to `SAFETY_UNAVAILABLE` (fail-closed).

pub mod suspension;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use guardian_core::types::TrustTier;
use guardian_risk::{RiskError, RiskScoreManager};
use guardian_store::{KvStore, StoreError};

pub use suspension::{Suspension, SuspensionStore};

/// Bounded CAS retries before surfacing contention.
const CAS_ATTEMPTS: usize = 5;

/// Idle buckets may be pruned after this long.
const BUCKET_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

// ── Tier baselines ────────────────────────────────────────────

/// Baseline bucket parameters for a trust tier.
#[derive(Debug, Clone, Copy)]
pub struct TierLimits {
    pub capacity: f64,
    /// Tokens per second.
    pub refill_rate: f64,
}

impl TierLimits {
    /// Baselines: anon < user < verified < privileged.
    pub fn baseline(tier: TrustTier) -> Self {
        match tier {
            TrustTier::Anon => TierLimits {
                capacity: 10.0,
                refill_rate: 10.0 / 60.0,
            },
            TrustTier::User => TierLimits {
                capacity: 60.0,
                refill_rate: 1.0,
            },
            TrustTier::Verified => TierLimits {
                capacity: 120.0,
                refill_rate: 2.0,
            },
            TrustTier::Privileged => TierLimits {
                capacity: 600.0,
                refill_rate: 10.0,
            },
        }
    }
}

/// Risk-band adjustment applied to the tier baseline.
fn risk_factor(score: f64) -> f64 {
    if score >= 0.7 {
        0.1
    } else if score >= 0.3 {
        0.5
    } else {
        1.0
    }
}

// ── Shed control ──────────────────────────────────────────────

/// Global backpressure switch: while shedding, effective capacities are
/// halved for everyone until queue depth recovers.
#[derive(Debug, Default)]
pub struct ShedControl {
    shedding: AtomicBool,
}

impl ShedControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_shedding(&self, shedding: bool) {
        self.shedding.store(shedding, Ordering::Relaxed);
    }

    pub fn is_shedding(&self) -> bool {
        self.shedding.load(Ordering::Relaxed)
    }

    fn factor(&self) -> f64 {
        if self.is_shedding() {
            0.5
        } else {
            1.0
        }
    }
}

// ── Bucket state ──────────────────────────────────────────────

/// Persisted bucket state. Capacity and refill rate are derived on each
/// admission, so only the token count and refill timestamp matter; the rest
/// is stored for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucket {
    pub capacity: f64,
    pub tokens: f64,
    pub refill_rate: f64,
    pub last_refill_ts: DateTime<Utc>,
    pub tier: TrustTier,
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AdmitDecision {
    pub allowed: bool,
    /// Whole tokens remaining after this decision.
    pub remaining: u64,
    /// When to retry, for denied requests.
    pub retry_after_ms: Option<u64>,
    /// The risk score in force for this decision.
    pub risk_score: f64,
}

#[derive(Error, Debug)]
pub enum LimiterError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Risk(#[from] RiskError),

    #[error("bucket state corrupted for subject: {0}")]
    Corrupt(String),

    #[error("bucket update contention exceeded retry budget")]
    Contention,
}

// ── Limiter ───────────────────────────────────────────────────

/// Token-bucket admission keyed on subject, adapted by risk score.
pub struct AdaptiveRateLimiter {
    store: Arc<dyn KvStore>,
    risk: Arc<RiskScoreManager>,
    shed: Arc<ShedControl>,
}

impl AdaptiveRateLimiter {
    pub fn new(store: Arc<dyn KvStore>, risk: Arc<RiskScoreManager>, shed: Arc<ShedControl>) -> Self {
        Self { store, risk, shed }
    }

    fn bucket_key(subject_id: &str) -> String {
        format!("bucket:{}", subject_id)
    }

    fn penalty_key(subject_id: &str) -> String {
        format!("penalty:{}", subject_id)
    }

    /// Effective parameters for this admission: tier baseline scaled by the
    /// risk band, any misuse penalty, and the global shed factor.
    async fn effective_limits(
        &self,
        subject_id: &str,
        tier: TrustTier,
        risk_score: f64,
    ) -> Result<TierLimits, LimiterError> {
        let baseline = TierLimits::baseline(tier);
        let mut factor = risk_factor(risk_score) * self.shed.factor();
        if let Some(raw) = self.store.get(&Self::penalty_key(subject_id)).await? {
            if let Ok(penalty) = raw.parse::<f64>() {
                factor *= penalty.clamp(0.0, 1.0);
            }
        }
        Ok(TierLimits {
            capacity: (baseline.capacity * factor).max(1.0),
            refill_rate: (baseline.refill_rate * factor).max(f64::MIN_POSITIVE),
        })
    }

    /// Record a misuse penalty halving the subject's effective tier for
    /// `window` (set by the escalation handler's systematic-misuse policy).
    pub async fn apply_penalty(
        &self,
        subject_id: &str,
        factor: f64,
        window: Duration,
    ) -> Result<(), LimiterError> {
        self.store
            .set(&Self::penalty_key(subject_id), &factor.to_string(), Some(window))
            .await?;
        Ok(())
    }

    /// Consume one token if available.
    ///
    /// Concurrent admissions for the same subject serialize at the store's
    /// atomic swap: under a tied last token exactly one CAS wins and the
    /// loser re-reads the drained bucket.
    pub async fn admit(
        &self,
        subject_id: &str,
        tier: TrustTier,
    ) -> Result<AdmitDecision, LimiterError> {
        let risk_score = self.risk.get(subject_id).await?.value;
        let limits = self.effective_limits(subject_id, tier, risk_score).await?;
        let key = Self::bucket_key(subject_id);

        for _ in 0..CAS_ATTEMPTS {
            let now = Utc::now();
            let raw = self.store.get(&key).await?;
            let bucket = match &raw {
                Some(json) => serde_json::from_str::<TokenBucket>(json)
                    .map_err(|_| LimiterError::Corrupt(subject_id.to_string()))?,
                None => TokenBucket {
                    capacity: limits.capacity,
                    tokens: limits.capacity,
                    refill_rate: limits.refill_rate,
                    last_refill_ts: now,
                    tier,
                },
            };

            // Continuous refill up to the (re-derived) capacity. Tokens never
            // exceed capacity nor drop below zero.
            let elapsed_secs = (now - bucket.last_refill_ts)
                .num_milliseconds()
                .max(0) as f64
                / 1000.0;
            let refilled = (bucket.tokens + elapsed_secs * limits.refill_rate)
                .min(limits.capacity)
                .max(0.0);

            let (allowed, tokens_after) = if refilled >= 1.0 {
                (true, refilled - 1.0)
            } else {
                (false, refilled)
            };

            let next = TokenBucket {
                capacity: limits.capacity,
                tokens: tokens_after,
                refill_rate: limits.refill_rate,
                last_refill_ts: now,
                tier,
            };
            let serialized = serde_json::to_string(&next)
                .map_err(|_| LimiterError::Corrupt(subject_id.to_string()))?;
            let swapped = self
                .store
                .compare_and_swap(&key, raw.as_deref(), &serialized, Some(BUCKET_TTL))
                .await?;
            if !swapped {
                continue;
            }

            let retry_after_ms = if allowed {
                None
            } else {
                let needed = 1.0 - tokens_after;
                Some(((needed / limits.refill_rate) * 1000.0).ceil() as u64)
            };
            debug!(
                subject_id,
                allowed,
                remaining = tokens_after as u64,
                risk_score,
                "admission decision"
            );
            return Ok(AdmitDecision {
                allowed,
                remaining: tokens_after as u64,
                retry_after_ms,
                risk_score,
            });
        }
        Err(LimiterError::Contention)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use guardian_core::types::Severity;
    use guardian_store::MemoryStore;

    fn fixture() -> (Arc<MemoryStore>, Arc<RiskScoreManager>, Arc<ShedControl>, AdaptiveRateLimiter) {
        let store = Arc::new(MemoryStore::new());
        let risk = Arc::new(RiskScoreManager::new(store.clone() as Arc<dyn KvStore>));
        let shed = Arc::new(ShedControl::new());
        let limiter = AdaptiveRateLimiter::new(
            store.clone() as Arc<dyn KvStore>,
            Arc::clone(&risk),
            Arc::clone(&shed),
        );
        (store, risk, shed, limiter)
    }

    #[tokio::test]
    async fn test_admit_within_capacity() {
        let (_, _, _, limiter) = fixture();
        let decision = limiter.admit("u1", TrustTier::User).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 59);
        assert!(decision.retry_after_ms.is_none());
        assert_eq!(decision.risk_score, 0.0);
    }

    #[tokio::test]
    async fn test_bucket_never_over_admits() {
        let (_, _, _, limiter) = fixture();
        let capacity = TierLimits::baseline(TrustTier::Anon).capacity as usize;
        let mut admitted = 0;
        for _ in 0..capacity + 5 {
            if limiter.admit("u1", TrustTier::Anon).await.unwrap().allowed {
                admitted += 1;
            }
        }
        assert_eq!(admitted, capacity);
    }

    #[tokio::test]
    async fn test_denied_carries_retry_after() {
        let (_, _, _, limiter) = fixture();
        for _ in 0..10 {
            limiter.admit("u1", TrustTier::Anon).await.unwrap();
        }
        let denied = limiter.admit("u1", TrustTier::Anon).await.unwrap();
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_risk_band_halves_capacity() {
        let (_, risk, _, limiter) = fixture();
        // 0.35 sits in the 0.3 <= s < 0.7 band → halved.
        risk.record_violation("u1", Severity::High).await.unwrap();
        risk.record_violation("u1", Severity::Low).await.unwrap();
        let decision = limiter.admit("u1", TrustTier::User).await.unwrap();
        assert!(decision.allowed);
        // Half of 60, minus the consumed token.
        assert_eq!(decision.remaining, 29);
    }

    #[tokio::test]
    async fn test_high_risk_reduces_to_ten_percent() {
        let (_, risk, _, limiter) = fixture();
        risk.record_violation("u1", Severity::Critical).await.unwrap();
        risk.record_violation("u1", Severity::Critical).await.unwrap();
        let decision = limiter.admit("u1", TrustTier::User).await.unwrap();
        assert!(decision.risk_score >= 0.7);
        assert_eq!(decision.remaining, 5);
    }

    #[tokio::test]
    async fn test_shedding_halves_everyone() {
        let (_, _, shed, limiter) = fixture();
        shed.set_shedding(true);
        let decision = limiter.admit("u1", TrustTier::User).await.unwrap();
        assert_eq!(decision.remaining, 29);
        shed.set_shedding(false);
    }

    #[tokio::test]
    async fn test_penalty_factor_applies() {
        let (_, _, _, limiter) = fixture();
        limiter
            .apply_penalty("u1", 0.5, Duration::from_secs(3600))
            .await
            .unwrap();
        let decision = limiter.admit("u1", TrustTier::User).await.unwrap();
        assert_eq!(decision.remaining, 29);
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error_not_an_admit() {
        let (store, _, _, limiter) = fixture();
        store.set_failing(true);
        assert!(limiter.admit("u1", TrustTier::User).await.is_err());
    }

    #[test]
    fn test_risk_factor_bands() {
        assert_eq!(risk_factor(0.0), 1.0);
        assert_eq!(risk_factor(0.29), 1.0);
        assert_eq!(risk_factor(0.3), 0.5);
        assert_eq!(risk_factor(0.69), 0.5);
        assert_eq!(risk_factor(0.7), 0.1);
        assert_eq!(risk_factor(1.0), 0.1);
    }

    #[test]
    fn test_tier_baselines_ordered() {
        let anon = TierLimits::baseline(TrustTier::Anon);
        let user = TierLimits::baseline(TrustTier::User);
        let verified = TierLimits::baseline(TrustTier::Verified);
        let privileged = TierLimits::baseline(TrustTier::Privileged);
        assert!(anon.capacity < user.capacity);
        assert!(user.capacity < verified.capacity);
        assert!(verified.capacity < privileged.capacity);
    }
}
