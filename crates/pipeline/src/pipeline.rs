//! Admission flow and fail-closed gate.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use guardian_audit::{AuditDecision, AuditRecord, AuditStage, AuditStatus, AuditStore};
use guardian_canary::{CanaryError, CanarySubsystem};
use guardian_core::envelope::{RefusalEnvelope, RequestEnvelope};
use guardian_core::types::{ReasonCode, Severity};
use guardian_engine::{EngineError, EvaluationResult, Guardian};
use guardian_escalation::{EscalationError, EscalationHandler};
use guardian_limiter::{AdaptiveRateLimiter, LimiterError, ShedControl, SuspensionStore};
use guardian_queue::{PreCheckSummary, QueueError, QueuedRequest, StreamBroker};
use guardian_risk::{RiskError, RiskScoreManager};
use guardian_rules::schema::RuleScope;
use guardian_rules::RuleRegistry;
use guardian_store::{KvStore, StoreError};

/// Per-stage timeouts on the hot path; a stage that cannot answer in time
/// is treated as degraded infrastructure.
const RATE_LIMIT_TIMEOUT: Duration = Duration::from_millis(50);
const QUEUE_PUBLISH_TIMEOUT: Duration = Duration::from_millis(100);
const AUDIT_TIMEOUT: Duration = Duration::from_millis(200);

/// Internal admission failures, all surfaced as `SAFETY_UNAVAILABLE`.
#[derive(Error, Debug)]
enum AdmissionError {
    #[error("safety infrastructure degraded: {0}")]
    Unavailable(String),
}

/// Bound an infrastructure call by its stage timeout.
async fn bounded<T, E>(
    stage: &str,
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, E>>,
) -> Result<T, AdmissionError>
where
    AdmissionError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_elapsed) => Err(AdmissionError::Unavailable(format!(
            "{} stage timed out after {}ms",
            stage,
            limit.as_millis()
        ))),
    }
}

impl From<StoreError> for AdmissionError {
    fn from(e: StoreError) -> Self {
        AdmissionError::Unavailable(e.to_string())
    }
}

impl From<QueueError> for AdmissionError {
    fn from(e: QueueError) -> Self {
        AdmissionError::Unavailable(e.to_string())
    }
}

impl From<guardian_audit::AuditError> for AdmissionError {
    fn from(e: guardian_audit::AuditError) -> Self {
        AdmissionError::Unavailable(e.to_string())
    }
}

impl From<EngineError> for AdmissionError {
    fn from(e: EngineError) -> Self {
        AdmissionError::Unavailable(e.to_string())
    }
}

impl From<LimiterError> for AdmissionError {
    fn from(e: LimiterError) -> Self {
        AdmissionError::Unavailable(e.to_string())
    }
}

impl From<RiskError> for AdmissionError {
    fn from(e: RiskError) -> Self {
        AdmissionError::Unavailable(e.to_string())
    }
}

impl From<CanaryError> for AdmissionError {
    fn from(e: CanaryError) -> Self {
        AdmissionError::Unavailable(e.to_string())
    }
}

impl From<EscalationError> for AdmissionError {
    fn from(e: EscalationError) -> Self {
        AdmissionError::Unavailable(e.to_string())
    }
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Global end-to-end budget for the synchronous path.
    pub request_budget: Duration,
    /// Queue depth that triggers global load shedding.
    pub backpressure_threshold: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_budget: Duration::from_secs(30),
            backpressure_threshold: 1_000,
        }
    }
}

/// Outcome of a submission.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Admitted: a queue message with this request id now exists.
    Enqueued {
        request_id: String,
        stream_id: String,
    },
    Refused(RefusalEnvelope),
}

impl SubmitOutcome {
    pub fn is_refused(&self) -> bool {
        matches!(self, SubmitOutcome::Refused(_))
    }

    pub fn refusal(&self) -> Option<&RefusalEnvelope> {
        match self {
            SubmitOutcome::Refused(envelope) => Some(envelope),
            SubmitOutcome::Enqueued { .. } => None,
        }
    }
}

/// The synchronous safety gate in front of the inference queue.
pub struct SafetyPipeline {
    registry: Arc<RuleRegistry>,
    guardian: Arc<Guardian>,
    limiter: Arc<AdaptiveRateLimiter>,
    suspensions: Arc<SuspensionStore>,
    canary: Arc<CanarySubsystem>,
    risk: Arc<RiskScoreManager>,
    escalation: Arc<EscalationHandler>,
    broker: Arc<dyn StreamBroker>,
    audit: Arc<dyn AuditStore>,
    kv: Arc<dyn KvStore>,
    config: PipelineConfig,
}

impl SafetyPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<RuleRegistry>,
        guardian: Arc<Guardian>,
        limiter: Arc<AdaptiveRateLimiter>,
        suspensions: Arc<SuspensionStore>,
        canary: Arc<CanarySubsystem>,
        risk: Arc<RiskScoreManager>,
        escalation: Arc<EscalationHandler>,
        broker: Arc<dyn StreamBroker>,
        audit: Arc<dyn AuditStore>,
        kv: Arc<dyn KvStore>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            guardian,
            limiter,
            suspensions,
            canary,
            risk,
            escalation,
            broker,
            audit,
            kv,
            config,
        }
    }

    /// Run the hot path for one request.
    ///
    /// Never returns an error: every failure mode maps to a refusal
    /// envelope (`SAFETY_UNAVAILABLE` for infrastructure, `TIMEOUT` for
    /// budget exhaustion). Admitted requests are on the queue when this
    /// returns.
    pub async fn submit(&self, envelope: RequestEnvelope) -> SubmitOutcome {
        let subject_id = envelope.subject_id.clone();
        let trace_id = envelope.trace_id.clone();

        match tokio::time::timeout(self.config.request_budget, self.admit(envelope)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                let ticket = Uuid::new_v4().to_string();
                error!(
                    subject_id = %subject_id,
                    trace_id = %trace_id,
                    support_ticket_id = %ticket,
                    error = %e,
                    "admission failed closed"
                );
                SubmitOutcome::Refused(RefusalEnvelope::new(ReasonCode::SafetyUnavailable, ticket))
            }
            Err(_elapsed) => {
                let record = AuditRecord::new(
                    Uuid::new_v4().to_string(),
                    &trace_id,
                    &subject_id,
                    AuditStage::Timeout,
                    AuditDecision::Timeout,
                    AuditStatus::Resolved,
                )
                .with_reason(ReasonCode::Timeout);
                let ticket = record.audit_id.clone();
                if let Err(e) = self.audit.append(record).await {
                    warn!(error = %e, "timeout audit write failed");
                }
                SubmitOutcome::Refused(RefusalEnvelope::new(ReasonCode::Timeout, ticket))
            }
        }
    }

    async fn admit(&self, envelope: RequestEnvelope) -> Result<SubmitOutcome, AdmissionError> {
        // Fail-closed gate: every piece of safety infrastructure must be
        // reachable before any decision is made.
        self.health_gate().await?;

        let subject_id = envelope.subject_id.as_str();

        // Suspension check runs before rate limiting.
        if let Some(suspension) = self.suspensions.active(subject_id).await? {
            let record = self
                .pre_audit(&envelope, AuditDecision::Block, AuditStatus::Blocked)
                .with_reason(ReasonCode::SubjectSuspended)
                .with_notes(suspension.reason.clone());
            let ticket = record.audit_id.clone();
            bounded("audit", AUDIT_TIMEOUT, self.audit.append(record)).await?;
            info!(subject_id, "refused: subject suspended");
            return Ok(refused(ReasonCode::SubjectSuspended, ticket));
        }

        // Adaptive admission.
        let decision = bounded(
            "rate-limit",
            RATE_LIMIT_TIMEOUT,
            self.limiter.admit(subject_id, envelope.trust_tier),
        )
        .await?;
        if !decision.allowed {
            let record = self
                .pre_audit(&envelope, AuditDecision::Block, AuditStatus::Resolved)
                .with_reason(ReasonCode::RateLimited);
            let ticket = record.audit_id.clone();
            bounded("audit", AUDIT_TIMEOUT, self.audit.append(record)).await?;
            return Ok(refused(ReasonCode::RateLimited, ticket));
        }

        // Canary replay detection: a live marker in the input is a
        // terminal block and saturates the issuer's risk score.
        if let Some(hit) = self.canary.detect(&envelope.input_text).await? {
            self.risk.saturate(&hit.issued_to).await?;
            let record = self
                .pre_audit(&envelope, AuditDecision::Block, AuditStatus::Blocked)
                .with_reason(ReasonCode::CanaryReplay)
                .with_rules(vec!["canary_replay".to_string()])
                .with_severity(Severity::Critical)
                .with_notes(format!("canary {}", hit.canary_id));
            let ticket = record.audit_id.clone();
            bounded("audit", AUDIT_TIMEOUT, self.audit.append(record)).await?;
            warn!(subject_id, issuer = %hit.issued_to, "refused: canary replay detected");
            return Ok(refused(ReasonCode::CanaryReplay, ticket));
        }

        // Guardian pre-check.
        let eval = self
            .guardian
            .evaluate(&envelope.input_text, RuleScope::Input, Some(subject_id))?;

        if eval.is_block() {
            let severity = eval.highest_severity.unwrap_or(Severity::High);
            let reason = eval.reason_code().unwrap_or(ReasonCode::PolicyViolation);
            let record = self
                .pre_audit(&envelope, AuditDecision::Block, AuditStatus::Blocked)
                .with_reason(reason)
                .with_rules(rule_ids(&eval))
                .with_severity(severity);
            let ticket = record.audit_id.clone();
            bounded("audit", AUDIT_TIMEOUT, self.audit.append(record)).await?;
            self.risk.record_violation(subject_id, severity).await?;
            info!(subject_id, reason = %reason, "refused: pre-check block");
            return Ok(refused(reason, ticket));
        }

        if eval.is_escalate() {
            // Ambiguity defers to humans: the input never reaches the
            // model, and the refusal carries the escalation's audit id.
            let severity = eval.highest_severity.unwrap_or(Severity::High);
            let reason = eval.reason_code().unwrap_or(ReasonCode::PolicyViolation);
            let record = AuditRecord::new(
                Uuid::new_v4().to_string(),
                &envelope.trace_id,
                &envelope.subject_id,
                AuditStage::Escalate,
                AuditDecision::Escalate,
                AuditStatus::Open,
            )
            .with_reason(reason)
            .with_rules(rule_ids(&eval))
            .with_severity(severity);
            let ticket = self.escalation.escalate(record).await?;
            info!(subject_id, reason = %reason, "refused: pre-check escalation");
            return Ok(refused(reason, ticket));
        }

        // Admitted: warn/log/canary actions proceed to the queue.
        let request = QueuedRequest::new(
            envelope.trace_id.clone(),
            envelope.subject_id.clone(),
            envelope.trust_tier,
            envelope.input_text.clone(),
            PreCheckSummary {
                registry_version: eval.registry_version,
                highest_severity: eval.highest_severity,
                terminal_action: eval.terminal_action,
            },
        );
        let request_id = request.request_id.clone();
        let stream_id = bounded(
            "queue-publish",
            QUEUE_PUBLISH_TIMEOUT,
            self.broker.publish(&request),
        )
        .await?;
        info!(subject_id, request_id = %request_id, "request admitted");
        Ok(SubmitOutcome::Enqueued {
            request_id,
            stream_id,
        })
    }

    /// Reject all traffic unless registry, store, queue, and ledger are up.
    async fn health_gate(&self) -> Result<(), AdmissionError> {
        if !self.registry.has_activated() {
            return Err(AdmissionError::Unavailable(
                "no active registry snapshot".to_string(),
            ));
        }
        self.kv.ping().await?;
        self.audit.ping().await?;
        let queue_health = self.broker.health_check().await?;
        if !queue_health.connected {
            return Err(AdmissionError::Unavailable("queue unreachable".to_string()));
        }
        Ok(())
    }

    fn pre_audit(
        &self,
        envelope: &RequestEnvelope,
        decision: AuditDecision,
        status: AuditStatus,
    ) -> AuditRecord {
        AuditRecord::new(
            Uuid::new_v4().to_string(),
            &envelope.trace_id,
            &envelope.subject_id,
            AuditStage::Pre,
            decision,
            status,
        )
    }
}

fn refused(reason: ReasonCode, ticket: String) -> SubmitOutcome {
    SubmitOutcome::Refused(RefusalEnvelope::new(reason, ticket))
}

fn rule_ids(eval: &EvaluationResult) -> Vec<String> {
    eval.matches.iter().map(|m| m.rule_id.clone()).collect()
}

/// Poll queue depth and flip the global shed factor when it crosses the
/// threshold; recovery clears it at half the threshold.
pub fn spawn_backpressure_monitor(
    broker: Arc<dyn StreamBroker>,
    shed: Arc<ShedControl>,
    threshold: u64,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match broker.depth().await {
                Ok(depth) => {
                    if depth > threshold && !shed.is_shedding() {
                        warn!(depth, threshold, "queue depth over threshold, shedding load");
                        shed.set_shedding(true);
                    } else if depth <= threshold / 2 && shed.is_shedding() {
                        info!(depth, "queue depth recovered, shedding cleared");
                        shed.set_shedding(false);
                    }
                }
                Err(e) => warn!(error = %e, "backpressure depth probe failed"),
            }
        }
    })
}
