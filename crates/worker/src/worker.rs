//! The worker message loop.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use guardian_audit::{AuditDecision, AuditRecord, AuditStage, AuditStatus, AuditStore};
use guardian_canary::{CanaryError, CanarySubsystem};
use guardian_core::types::{ReasonCode, RuleAction, Severity};
use guardian_engine::{EngineError, Guardian};
use guardian_escalation::handler::held_output_key;
use guardian_escalation::{EscalationError, EscalationHandler};
use guardian_limiter::SuspensionStore;
use guardian_queue::{QueueError, StreamBroker, StreamMessage};
use guardian_risk::{RiskError, RiskScoreManager};
use guardian_rules::schema::RuleScope;
use guardian_store::{KvStore, StoreError};

use crate::model::{ModelClient, ModelError, SandboxPolicy};
use crate::postcheck::{MlPostCheck, MlThresholds};
use crate::runner::ShutdownSignal;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Audit(#[from] guardian_audit::AuditError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Escalation(#[from] EscalationError),

    #[error(transparent)]
    Risk(#[from] RiskError),

    #[error(transparent)]
    Canary(#[from] CanaryError),
}

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique consumer name within the group — never share one.
    pub consumer_name: String,
    /// Blocking claim timeout per poll.
    pub claim_block: Duration,
    /// Model retry ceiling before escalating MODEL_UNAVAILABLE.
    pub model_retries: u32,
    /// Base delay for exponential backoff between model retries.
    pub backoff_base: Duration,
    /// TTL on `processed:{request_id}` idempotency markers.
    pub idempotency_ttl: Duration,
    /// TTL on held output awaiting review.
    pub held_ttl: Duration,
    pub sandbox: SandboxPolicy,
    pub ml_thresholds: MlThresholds,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumer_name: "worker-0".to_string(),
            claim_block: Duration::from_secs(5),
            model_retries: 3,
            backoff_base: Duration::from_millis(200),
            idempotency_ttl: Duration::from_secs(24 * 3600),
            held_ttl: Duration::from_secs(7 * 24 * 3600),
            sandbox: SandboxPolicy::default(),
            ml_thresholds: MlThresholds::default(),
        }
    }
}

/// Consumes admitted requests, executes the model, and routes the outcome.
pub struct InferenceWorker {
    broker: Arc<dyn StreamBroker>,
    guardian: Arc<Guardian>,
    canary: Arc<CanarySubsystem>,
    risk: Arc<RiskScoreManager>,
    suspensions: Arc<SuspensionStore>,
    escalation: Arc<EscalationHandler>,
    audit: Arc<dyn AuditStore>,
    model: Arc<dyn ModelClient>,
    ml_check: Option<Arc<dyn MlPostCheck>>,
    kv: Arc<dyn KvStore>,
    config: WorkerConfig,
}

impl InferenceWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        guardian: Arc<Guardian>,
        canary: Arc<CanarySubsystem>,
        risk: Arc<RiskScoreManager>,
        suspensions: Arc<SuspensionStore>,
        escalation: Arc<EscalationHandler>,
        audit: Arc<dyn AuditStore>,
        model: Arc<dyn ModelClient>,
        ml_check: Option<Arc<dyn MlPostCheck>>,
        kv: Arc<dyn KvStore>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            broker,
            guardian,
            canary,
            risk,
            suspensions,
            escalation,
            audit,
            model,
            ml_check,
            kv,
            config,
        }
    }

    /// Claim-and-process until shutdown. In-flight work is drained before
    /// returning; messages whose processing errors are left unacknowledged
    /// for redelivery.
    pub async fn run(&self, shutdown: Arc<ShutdownSignal>) {
        info!(consumer = %self.config.consumer_name, "inference worker started");
        loop {
            if shutdown.is_triggered() {
                break;
            }
            let claimed = tokio::select! {
                _ = shutdown.notified() => break,
                claimed = self.broker.claim(&self.config.consumer_name, self.config.claim_block) => claimed,
            };
            match claimed {
                Ok(Some(message)) => {
                    let request_id = message.request.request_id.clone();
                    if let Err(e) = self.process(message).await {
                        warn!(
                            request_id = %request_id,
                            error = %e,
                            "processing failed; message left pending for redelivery"
                        );
                        tokio::time::sleep(Duration::from_millis(500)).await;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "queue claim failed; backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!(consumer = %self.config.consumer_name, "inference worker drained and paused");
    }

    /// Process one claimed message end-to-end.
    pub async fn process(&self, message: StreamMessage) -> Result<String, WorkerError> {
        let request = &message.request;
        let request_id = request.request_id.clone();
        let processed_key = format!("processed:{}", request_id);

        // Duplicate delivery short-circuits to the recorded outcome.
        if let Some(prior) = self.kv.get(&processed_key).await? {
            debug!(request_id = %request_id, outcome = %prior, "duplicate delivery short-circuited");
            self.broker.ack(&message.stream_id).await?;
            return Ok(prior);
        }

        // Re-verify after queue wait: a suspension may have landed since
        // admission.
        if self
            .suspensions
            .active(&request.subject_id)
            .await?
            .is_some()
        {
            let record = AuditRecord::new(
                &request.request_id,
                &request.trace_id,
                &request.subject_id,
                AuditStage::Post,
                AuditDecision::Block,
                AuditStatus::Blocked,
            )
            .with_reason(ReasonCode::SubjectSuspended);
            self.audit.append(record).await?;
            return self.finish(&message, &processed_key, "suspended").await;
        }

        // Model call with exponential backoff.
        let output = match self.call_model(&request.input_text).await {
            Ok(output) => output,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "model retries exhausted");
                let record = AuditRecord::new(
                    &request.request_id,
                    &request.trace_id,
                    &request.subject_id,
                    AuditStage::Escalate,
                    AuditDecision::Escalate,
                    AuditStatus::Open,
                )
                .with_reason(ReasonCode::ModelUnavailable)
                .with_severity(Severity::High);
                self.escalation.escalate(record).await?;
                return self.finish(&message, &processed_key, "model_unavailable").await;
            }
        };

        // Post-check: Guardian on the output, plus the optional ML scorer.
        let eval = self
            .guardian
            .evaluate(&output, RuleScope::Output, Some(&request.subject_id))?;
        let ml_severity = match &self.ml_check {
            Some(ml) => match ml.score(&output).await {
                Ok(severity) => severity,
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "ml post-check degraded");
                    None
                }
            },
            None => None,
        };
        let ml_blocks = ml_severity
            .map(|s| s >= self.config.ml_thresholds.block_at)
            .unwrap_or(false);
        let ml_escalates = ml_severity
            .map(|s| s >= self.config.ml_thresholds.escalate_at)
            .unwrap_or(false);

        let rule_ids: Vec<String> = eval.matches.iter().map(|m| m.rule_id.clone()).collect();
        let severity = eval
            .highest_severity
            .or(ml_severity)
            .unwrap_or(Severity::High);

        if eval.is_block() || ml_blocks {
            let record = AuditRecord::new(
                &request.request_id,
                &request.trace_id,
                &request.subject_id,
                AuditStage::Post,
                AuditDecision::Block,
                AuditStatus::Blocked,
            )
            .with_reason(eval.reason_code().unwrap_or(ReasonCode::PolicyViolation))
            .with_rules(rule_ids)
            .with_severity(severity);
            self.audit.append(record).await?;
            self.risk
                .record_violation(&request.subject_id, severity)
                .await?;
            return self.finish(&message, &processed_key, "blocked").await;
        }

        if eval.is_escalate() || ml_escalates {
            // Park the output for the reviewer; approval releases it.
            self.kv
                .set(
                    &held_output_key(&request.request_id),
                    &output,
                    Some(self.config.held_ttl),
                )
                .await?;
            let post_record = AuditRecord::new(
                &request.request_id,
                &request.trace_id,
                &request.subject_id,
                AuditStage::Post,
                AuditDecision::Escalate,
                AuditStatus::Escalated,
            )
            .with_reason(eval.reason_code().unwrap_or(ReasonCode::PolicyViolation))
            .with_rules(rule_ids)
            .with_severity(severity);
            let escalate_record =
                post_record.follow_up(AuditStage::Escalate, AuditDecision::Escalate, AuditStatus::Open);
            self.audit.append(post_record).await?;
            self.escalation.escalate(escalate_record).await?;
            return self.finish(&message, &processed_key, "escalated").await;
        }

        // Pass: watermark when warranted (or when a canary-action rule
        // matched), then publish.
        let force_watermark = eval.terminal_action == Some(RuleAction::Canary);
        let final_output = if force_watermark
            || self.canary.should_watermark(&request.subject_id).await?
        {
            let (marked, canary_id) = self.canary.issue(&request.subject_id, &output).await?;
            debug!(request_id = %request_id, canary_id = %canary_id, "response watermarked");
            marked
        } else {
            output
        };

        // Record the idempotency marker before publishing so a duplicate
        // delivery can never publish twice.
        self.kv
            .set(&processed_key, "pass", Some(self.config.idempotency_ttl))
            .await?;
        self.broker
            .publish_response(&request.request_id, &final_output)
            .await?;
        let record = AuditRecord::new(
            &request.request_id,
            &request.trace_id,
            &request.subject_id,
            AuditStage::Post,
            AuditDecision::Pass,
            AuditStatus::Resolved,
        );
        self.audit.append(record).await?;
        self.broker.ack(&message.stream_id).await?;
        info!(request_id = %request_id, "response published");
        Ok("pass".to_string())
    }

    /// Record the outcome marker and acknowledge the message.
    async fn finish(
        &self,
        message: &StreamMessage,
        processed_key: &str,
        outcome: &str,
    ) -> Result<String, WorkerError> {
        self.kv
            .set(processed_key, outcome, Some(self.config.idempotency_ttl))
            .await?;
        self.broker.ack(&message.stream_id).await?;
        Ok(outcome.to_string())
    }

    async fn call_model(&self, input: &str) -> Result<String, ModelError> {
        let mut attempt = 0u32;
        loop {
            match self.model.complete(input, &self.config.sandbox).await {
                Ok(output) => return Ok(output),
                Err(e) if attempt < self.config.model_retries => {
                    let delay = self.config.backoff_base * 2u32.saturating_pow(attempt);
                    warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "model call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
