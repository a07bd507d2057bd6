//! The escalation handler and human-review flow.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use guardian_audit::{AuditDecision, AuditRecord, AuditStage, AuditStatus, AuditStore};
use guardian_core::types::{RuleAction, RuleCategory, Severity};
use guardian_limiter::{AdaptiveRateLimiter, SuspensionStore};
use guardian_notify::{Dispatcher, EscalationContext, Notification, TemplateRenderer};
use guardian_queue::StreamBroker;
use guardian_rules::schema::{MatchType, Rule, RuleScope};
use guardian_rules::RuleRegistry;
use guardian_store::KvStore;

use crate::error::EscalationError;

/// Key under which a worker parks output awaiting review.
pub fn held_output_key(request_id: &str) -> String {
    format!("held:{}", request_id)
}

/// Systematic-misuse policy knobs.
#[derive(Debug, Clone)]
pub struct EscalationConfig {
    /// Trailing window for counting escalations.
    pub misuse_window: Duration,
    /// Escalations within the window before the tier is halved.
    pub tier_halving_threshold: usize,
    /// Escalations within the window before the subject is suspended.
    pub suspension_threshold: usize,
    /// How long an automatic suspension lasts.
    pub suspension_duration: Duration,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            misuse_window: Duration::from_secs(3600),
            tier_halving_threshold: 3,
            suspension_threshold: 5,
            suspension_duration: Duration::from_secs(24 * 3600),
        }
    }
}

/// A reviewer's verdict on an escalated item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    Approve,
    Block,
}

/// Records escalations, notifies reviewers, and enforces the
/// systematic-misuse policy.
pub struct EscalationHandler {
    audit: Arc<dyn AuditStore>,
    dispatcher: Arc<Dispatcher>,
    renderer: TemplateRenderer,
    limiter: Arc<AdaptiveRateLimiter>,
    suspensions: Arc<SuspensionStore>,
    registry: Arc<RuleRegistry>,
    kv: Arc<dyn KvStore>,
    broker: Arc<dyn StreamBroker>,
    config: EscalationConfig,
}

impl EscalationHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        audit: Arc<dyn AuditStore>,
        dispatcher: Arc<Dispatcher>,
        limiter: Arc<AdaptiveRateLimiter>,
        suspensions: Arc<SuspensionStore>,
        registry: Arc<RuleRegistry>,
        kv: Arc<dyn KvStore>,
        broker: Arc<dyn StreamBroker>,
        config: EscalationConfig,
    ) -> Self {
        Self {
            audit,
            dispatcher,
            renderer: TemplateRenderer::new(),
            limiter,
            suspensions,
            registry,
            kv,
            broker,
            config,
        }
    }

    /// Record an escalation, notify reviewers, and apply the misuse policy.
    ///
    /// Returns the audit id for inclusion in the user-facing refusal. The
    /// audit append is the only fatal step; notification failures degrade.
    pub async fn escalate(&self, record: AuditRecord) -> Result<String, EscalationError> {
        let audit_id = record.audit_id.clone();
        let subject_id = record.subject_id.clone();
        let severity = record.severity.unwrap_or(Severity::High);

        self.audit.append(record.clone()).await?;

        let context = EscalationContext {
            audit_id: audit_id.clone(),
            subject_id: subject_id.clone(),
            trace_id: record.trace_id.clone(),
            stage: record.stage.as_str().to_string(),
            severity,
            reason_code: record.reason_code,
            rule_count: record.rule_ids.len(),
        };
        match self.renderer.render_escalation(&context) {
            Ok((subject, body)) => {
                let notification = Notification {
                    audit_id: audit_id.clone(),
                    severity,
                    subject,
                    body,
                    metadata: HashMap::from([
                        ("subject_id".to_string(), subject_id.clone()),
                        ("stage".to_string(), record.stage.as_str().to_string()),
                    ]),
                };
                self.dispatcher.dispatch(&notification).await;
            }
            Err(e) => warn!(audit_id = %audit_id, error = %e, "escalation template rendering failed"),
        }

        self.apply_misuse_policy(&subject_id).await?;
        Ok(audit_id)
    }

    /// Count recent escalations and tighten or suspend accordingly.
    async fn apply_misuse_policy(&self, subject_id: &str) -> Result<(), EscalationError> {
        let escalations = self
            .audit
            .recent_for_subject(subject_id, self.config.misuse_window, Some(AuditStage::Escalate))
            .await?
            .len();

        if escalations >= self.config.suspension_threshold {
            self.suspensions
                .suspend(
                    subject_id,
                    "systematic misuse: escalation threshold exceeded",
                    Some(self.config.suspension_duration),
                )
                .await?;
            info!(subject_id, escalations, "subject suspended for systematic misuse");
        } else if escalations >= self.config.tier_halving_threshold {
            self.limiter
                .apply_penalty(subject_id, 0.5, self.config.misuse_window)
                .await?;
            info!(subject_id, escalations, "subject rate tier halved for repeated escalations");
        }
        Ok(())
    }

    /// Append a reviewer verdict to an escalation's lineage.
    ///
    /// `approve` releases any held output to the response stream. `block`
    /// feeds `block_pattern` (when provided) into the dynamic blocklist.
    /// Returns the new audit id of the review record.
    pub async fn review(
        &self,
        audit_id: &str,
        decision: ReviewDecision,
        reviewer_id: &str,
        notes: Option<String>,
        block_pattern: Option<String>,
    ) -> Result<String, EscalationError> {
        let chain = self.audit.read_by_lineage(audit_id).await?;
        let root = chain
            .first()
            .ok_or_else(|| EscalationError::UnknownAudit(audit_id.to_string()))?;

        let (audit_decision, status) = match decision {
            ReviewDecision::Approve => (AuditDecision::Approve, AuditStatus::Approved),
            ReviewDecision::Block => (AuditDecision::Block, AuditStatus::Blocked),
        };
        let mut review = root.follow_up(AuditStage::Review, audit_decision, status);
        review.reviewer_id = Some(reviewer_id.to_string());
        review.notes = notes;
        let review_id = review.audit_id.clone();
        self.audit.append(review).await?;

        match decision {
            ReviewDecision::Approve => {
                self.release_held_output(&root.request_id).await?;
            }
            ReviewDecision::Block => {
                if let Some(pattern) = block_pattern {
                    self.add_to_blocklist(audit_id, &pattern)?;
                }
            }
        }

        info!(audit_id, review_id = %review_id, reviewer_id, decision = ?decision, "review recorded");
        Ok(review_id)
    }

    /// Publish output parked by the worker pending review, if any.
    async fn release_held_output(&self, request_id: &str) -> Result<(), EscalationError> {
        let key = held_output_key(request_id);
        if let Some(output) = self.kv.get(&key).await? {
            self.broker.publish_response(request_id, &output).await?;
            self.kv.delete(&key).await?;
            info!(request_id, "held output released after approval");
        }
        Ok(())
    }

    /// Inject a blocklist rule for a reviewer-confirmed bad pattern.
    fn add_to_blocklist(&self, audit_id: &str, pattern: &str) -> Result<(), EscalationError> {
        let rule = Rule {
            id: format!("blocklist_{}", audit_id),
            category: RuleCategory::Custom,
            severity: Severity::High,
            action: RuleAction::Block,
            match_type: MatchType::Keyword,
            patterns: vec![pattern.to_string()],
            expression: None,
            confidence: 1.0,
            priority: 0,
            enabled: true,
            version: 1,
            scope: RuleScope::Both,
        };
        let version = self.registry.inject(rule)?;
        info!(audit_id, registry_version = version, "reviewer pattern added to dynamic blocklist");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use guardian_audit::MemoryAuditStore;
    use guardian_core::types::ReasonCode;
    use guardian_queue::MemoryBroker;
    use guardian_risk::RiskScoreManager;
    use guardian_store::MemoryStore;

    struct Fixture {
        audit: Arc<MemoryAuditStore>,
        kv: Arc<MemoryStore>,
        broker: Arc<MemoryBroker>,
        registry: Arc<RuleRegistry>,
        suspensions: Arc<SuspensionStore>,
        handler: EscalationHandler,
    }

    fn fixture() -> Fixture {
        let audit = Arc::new(MemoryAuditStore::new());
        let kv = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let registry = Arc::new(RuleRegistry::new());
        registry.load_from(Vec::new()).unwrap();
        let risk = Arc::new(RiskScoreManager::new(kv.clone() as Arc<dyn KvStore>));
        let shed = Arc::new(guardian_limiter::ShedControl::new());
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            kv.clone() as Arc<dyn KvStore>,
            risk,
            shed,
        ));
        let suspensions = Arc::new(SuspensionStore::new(kv.clone() as Arc<dyn KvStore>));
        let handler = EscalationHandler::new(
            audit.clone() as Arc<dyn AuditStore>,
            Arc::new(Dispatcher::empty()),
            limiter,
            Arc::clone(&suspensions),
            Arc::clone(&registry),
            kv.clone() as Arc<dyn KvStore>,
            broker.clone() as Arc<dyn StreamBroker>,
            EscalationConfig::default(),
        );
        Fixture {
            audit,
            kv,
            broker,
            registry,
            suspensions,
            handler,
        }
    }

    fn escalation_record(subject: &str) -> AuditRecord {
        AuditRecord::new(
            "r1",
            "t1",
            subject,
            AuditStage::Escalate,
            AuditDecision::Escalate,
            AuditStatus::Open,
        )
        .with_severity(Severity::High)
        .with_reason(ReasonCode::JailbreakAttempt)
    }

    #[tokio::test]
    async fn test_escalate_persists_and_returns_audit_id() {
        let f = fixture();
        let audit_id = f.handler.escalate(escalation_record("u1")).await.unwrap();
        let chain = f.audit.read_by_lineage(&audit_id).await.unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].stage, AuditStage::Escalate);
        assert_eq!(chain[0].status, AuditStatus::Open);
    }

    #[tokio::test]
    async fn test_suspension_after_threshold() {
        let f = fixture();
        for _ in 0..5 {
            f.handler.escalate(escalation_record("u2")).await.unwrap();
        }
        let suspension = f.suspensions.active("u2").await.unwrap().unwrap();
        assert!(suspension.expires_ts.is_some());
    }

    #[tokio::test]
    async fn test_below_threshold_no_suspension() {
        let f = fixture();
        for _ in 0..2 {
            f.handler.escalate(escalation_record("u3")).await.unwrap();
        }
        assert!(f.suspensions.active("u3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_review_approve_releases_held_output() {
        let f = fixture();
        let audit_id = f.handler.escalate(escalation_record("u1")).await.unwrap();
        f.kv.set(&held_output_key("r1"), "the held answer", None)
            .await
            .unwrap();

        let review_id = f
            .handler
            .review(&audit_id, ReviewDecision::Approve, "rev-1", None, None)
            .await
            .unwrap();
        assert_ne!(review_id, audit_id);

        assert_eq!(
            f.broker.fetch_response("r1").await.unwrap(),
            Some("the held answer".to_string())
        );
        // Held entry is consumed.
        assert_eq!(f.kv.get(&held_output_key("r1")).await.unwrap(), None);

        let chain = f.audit.read_by_lineage(&audit_id).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].stage, AuditStage::Review);
        assert_eq!(chain[1].reviewer_id.as_deref(), Some("rev-1"));
    }

    #[tokio::test]
    async fn test_review_block_feeds_blocklist() {
        let f = fixture();
        let audit_id = f.handler.escalate(escalation_record("u1")).await.unwrap();
        f.handler
            .review(
                &audit_id,
                ReviewDecision::Block,
                "rev-1",
                Some("confirmed jailbreak phrasing".to_string()),
                Some("grandma exploit".to_string()),
            )
            .await
            .unwrap();

        let snapshot = f.registry.current();
        let rule = snapshot.rule(&format!("blocklist_{}", audit_id)).unwrap();
        assert_eq!(rule.action, RuleAction::Block);
        assert_eq!(rule.patterns, vec!["grandma exploit".to_string()]);
    }

    #[tokio::test]
    async fn test_review_unknown_audit_errors() {
        let f = fixture();
        let result = f
            .handler
            .review("missing", ReviewDecision::Approve, "rev-1", None, None)
            .await;
        assert!(matches!(result, Err(EscalationError::UnknownAudit(_))));
    }

    #[tokio::test]
    async fn test_tier_penalty_before_suspension() {
        let f = fixture();
        for _ in 0..3 {
            f.handler.escalate(escalation_record("u4")).await.unwrap();
        }
        // Penalty marker present, no suspension yet.
        assert!(f.kv.get("penalty:u4").await.unwrap().is_some());
        assert!(f.suspensions.active("u4").await.unwrap().is_none());
    }
}
