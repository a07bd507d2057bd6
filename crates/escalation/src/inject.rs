//! Privileged dynamic rule-injection channel.
//!
//! Reviewers and automated forensic pipelines submit single rules here.
//! The payload is validated and its patterns compiled in isolation before
//! the registry publishes a new snapshot; an audit record captures the
//! rule id, author, and source. When a rules directory is configured the
//! rule is also written back as YAML so a restart reconverges.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use guardian_audit::{AuditDecision, AuditRecord, AuditStage, AuditStatus, AuditStore};
use guardian_core::types::TrustTier;
use guardian_rules::schema::Rule;
use guardian_rules::{RuleLoader, RuleRegistry};

use crate::error::EscalationError;

/// Accepts privileged rule payloads and merges them into the live registry.
pub struct RuleInjector {
    registry: Arc<RuleRegistry>,
    audit: Arc<dyn AuditStore>,
    /// When set, injected rules are persisted here as YAML.
    persist_dir: Option<PathBuf>,
}

impl RuleInjector {
    pub fn new(
        registry: Arc<RuleRegistry>,
        audit: Arc<dyn AuditStore>,
        persist_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            registry,
            audit,
            persist_dir,
        }
    }

    /// Inject a rule authored by `author` via `source` (e.g. "review",
    /// "forensic-pipeline"). Requires the privileged tier.
    ///
    /// Returns the new registry version; it propagates to every serving
    /// instance within the configured reload interval.
    pub async fn inject(
        &self,
        rule: Rule,
        author: &str,
        source: &str,
        tier: TrustTier,
    ) -> Result<u64, EscalationError> {
        if tier != TrustTier::Privileged {
            warn!(author, %tier, "rule injection rejected: insufficient tier");
            return Err(EscalationError::Unauthorized);
        }

        let rule_id = rule.id.clone();
        let version = self.registry.inject(rule.clone())?;

        let record = AuditRecord::new(
            format!("inject-{}", rule_id),
            format!("inject-{}", version),
            author,
            AuditStage::Inject,
            AuditDecision::Inject,
            AuditStatus::Resolved,
        )
        .with_rules(vec![rule_id.clone()])
        .with_notes(format!("source={}", source));
        self.audit.append(record).await?;

        if let Some(dir) = &self.persist_dir {
            if let Err(e) = RuleLoader::write_rule_file(dir, &rule) {
                warn!(rule_id = %rule_id, error = %e, "failed to persist injected rule to disk");
            }
        }

        info!(rule_id = %rule_id, author, source, registry_version = version, "rule injected");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use guardian_audit::MemoryAuditStore;
    use guardian_core::types::{RuleAction, RuleCategory, Severity};
    use guardian_rules::schema::{MatchType, RuleScope};

    fn keyword_rule(id: &str, pattern: &str) -> Rule {
        Rule {
            id: id.to_string(),
            category: RuleCategory::Custom,
            severity: Severity::Critical,
            action: RuleAction::Block,
            match_type: MatchType::Keyword,
            patterns: vec![pattern.to_string()],
            expression: None,
            confidence: 1.0,
            priority: 0,
            enabled: true,
            version: 1,
            scope: RuleScope::Both,
        }
    }

    fn fixture(persist_dir: Option<PathBuf>) -> (Arc<RuleRegistry>, Arc<MemoryAuditStore>, RuleInjector) {
        let registry = Arc::new(RuleRegistry::new());
        registry.load_from(Vec::new()).unwrap();
        let audit = Arc::new(MemoryAuditStore::new());
        let injector = RuleInjector::new(
            Arc::clone(&registry),
            audit.clone() as Arc<dyn AuditStore>,
            persist_dir,
        );
        (registry, audit, injector)
    }

    #[tokio::test]
    async fn test_privileged_injection_publishes() {
        let (registry, audit, injector) = fixture(None);
        let version = injector
            .inject(keyword_rule("r_new", "zero day recipe"), "rev-1", "review", TrustTier::Privileged)
            .await
            .unwrap();

        assert_eq!(registry.current().registry_version, version);
        assert!(registry.current().rule("r_new").is_some());

        let records = audit.all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stage, AuditStage::Inject);
        assert_eq!(records[0].rule_ids, vec!["r_new".to_string()]);
        assert!(records[0].notes.as_deref().unwrap().contains("review"));
    }

    #[tokio::test]
    async fn test_lower_tiers_rejected() {
        let (registry, _, injector) = fixture(None);
        for tier in [TrustTier::Anon, TrustTier::User, TrustTier::Verified] {
            let result = injector
                .inject(keyword_rule("r_new", "x"), "rev-1", "review", tier)
                .await;
            assert!(matches!(result, Err(EscalationError::Unauthorized)));
        }
        assert!(registry.current().rule("r_new").is_none());
    }

    #[tokio::test]
    async fn test_injection_persists_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let (_, _, injector) = fixture(Some(dir.path().to_path_buf()));
        injector
            .inject(keyword_rule("r_persisted", "bad"), "rev-1", "review", TrustTier::Privileged)
            .await
            .unwrap();
        assert!(dir.path().join("r_persisted.yml").exists());
    }

    #[tokio::test]
    async fn test_bad_rule_rejected_before_publish() {
        let (registry, audit, injector) = fixture(None);
        let mut bad = keyword_rule("bad", "unused");
        bad.match_type = MatchType::Regex;
        bad.patterns = vec!["(unclosed".to_string()];

        let result = injector
            .inject(bad, "rev-1", "review", TrustTier::Privileged)
            .await;
        assert!(result.is_err());
        assert!(audit.all().is_empty());
        assert!(registry.current().rule("bad").is_none());
    }
}
