//! Audit record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use guardian_core::types::{ReasonCode, Severity};

/// Pipeline stage that produced a record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditStage {
    Pre,
    Post,
    Escalate,
    Review,
    Inject,
    Timeout,
}

impl AuditStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStage::Pre => "pre",
            AuditStage::Post => "post",
            AuditStage::Escalate => "escalate",
            AuditStage::Review => "review",
            AuditStage::Inject => "inject",
            AuditStage::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pre" => Some(AuditStage::Pre),
            "post" => Some(AuditStage::Post),
            "escalate" => Some(AuditStage::Escalate),
            "review" => Some(AuditStage::Review),
            "inject" => Some(AuditStage::Inject),
            "timeout" => Some(AuditStage::Timeout),
            _ => None,
        }
    }
}

/// The decision a stage recorded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditDecision {
    Pass,
    Block,
    Escalate,
    Approve,
    Inject,
    Timeout,
}

impl AuditDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditDecision::Pass => "pass",
            AuditDecision::Block => "block",
            AuditDecision::Escalate => "escalate",
            AuditDecision::Approve => "approve",
            AuditDecision::Inject => "inject",
            AuditDecision::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pass" => Some(AuditDecision::Pass),
            "block" => Some(AuditDecision::Block),
            "escalate" => Some(AuditDecision::Escalate),
            "approve" => Some(AuditDecision::Approve),
            "inject" => Some(AuditDecision::Inject),
            "timeout" => Some(AuditDecision::Timeout),
            _ => None,
        }
    }
}

/// Review/workflow status of a record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Open,
    Escalated,
    Approved,
    Blocked,
    Resolved,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Open => "open",
            AuditStatus::Escalated => "escalated",
            AuditStatus::Approved => "approved",
            AuditStatus::Blocked => "blocked",
            AuditStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(AuditStatus::Open),
            "escalated" => Some(AuditStatus::Escalated),
            "approved" => Some(AuditStatus::Approved),
            "blocked" => Some(AuditStatus::Blocked),
            "resolved" => Some(AuditStatus::Resolved),
            _ => None,
        }
    }
}

/// One immutable ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    /// Unique id of this record; also the support ticket id when this is
    /// the root of its lineage.
    pub audit_id: String,
    /// Root audit id shared by every record in the chain.
    pub lineage_id: String,
    pub request_id: String,
    pub trace_id: String,
    pub subject_id: String,
    pub stage: AuditStage,
    pub decision: AuditDecision,
    pub reason_code: Option<ReasonCode>,
    /// Internal only — never surfaced in refusal envelopes.
    pub rule_ids: Vec<String>,
    pub severity: Option<Severity>,
    pub status: AuditStatus,
    pub reviewer_id: Option<String>,
    pub notes: Option<String>,
    pub created_ts: DateTime<Utc>,
    pub updated_ts: DateTime<Utc>,
}

impl AuditRecord {
    /// Start a new lineage.
    pub fn new(
        request_id: impl Into<String>,
        trace_id: impl Into<String>,
        subject_id: impl Into<String>,
        stage: AuditStage,
        decision: AuditDecision,
        status: AuditStatus,
    ) -> Self {
        let audit_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        Self {
            lineage_id: audit_id.clone(),
            audit_id,
            request_id: request_id.into(),
            trace_id: trace_id.into(),
            subject_id: subject_id.into(),
            stage,
            decision,
            reason_code: None,
            rule_ids: Vec::new(),
            severity: None,
            status,
            reviewer_id: None,
            notes: None,
            created_ts: now,
            updated_ts: now,
        }
    }

    pub fn with_reason(mut self, reason_code: ReasonCode) -> Self {
        self.reason_code = Some(reason_code);
        self
    }

    pub fn with_rules(mut self, rule_ids: Vec<String>) -> Self {
        self.rule_ids = rule_ids;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Append-only amendment: a fresh record joining this one's lineage.
    pub fn follow_up(
        &self,
        stage: AuditStage,
        decision: AuditDecision,
        status: AuditStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            audit_id: Uuid::new_v4().to_string(),
            lineage_id: self.lineage_id.clone(),
            request_id: self.request_id.clone(),
            trace_id: self.trace_id.clone(),
            subject_id: self.subject_id.clone(),
            stage,
            decision,
            reason_code: self.reason_code,
            rule_ids: self.rule_ids.clone(),
            severity: self.severity,
            status,
            reviewer_id: None,
            notes: None,
            created_ts: now,
            updated_ts: now,
        }
    }
}
