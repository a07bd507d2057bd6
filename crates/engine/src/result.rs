//! Evaluation result types.

use serde::Serialize;

use guardian_core::types::{ReasonCode, RuleAction, RuleCategory, Severity};

/// A single rule hit.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Match {
    pub rule_id: String,
    pub category: RuleCategory,
    pub severity: Severity,
    pub action: RuleAction,
    pub confidence: f64,
    pub priority: i32,
    /// Byte span in the normalized text, when the matcher produced one
    /// (composite rules match without a single span).
    pub span: Option<(usize, usize)>,
}

/// Outcome of one engine evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    /// Matches ordered by severity desc, priority asc, rule id asc.
    pub matches: Vec<Match>,
    pub highest_severity: Option<Severity>,
    /// Derived: block if any match blocks, else escalate if any escalates,
    /// else the worst remaining action. `None` means pass.
    pub terminal_action: Option<RuleAction>,
    pub latency_ms: u64,
    pub registry_version: u64,
    pub cache_key: String,
}

impl EvaluationResult {
    pub fn is_pass(&self) -> bool {
        self.terminal_action.is_none()
    }

    pub fn is_block(&self) -> bool {
        self.terminal_action == Some(RuleAction::Block)
    }

    pub fn is_escalate(&self) -> bool {
        self.terminal_action == Some(RuleAction::Escalate)
    }

    /// The reason code derived from the highest-severity match, if any.
    pub fn reason_code(&self) -> Option<ReasonCode> {
        self.matches
            .first()
            .map(|m| ReasonCode::from_category(m.category))
    }
}

/// Collapsed pre-check decision.
#[derive(Debug, Clone, Serialize)]
pub struct QuickCheck {
    pub blocked: bool,
    pub reason_code: Option<ReasonCode>,
    pub action: Option<RuleAction>,
}
