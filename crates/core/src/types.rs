//! Severity / action / tier taxonomy shared by every pipeline stage.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Severity ──────────────────────────────────────────────────

/// Ordered rule severity: low < medium < high < critical.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Numeric rank for comparison (higher = more severe).
    pub fn as_rank(&self) -> u8 {
        match self {
            Severity::Low => 0,
            Severity::Medium => 1,
            Severity::High => 2,
            Severity::Critical => 3,
        }
    }

    /// Risk-score accrual weight for a violation of this severity.
    pub fn risk_weight(&self) -> f64 {
        match self {
            Severity::Critical => 0.5,
            Severity::High => 0.3,
            Severity::Medium => 0.15,
            Severity::Low => 0.05,
        }
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_rank().cmp(&other.as_rank())
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

// ── Rule action ───────────────────────────────────────────────

/// What a matching rule asks the pipeline to do.
///
/// Terminal-action derivation picks the worst action across all matches:
/// block > escalate > canary > warn > log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Log,
    Warn,
    Canary,
    Escalate,
    Block,
}

impl RuleAction {
    /// Numeric rank for worst-of derivation (higher = stronger action).
    pub fn as_rank(&self) -> u8 {
        match self {
            RuleAction::Log => 0,
            RuleAction::Warn => 1,
            RuleAction::Canary => 2,
            RuleAction::Escalate => 3,
            RuleAction::Block => 4,
        }
    }
}

impl PartialOrd for RuleAction {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RuleAction {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_rank().cmp(&other.as_rank())
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleAction::Log => "log",
            RuleAction::Warn => "warn",
            RuleAction::Canary => "canary",
            RuleAction::Escalate => "escalate",
            RuleAction::Block => "block",
        };
        write!(f, "{}", s)
    }
}

// ── Rule category ─────────────────────────────────────────────

/// Harm category a rule belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Weapons,
    Bio,
    Chem,
    Cyber,
    Csam,
    SelfHarm,
    Jailbreak,
    Validation,
    Custom,
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuleCategory::Weapons => "weapons",
            RuleCategory::Bio => "bio",
            RuleCategory::Chem => "chem",
            RuleCategory::Cyber => "cyber",
            RuleCategory::Csam => "csam",
            RuleCategory::SelfHarm => "self_harm",
            RuleCategory::Jailbreak => "jailbreak",
            RuleCategory::Validation => "validation",
            RuleCategory::Custom => "custom",
        };
        write!(f, "{}", s)
    }
}

// ── Trust tier ────────────────────────────────────────────────

/// Ordered classification of the request's origin.
///
/// Determines baseline rate limits; `Privileged` additionally gates the
/// dynamic rule-injection channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    Anon,
    User,
    Verified,
    Privileged,
}

impl TrustTier {
    pub fn as_rank(&self) -> u8 {
        match self {
            TrustTier::Anon => 0,
            TrustTier::User => 1,
            TrustTier::Verified => 2,
            TrustTier::Privileged => 3,
        }
    }

    /// Parse from the wire representation used in API-key maps.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "anon" => Some(TrustTier::Anon),
            "user" => Some(TrustTier::User),
            "verified" => Some(TrustTier::Verified),
            "privileged" => Some(TrustTier::Privileged),
            _ => None,
        }
    }
}

impl PartialOrd for TrustTier {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TrustTier {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_rank().cmp(&other.as_rank())
    }
}

impl fmt::Display for TrustTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrustTier::Anon => "anon",
            TrustTier::User => "user",
            TrustTier::Verified => "verified",
            TrustTier::Privileged => "privileged",
        };
        write!(f, "{}", s)
    }
}

// ── Reason codes ──────────────────────────────────────────────

/// Closed set of refusal reason codes surfaced to callers.
///
/// Refusals are non-informative by design: the code names the policy area,
/// never the rule or pattern that fired.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    HighRiskWeapon,
    HighRiskBio,
    HighRiskChem,
    HighRiskCyber,
    ProhibitedContent,
    SelfHarmContent,
    JailbreakAttempt,
    ValidationFailed,
    PolicyViolation,
    CanaryReplay,
    RateLimited,
    SubjectSuspended,
    SafetyUnavailable,
    ModelUnavailable,
    Timeout,
}

impl ReasonCode {
    /// Map a rule category to the reason code used in refusals.
    pub fn from_category(category: RuleCategory) -> Self {
        match category {
            RuleCategory::Weapons => ReasonCode::HighRiskWeapon,
            RuleCategory::Bio => ReasonCode::HighRiskBio,
            RuleCategory::Chem => ReasonCode::HighRiskChem,
            RuleCategory::Cyber => ReasonCode::HighRiskCyber,
            RuleCategory::Csam => ReasonCode::ProhibitedContent,
            RuleCategory::SelfHarm => ReasonCode::SelfHarmContent,
            RuleCategory::Jailbreak => ReasonCode::JailbreakAttempt,
            RuleCategory::Validation => ReasonCode::ValidationFailed,
            RuleCategory::Custom => ReasonCode::PolicyViolation,
        }
    }

    /// Wire representation (SCREAMING_SNAKE_CASE).
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::HighRiskWeapon => "HIGH_RISK_WEAPON",
            ReasonCode::HighRiskBio => "HIGH_RISK_BIO",
            ReasonCode::HighRiskChem => "HIGH_RISK_CHEM",
            ReasonCode::HighRiskCyber => "HIGH_RISK_CYBER",
            ReasonCode::ProhibitedContent => "PROHIBITED_CONTENT",
            ReasonCode::SelfHarmContent => "SELF_HARM_CONTENT",
            ReasonCode::JailbreakAttempt => "JAILBREAK_ATTEMPT",
            ReasonCode::ValidationFailed => "VALIDATION_FAILED",
            ReasonCode::PolicyViolation => "POLICY_VIOLATION",
            ReasonCode::CanaryReplay => "CANARY_REPLAY",
            ReasonCode::RateLimited => "RATE_LIMITED",
            ReasonCode::SubjectSuspended => "SUBJECT_SUSPENDED",
            ReasonCode::SafetyUnavailable => "SAFETY_UNAVAILABLE",
            ReasonCode::ModelUnavailable => "MODEL_UNAVAILABLE",
            ReasonCode::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
