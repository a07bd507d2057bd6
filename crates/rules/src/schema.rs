//! Declarative rule schema with serde deserialization.
//!
//! A rule file is a YAML document with a top-level `version` string and a
//! `rules` list. Unknown fields are rejected by the loader.

use serde::{Deserialize, Serialize};

use guardian_core::types::{RuleAction, RuleCategory, Severity};

use crate::error::RegistryError;

/// Top-level rule file document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RuleFile {
    /// Schema version of the rule file format.
    pub version: String,
    pub rules: Vec<Rule>,
}

/// How a rule's patterns are interpreted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Keyword,
    Regex,
    Composite,
}

/// Which direction of traffic a rule applies to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Input,
    Output,
    #[default]
    Both,
}

impl RuleScope {
    /// Whether a rule with this scope participates in an evaluation of the
    /// given direction.
    pub fn covers(&self, other: RuleScope) -> bool {
        matches!(self, RuleScope::Both) || *self == other
    }
}

/// A declarative match specification with identity and policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    /// Stable identifier, unique within a registry version. Immutable.
    pub id: String,
    pub category: RuleCategory,
    pub severity: Severity,
    pub action: RuleAction,
    pub match_type: MatchType,
    /// Literal keywords or regex source strings, per `match_type`.
    /// Unused for composite rules.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Boolean tree over keyword/regex leaves; required for composite rules.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<CompositeExpr>,
    /// Advisory weight in 0.0..1.0.
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Tie-break ordering; lower wins.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Monotonic, bumped on any edit.
    #[serde(default = "default_version")]
    pub version: u64,
    #[serde(default)]
    pub scope: RuleScope,
}

fn default_confidence() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

fn default_version() -> u64 {
    1
}

impl Rule {
    /// Mandatory-load rules: blocking rules at high or critical severity.
    /// A registry load refuses to activate if any of these fails to compile.
    pub fn is_mandatory(&self) -> bool {
        self.action == RuleAction::Block && self.severity >= Severity::High
    }

    /// Structural validation independent of pattern compilation.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.id.is_empty() {
            return Err(RegistryError::Validation(
                "rule id must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(RegistryError::Validation(format!(
                "rule '{}': confidence {} outside 0.0..1.0",
                self.id, self.confidence
            )));
        }
        match self.match_type {
            MatchType::Composite => {
                if self.expression.is_none() {
                    return Err(RegistryError::Validation(format!(
                        "composite rule '{}' has no expression",
                        self.id
                    )));
                }
            }
            _ => {
                if self.patterns.is_empty() {
                    return Err(RegistryError::Validation(format!(
                        "rule '{}' has no patterns",
                        self.id
                    )));
                }
                if self.patterns.iter().any(|p| p.is_empty()) {
                    return Err(RegistryError::Validation(format!(
                        "rule '{}' contains an empty pattern",
                        self.id
                    )));
                }
            }
        }
        Ok(())
    }
}

// ── Composite expressions ─────────────────────────────────────

/// Boolean composition tree for combining leaf matchers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CompositeExpr {
    /// All operands must match.
    And(Vec<CompositeOperand>),
    /// At least one operand must match.
    Or(Vec<CompositeOperand>),
    /// The single operand must not match.
    Not(Box<CompositeOperand>),
}

/// An operand: a leaf matcher or a nested expression.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CompositeOperand {
    Leaf(CompositeLeaf),
    Nested(CompositeExpr),
}

/// Leaf matchers evaluated by the shared automaton / regex set passes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CompositeLeaf {
    /// True if any of the listed keywords appears.
    Keywords(Vec<String>),
    /// True if the regex matches.
    Regex(String),
}

impl CompositeExpr {
    /// Visit every leaf in the tree.
    pub fn for_each_leaf<'a>(&'a self, f: &mut impl FnMut(&'a CompositeLeaf)) {
        match self {
            CompositeExpr::And(ops) | CompositeExpr::Or(ops) => {
                for op in ops {
                    op.for_each_leaf(f);
                }
            }
            CompositeExpr::Not(op) => op.for_each_leaf(f),
        }
    }
}

impl CompositeOperand {
    fn for_each_leaf<'a>(&'a self, f: &mut impl FnMut(&'a CompositeLeaf)) {
        match self {
            CompositeOperand::Leaf(leaf) => f(leaf),
            CompositeOperand::Nested(expr) => expr.for_each_leaf(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyword_rule(id: &str) -> Rule {
        Rule {
            id: id.to_string(),
            category: RuleCategory::Weapons,
            severity: Severity::Critical,
            action: RuleAction::Block,
            match_type: MatchType::Keyword,
            patterns: vec!["bomb".to_string()],
            expression: None,
            confidence: 0.9,
            priority: 10,
            enabled: true,
            version: 1,
            scope: RuleScope::Both,
        }
    }

    #[test]
    fn test_rule_file_yaml_roundtrip() {
        let yaml = r#"
version: "1"
rules:
  - id: weapon_bomb
    category: weapons
    severity: critical
    action: block
    match_type: regex
    patterns:
      - '(how\s+to\s+)?(make|build)\s+(a\s+)?(bomb|explosive)'
    confidence: 0.95
    priority: 1
"#;
        let file: RuleFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.version, "1");
        assert_eq!(file.rules.len(), 1);
        let rule = &file.rules[0];
        assert_eq!(rule.id, "weapon_bomb");
        assert_eq!(rule.severity, Severity::Critical);
        assert_eq!(rule.action, RuleAction::Block);
        assert!(rule.enabled);
        assert_eq!(rule.version, 1);
        assert_eq!(rule.scope, RuleScope::Both);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = r#"
version: "1"
rules:
  - id: r1
    category: cyber
    severity: low
    action: log
    match_type: keyword
    patterns: ["x"]
    surprise: true
"#;
        assert!(serde_yaml::from_str::<RuleFile>(yaml).is_err());
    }

    #[test]
    fn test_composite_yaml() {
        let yaml = r#"
version: "1"
rules:
  - id: jailbreak_combo
    category: jailbreak
    severity: high
    action: escalate
    match_type: composite
    expression:
      and:
        - keywords: ["ignore previous", "disregard"]
        - regex: 'system\s+prompt'
"#;
        let file: RuleFile = serde_yaml::from_str(yaml).unwrap();
        let rule = &file.rules[0];
        assert!(rule.expression.is_some());
        let mut leaves = 0;
        rule.expression.as_ref().unwrap().for_each_leaf(&mut |_| leaves += 1);
        assert_eq!(leaves, 2);
    }

    #[test]
    fn test_validate_rejects_empty_patterns() {
        let mut rule = keyword_rule("r1");
        rule.patterns.clear();
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_confidence() {
        let mut rule = keyword_rule("r1");
        rule.confidence = 1.5;
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_mandatory_classification() {
        let rule = keyword_rule("r1");
        assert!(rule.is_mandatory());

        let mut warn_rule = keyword_rule("r2");
        warn_rule.action = RuleAction::Warn;
        assert!(!warn_rule.is_mandatory());

        let mut low_block = keyword_rule("r3");
        low_block.severity = Severity::Medium;
        assert!(!low_block.is_mandatory());
    }

    #[test]
    fn test_scope_covers() {
        assert!(RuleScope::Both.covers(RuleScope::Input));
        assert!(RuleScope::Both.covers(RuleScope::Output));
        assert!(RuleScope::Input.covers(RuleScope::Input));
        assert!(!RuleScope::Input.covers(RuleScope::Output));
    }
}
