//! Snapshot compilation: keyword automaton, regex set, composite trees.
//!
//! A [`RegistrySnapshot`] is built once per registry version and never
//! modified afterwards (the per-pattern timeout counters are the only
//! interior-mutable state; they do not affect which rules a reader sees).
//! Keyword patterns across all rules combine into a single Aho-Corasick
//! automaton; regex patterns combine into one multi-pattern set. Composite
//! rules compile to boolean trees whose leaves live in the shared automaton
//! and set, so the hot path stays at two linear passes regardless of rule
//! count.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32};

use aho_corasick::AhoCorasick;
use regex::{Regex, RegexSet};
use sha2::{Digest, Sha256};
use tracing::warn;

use guardian_core::types::Severity;

use crate::error::{RegistryError, Result};
use crate::schema::{CompositeExpr, CompositeLeaf, CompositeOperand, MatchType, Rule};

/// Upper bound on a single compiled regex program, rejecting pathological
/// patterns at load time rather than on the hot path.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

// ── Pattern origins ───────────────────────────────────────────

/// Where a compiled pattern came from: a plain rule, or a leaf of a
/// composite rule's boolean tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternOrigin {
    Rule { rule_id: String },
    CompositeLeaf { composite: usize, leaf: usize },
}

/// One compiled regex with its degradation counters.
///
/// `consecutive_timeouts` and `disabled` are interior-mutable so the engine
/// can auto-disable a repeatedly timing-out pattern without republishing the
/// snapshot.
#[derive(Debug)]
pub struct CompiledPattern {
    pub source: String,
    pub regex: Regex,
    pub origin: PatternOrigin,
    pub disabled: AtomicBool,
    pub consecutive_timeouts: AtomicU32,
}

/// A composite rule compiled to leaf indices into the shared passes.
#[derive(Debug, Clone)]
pub struct CompiledComposite {
    pub rule_id: String,
    pub expr: CompiledExpr,
    pub leaf_count: usize,
}

/// Boolean tree over leaf-match bits.
#[derive(Debug, Clone)]
pub enum CompiledExpr {
    Leaf(usize),
    And(Vec<CompiledExpr>),
    Or(Vec<CompiledExpr>),
    Not(Box<CompiledExpr>),
}

impl CompiledExpr {
    /// Evaluate against the leaf-match bits of one composite rule.
    pub fn evaluate(&self, leaf_bits: &[bool]) -> bool {
        match self {
            CompiledExpr::Leaf(idx) => leaf_bits.get(*idx).copied().unwrap_or(false),
            CompiledExpr::And(children) => children.iter().all(|c| c.evaluate(leaf_bits)),
            CompiledExpr::Or(children) => children.iter().any(|c| c.evaluate(leaf_bits)),
            CompiledExpr::Not(child) => !child.evaluate(leaf_bits),
        }
    }
}

// ── Compiled rule set ─────────────────────────────────────────

/// The matchers for one snapshot.
#[derive(Debug)]
pub struct CompiledRules {
    /// Aho-Corasick automaton over every keyword pattern (lowercased).
    /// `None` when no keyword patterns exist.
    pub automaton: Option<AhoCorasick>,
    /// Automaton pattern index → origin.
    pub keyword_origins: Vec<PatternOrigin>,
    /// Multi-pattern set over every regex source, aligned with `regexes`.
    pub regex_set: Option<RegexSet>,
    /// Individual regexes for span extraction and per-pattern timing.
    pub regexes: Vec<CompiledPattern>,
    /// Compiled composite rules.
    pub composites: Vec<CompiledComposite>,
}

// ── Registry snapshot ─────────────────────────────────────────

/// An immutable, versioned compilation of the active rule set.
#[derive(Debug)]
pub struct RegistrySnapshot {
    pub registry_version: u64,
    /// All rules by id, including disabled ones (disabled rules are absent
    /// from the compiled matchers).
    pub rules: HashMap<String, Rule>,
    pub compiled: CompiledRules,
    /// Hash of the canonical rule set; identical rule sets produce
    /// identical hashes regardless of load order.
    pub content_hash: String,
}

impl RegistrySnapshot {
    /// An empty snapshot (version 0) used before the first load.
    pub fn empty() -> Self {
        Self {
            registry_version: 0,
            rules: HashMap::new(),
            compiled: CompiledRules {
                automaton: None,
                keyword_origins: Vec::new(),
                regex_set: None,
                regexes: Vec::new(),
                composites: Vec::new(),
            },
            content_hash: String::new(),
        }
    }

    /// Compile a snapshot from the given rules.
    ///
    /// Rules failing structural validation or pattern compilation are
    /// handled per the mandatory-load policy: a mandatory rule (block +
    /// high/critical) failure aborts the whole build; any other failure
    /// disables the rule in the produced snapshot with a warning.
    pub fn build(registry_version: u64, rules: Vec<Rule>) -> Result<Self> {
        let mut rule_map: HashMap<String, Rule> = HashMap::new();
        for rule in rules {
            if let Err(e) = rule.validate() {
                if rule.is_mandatory() {
                    return Err(RegistryError::MandatoryCompile {
                        rule_id: rule.id.clone(),
                        detail: e.to_string(),
                    });
                }
                warn!(rule_id = %rule.id, error = %e, "disabling invalid rule");
                let mut disabled = rule;
                disabled.enabled = false;
                rule_map.insert(disabled.id.clone(), disabled);
                continue;
            }
            rule_map.insert(rule.id.clone(), rule);
        }

        let compiled = compile_rules(&mut rule_map)?;
        let content_hash = hash_rules(&rule_map);

        Ok(Self {
            registry_version,
            rules: rule_map,
            compiled,
            content_hash,
        })
    }

    pub fn rule(&self, id: &str) -> Option<&Rule> {
        self.rules.get(id)
    }

    /// Derived severity distribution of enabled rules.
    ///
    /// Counts are computed, never stored, so there is a single source of
    /// truth for reporting.
    pub fn severity_counts(&self) -> HashMap<Severity, usize> {
        let mut counts = HashMap::new();
        for rule in self.rules.values().filter(|r| r.enabled) {
            *counts.entry(rule.severity).or_insert(0) += 1;
        }
        counts
    }
}

/// Canonical hash over the rule set: rules sorted by id, serialized as JSON.
fn hash_rules(rules: &HashMap<String, Rule>) -> String {
    let mut ids: Vec<&String> = rules.keys().collect();
    ids.sort();
    let mut hasher = Sha256::new();
    for id in ids {
        let rule = &rules[id];
        // serde_json preserves struct field order, so serialization is stable.
        let bytes = serde_json::to_vec(rule).unwrap_or_default();
        hasher.update(&bytes);
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Compile all enabled rules. May flip `enabled = false` on non-mandatory
/// rules whose patterns fail to compile.
fn compile_rules(rule_map: &mut HashMap<String, Rule>) -> Result<CompiledRules> {
    let mut keyword_patterns: Vec<String> = Vec::new();
    let mut keyword_origins: Vec<PatternOrigin> = Vec::new();
    let mut regexes: Vec<CompiledPattern> = Vec::new();
    let mut composites: Vec<CompiledComposite> = Vec::new();
    let mut failed_rules: Vec<String> = Vec::new();

    // Stable iteration so automaton/set indices are deterministic.
    let mut ids: Vec<String> = rule_map.keys().cloned().collect();
    ids.sort();

    for id in &ids {
        let rule = &rule_map[id];
        if !rule.enabled {
            continue;
        }
        let outcome = match rule.match_type {
            MatchType::Keyword => {
                for pattern in &rule.patterns {
                    keyword_patterns.push(pattern.to_lowercase());
                    keyword_origins.push(PatternOrigin::Rule {
                        rule_id: rule.id.clone(),
                    });
                }
                Ok(())
            }
            MatchType::Regex => compile_regex_rule(rule, &mut regexes),
            MatchType::Composite => compile_composite_rule(
                rule,
                composites.len(),
                &mut keyword_patterns,
                &mut keyword_origins,
                &mut regexes,
                &mut composites,
            ),
        };

        if let Err(e) = outcome {
            if rule.is_mandatory() {
                return Err(RegistryError::MandatoryCompile {
                    rule_id: rule.id.clone(),
                    detail: e.to_string(),
                });
            }
            warn!(rule_id = %rule.id, error = %e, "disabling rule with uncompilable pattern");
            failed_rules.push(rule.id.clone());
        }
    }

    for id in failed_rules {
        if let Some(rule) = rule_map.get_mut(&id) {
            rule.enabled = false;
        }
    }

    let automaton = if keyword_patterns.is_empty() {
        None
    } else {
        Some(AhoCorasick::new(&keyword_patterns).map_err(|e| {
            RegistryError::Validation(format!("keyword automaton build failed: {}", e))
        })?)
    };

    let regex_set = if regexes.is_empty() {
        None
    } else {
        let sources: Vec<&str> = regexes.iter().map(|p| p.source.as_str()).collect();
        Some(RegexSet::new(&sources).map_err(|e| {
            RegistryError::Validation(format!("regex set build failed: {}", e))
        })?)
    };

    Ok(CompiledRules {
        automaton,
        keyword_origins,
        regex_set,
        regexes,
        composites,
    })
}

fn compile_one_regex(source: &str) -> std::result::Result<Regex, String> {
    regex::RegexBuilder::new(source)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| e.to_string())
}

fn compile_regex_rule(rule: &Rule, regexes: &mut Vec<CompiledPattern>) -> Result<()> {
    let mut compiled = Vec::with_capacity(rule.patterns.len());
    for pattern in &rule.patterns {
        let regex = compile_one_regex(pattern)
            .map_err(|e| RegistryError::Validation(format!("pattern '{}': {}", pattern, e)))?;
        compiled.push(CompiledPattern {
            source: pattern.clone(),
            regex,
            origin: PatternOrigin::Rule {
                rule_id: rule.id.clone(),
            },
            disabled: AtomicBool::new(false),
            consecutive_timeouts: AtomicU32::new(0),
        });
    }
    // All patterns compiled; only now commit them.
    regexes.extend(compiled);
    Ok(())
}

fn compile_composite_rule(
    rule: &Rule,
    composite_idx: usize,
    keyword_patterns: &mut Vec<String>,
    keyword_origins: &mut Vec<PatternOrigin>,
    regexes: &mut Vec<CompiledPattern>,
    composites: &mut Vec<CompiledComposite>,
) -> Result<()> {
    let expr = rule.expression.as_ref().ok_or_else(|| {
        RegistryError::Validation(format!("composite rule '{}' has no expression", rule.id))
    })?;

    // First pass: compile every regex leaf before touching shared state, so
    // a failure leaves the automaton inputs untouched.
    let mut leaf_regexes: Vec<(usize, Regex, String)> = Vec::new();
    let mut leaf_count = 0usize;
    let mut leaf_error: Option<RegistryError> = None;
    expr.for_each_leaf(&mut |leaf| {
        let leaf_id = leaf_count;
        leaf_count += 1;
        if leaf_error.is_some() {
            return;
        }
        if let CompositeLeaf::Regex(source) = leaf {
            match compile_one_regex(source) {
                Ok(regex) => leaf_regexes.push((leaf_id, regex, source.clone())),
                Err(e) => {
                    leaf_error = Some(RegistryError::Validation(format!(
                        "composite '{}' leaf pattern '{}': {}",
                        rule.id, source, e
                    )));
                }
            }
        }
    });
    if let Some(e) = leaf_error {
        return Err(e);
    }

    // Second pass: register leaves in the shared automaton and regex list.
    let mut leaf_id = 0usize;
    expr.for_each_leaf(&mut |leaf| {
        match leaf {
            CompositeLeaf::Keywords(words) => {
                for word in words {
                    keyword_patterns.push(word.to_lowercase());
                    keyword_origins.push(PatternOrigin::CompositeLeaf {
                        composite: composite_idx,
                        leaf: leaf_id,
                    });
                }
            }
            CompositeLeaf::Regex(_) => {
                let (_, regex, source) = leaf_regexes
                    .iter()
                    .find(|(id, _, _)| *id == leaf_id)
                    .cloned()
                    .expect("regex leaf compiled in first pass");
                regexes.push(CompiledPattern {
                    source,
                    regex,
                    origin: PatternOrigin::CompositeLeaf {
                        composite: composite_idx,
                        leaf: leaf_id,
                    },
                    disabled: AtomicBool::new(false),
                    consecutive_timeouts: AtomicU32::new(0),
                });
            }
        }
        leaf_id += 1;
    });

    let compiled_expr = lower_expr(expr, &mut 0);
    composites.push(CompiledComposite {
        rule_id: rule.id.clone(),
        expr: compiled_expr,
        leaf_count,
    });
    Ok(())
}

/// Lower the schema expression to leaf indices, numbering leaves in the same
/// depth-first order as `for_each_leaf`.
fn lower_expr(expr: &CompositeExpr, next_leaf: &mut usize) -> CompiledExpr {
    match expr {
        CompositeExpr::And(ops) => {
            CompiledExpr::And(ops.iter().map(|op| lower_operand(op, next_leaf)).collect())
        }
        CompositeExpr::Or(ops) => {
            CompiledExpr::Or(ops.iter().map(|op| lower_operand(op, next_leaf)).collect())
        }
        CompositeExpr::Not(op) => CompiledExpr::Not(Box::new(lower_operand(op, next_leaf))),
    }
}

fn lower_operand(op: &CompositeOperand, next_leaf: &mut usize) -> CompiledExpr {
    match op {
        CompositeOperand::Leaf(_) => {
            let idx = *next_leaf;
            *next_leaf += 1;
            CompiledExpr::Leaf(idx)
        }
        CompositeOperand::Nested(expr) => lower_expr(expr, next_leaf),
    }
}
