//! Atomic, versioned rule registry.
//!
//! The registry owns the source rules (file-loaded and dynamically injected)
//! and publishes compiled [`RegistrySnapshot`]s behind an atomic swap.
//! Readers call [`RuleRegistry::current`] and hold a consistent snapshot for
//! the whole evaluation; they never block a writer and never observe partial
//! state. Dynamic-injected rules supersede file rules with the same id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{error, info};

use crate::compile::RegistrySnapshot;
use crate::error::{RegistryError, Result};
use crate::schema::Rule;

/// Which source a rule came from. On conflict, `Dynamic` wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOrigin {
    File,
    Dynamic,
}

type SwapCallback = Box<dyn Fn(u64) + Send + Sync>;

/// Authoritative rule store publishing immutable compiled snapshots.
pub struct RuleRegistry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    version: AtomicU64,
    /// Source rules by id. The mutex serializes writers; readers only touch
    /// the published snapshot.
    rules: Mutex<HashMap<String, (Rule, RuleOrigin)>>,
    subscribers: RwLock<Vec<SwapCallback>>,
}

impl RuleRegistry {
    /// Create a registry with an empty version-0 snapshot. The pipeline
    /// treats a registry that has never activated as degraded (fail-closed).
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::empty())),
            version: AtomicU64::new(0),
            rules: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// The active snapshot. Cheap (one `Arc` clone); never blocks writers.
    pub fn current(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.snapshot.read().expect("snapshot lock poisoned"))
    }

    /// Whether at least one snapshot has been successfully published.
    pub fn has_activated(&self) -> bool {
        self.version.load(Ordering::Acquire) > 0
    }

    /// Replace all file-sourced rules with `rules` and publish a new
    /// snapshot. Dynamically injected rules are retained and supersede file
    /// rules with the same id.
    ///
    /// On any mandatory-rule compile failure the prior snapshot stays in
    /// force and the load fails wholesale.
    pub fn load_from(&self, rules: Vec<Rule>) -> Result<u64> {
        let mut source = self.rules.lock().expect("rules lock poisoned");
        let mut merged: HashMap<String, (Rule, RuleOrigin)> = source
            .iter()
            .filter(|(_, (_, origin))| *origin == RuleOrigin::Dynamic)
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        for rule in rules {
            if merged.contains_key(&rule.id) {
                info!(rule_id = %rule.id, "dynamic rule supersedes file rule with same id");
                continue;
            }
            merged.insert(rule.id.clone(), (rule, RuleOrigin::File));
        }

        let version = self.publish(&merged)?;
        *source = merged;
        Ok(version)
    }

    /// Merge a single rule into a new snapshot and publish atomically.
    /// The rule is validated and its patterns compiled in isolation before
    /// it touches the shared rule set.
    pub fn inject(&self, rule: Rule) -> Result<u64> {
        rule.validate()?;
        // Isolated compile: a bad pattern must never poison the live set.
        RegistrySnapshot::build(0, vec![rule.clone()]).map_err(|e| {
            RegistryError::Validation(format!("injected rule '{}' rejected: {}", rule.id, e))
        })?;

        let mut source = self.rules.lock().expect("rules lock poisoned");
        let mut merged = source.clone();
        merged.insert(rule.id.clone(), (rule.clone(), RuleOrigin::Dynamic));

        let version = self.publish(&merged)?;
        info!(rule_id = %rule.id, registry_version = version, "dynamic rule injected");
        *source = merged;
        Ok(version)
    }

    /// Publish a snapshot with the named rule enabled.
    pub fn enable(&self, id: &str) -> Result<u64> {
        self.set_enabled(id, true)
    }

    /// Publish a snapshot with the named rule disabled. Disabled rules are
    /// evaluated as absent.
    pub fn disable(&self, id: &str) -> Result<u64> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<u64> {
        let mut source = self.rules.lock().expect("rules lock poisoned");
        let mut merged = source.clone();
        let entry = merged.get_mut(id).ok_or_else(|| {
            RegistryError::Validation(format!("unknown rule id '{}'", id))
        })?;
        if entry.0.enabled != enabled {
            entry.0.enabled = enabled;
            entry.0.version += 1;
        }

        let version = self.publish(&merged)?;
        info!(rule_id = %id, enabled, registry_version = version, "rule flag flipped");
        *source = merged;
        Ok(version)
    }

    /// Register a callback invoked with the new registry version after each
    /// successful snapshot swap.
    pub fn subscribe(&self, callback: impl Fn(u64) + Send + Sync + 'static) {
        self.subscribers
            .write()
            .expect("subscribers lock poisoned")
            .push(Box::new(callback));
    }

    /// Compile and atomically swap in a new snapshot. Failure leaves the
    /// prior snapshot untouched and raises a fatal alert for mandatory
    /// compile errors.
    fn publish(&self, merged: &HashMap<String, (Rule, RuleOrigin)>) -> Result<u64> {
        let next_version = self.version.load(Ordering::Acquire) + 1;
        let rules: Vec<Rule> = merged.values().map(|(rule, _)| rule.clone()).collect();

        let snapshot = match RegistrySnapshot::build(next_version, rules) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "registry load rejected — prior snapshot remains in force");
                return Err(e);
            }
        };

        let enabled = snapshot.rules.values().filter(|r| r.enabled).count();
        {
            let mut guard = self.snapshot.write().expect("snapshot lock poisoned");
            *guard = Arc::new(snapshot);
        }
        self.version.store(next_version, Ordering::Release);
        info!(
            registry_version = next_version,
            rule_count = enabled,
            "registry snapshot published"
        );

        let subscribers = self.subscribers.read().expect("subscribers lock poisoned");
        for callback in subscribers.iter() {
            callback(next_version);
        }
        Ok(next_version)
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
