//! Filesystem-backed rule loading with optional hot-reload.
//!
//! Scans a directory (recursively) for `*.yml` / `*.yaml` rule files,
//! deserializes them into [`RuleFile`] documents, and feeds the combined
//! rule set into the [`RuleRegistry`]. A `notify` watcher triggers a full
//! re-scan on any file change; the periodic poll interval configured via
//! `GUARDIAN_RELOAD_INTERVAL` is driven by the pipeline composition root.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::error::{RegistryError, Result};
use crate::registry::RuleRegistry;
use crate::schema::{Rule, RuleFile};

/// Outcome of loading a single file.
#[derive(Debug)]
pub struct LoadResult {
    pub path: PathBuf,
    pub status: LoadStatus,
}

#[derive(Debug)]
pub enum LoadStatus {
    Loaded { rule_count: usize },
    Skipped { reason: String },
    Failed { error: String },
}

/// Filesystem rule loader bound to a registry.
pub struct RuleLoader {
    rules_dir: PathBuf,
    registry: Arc<RuleRegistry>,
    /// Active filesystem watcher (held to keep it alive).
    _watcher: Option<RecommendedWatcher>,
}

impl RuleLoader {
    /// Create a loader for the given directory, creating it if missing.
    pub fn new(rules_dir: PathBuf, registry: Arc<RuleRegistry>) -> Self {
        if !rules_dir.exists() {
            if let Err(e) = fs::create_dir_all(&rules_dir) {
                warn!(path = %rules_dir.display(), error = %e, "failed to create rules directory");
            }
        }
        Self {
            rules_dir,
            registry,
            _watcher: None,
        }
    }

    pub fn rules_dir(&self) -> &Path {
        &self.rules_dir
    }

    /// Scan the directory, parse every rule file, and publish the combined
    /// set to the registry.
    ///
    /// Per-file parse errors are reported in the results and do not abort
    /// the scan; a mandatory-rule compile failure aborts the publication
    /// wholesale (the prior snapshot stays in force).
    pub fn reload(&self) -> Result<Vec<LoadResult>> {
        let mut results = Vec::new();
        let mut rules: HashMap<String, Rule> = HashMap::new();
        self.scan_dir_recursive(&self.rules_dir, &mut results, &mut rules)?;

        let combined: Vec<Rule> = rules.into_values().collect();
        let rule_count = combined.len();
        let version = self.registry.load_from(combined)?;
        info!(
            registry_version = version,
            rule_count,
            files = results.len(),
            "rules directory loaded"
        );
        Ok(results)
    }

    fn scan_dir_recursive(
        &self,
        dir: &Path,
        results: &mut Vec<LoadResult>,
        rules: &mut HashMap<String, Rule>,
    ) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "failed to read directory");
                return Ok(());
            }
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();

            // Skip dotfiles/dotdirs
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.starts_with('.') {
                    continue;
                }
            }

            if path.is_dir() {
                self.scan_dir_recursive(&path, results, rules)?;
                continue;
            }

            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yml" || e == "yaml")
                .unwrap_or(false);
            if !is_yaml {
                results.push(LoadResult {
                    path,
                    status: LoadStatus::Skipped {
                        reason: "not a YAML file".to_string(),
                    },
                });
                continue;
            }

            match Self::parse_file(&path) {
                Ok(file) => {
                    let mut count = 0;
                    for rule in file.rules {
                        if rules.contains_key(&rule.id) {
                            warn!(rule_id = %rule.id, path = %path.display(), "duplicate rule id, keeping first occurrence");
                            continue;
                        }
                        rules.insert(rule.id.clone(), rule);
                        count += 1;
                    }
                    results.push(LoadResult {
                        path,
                        status: LoadStatus::Loaded { rule_count: count },
                    });
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse rule file");
                    results.push(LoadResult {
                        path,
                        status: LoadStatus::Failed {
                            error: e.to_string(),
                        },
                    });
                }
            }
        }
        Ok(())
    }

    /// Parse a single YAML rule file. Unknown fields are rejected.
    pub fn parse_file(path: &Path) -> Result<RuleFile> {
        let contents = fs::read_to_string(path)?;
        let file: RuleFile = serde_yaml::from_str(&contents)?;
        if file.version.is_empty() {
            return Err(RegistryError::Validation(
                "rule file version must not be empty".to_string(),
            ));
        }
        Ok(file)
    }

    /// Start a filesystem watcher that re-scans the directory on any
    /// create/modify/delete of a rule file.
    ///
    /// Reload errors are logged; the previous snapshot stays in force.
    pub fn watch(&mut self) -> Result<()> {
        let rules_dir = self.rules_dir.clone();
        let registry = Arc::clone(&self.registry);
        let watch_dir = rules_dir.clone();

        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if !event_touches_rules(&event) {
                        return;
                    }
                    let loader = RuleLoader {
                        rules_dir: rules_dir.clone(),
                        registry: Arc::clone(&registry),
                        _watcher: None,
                    };
                    if let Err(e) = loader.reload() {
                        warn!(error = %e, "hot-reload rejected — prior snapshot remains in force");
                    }
                }
                Err(e) => warn!(error = %e, "filesystem watcher error"),
            },
        )?;

        watcher.watch(&watch_dir, RecursiveMode::Recursive)?;
        let _ = watcher
            .configure(notify::Config::default().with_poll_interval(Duration::from_millis(500)));

        info!(path = %watch_dir.display(), "watching rules directory for changes (recursive)");
        self._watcher = Some(watcher);
        Ok(())
    }

    /// Atomically write a rule as a YAML file into the rules directory.
    pub fn write_rule(&self, rule: &Rule) -> Result<PathBuf> {
        Self::write_rule_file(&self.rules_dir, rule)
    }

    /// Atomically write a rule as a YAML file into `dir`.
    ///
    /// Writes to a `.tmp` file first, then renames to the final path to
    /// avoid partial writes on crash. Used by the dynamic-injection channel
    /// so a restart reconverges on the injected rule set.
    pub fn write_rule_file(dir: &Path, rule: &Rule) -> Result<PathBuf> {
        let file = RuleFile {
            version: "1".to_string(),
            rules: vec![rule.clone()],
        };
        let final_path = dir.join(format!("{}.yml", rule.id));
        let tmp_path = dir.join(format!(".{}.tmp", rule.id));

        let yaml = serde_yaml::to_string(&file)?;
        fs::write(&tmp_path, yaml)?;
        fs::rename(&tmp_path, &final_path)?;

        info!(rule_id = %rule.id, path = %final_path.display(), "wrote rule file");
        Ok(final_path)
    }
}

/// Whether a filesystem event is relevant to rule loading.
fn event_touches_rules(event: &notify::Event) -> bool {
    use notify::EventKind;
    if !matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) {
        return false;
    }
    event.paths.iter().any(|p| {
        let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name.starts_with('.') {
            return false;
        }
        p.extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yml" || e == "yaml")
            .unwrap_or(false)
    })
}
