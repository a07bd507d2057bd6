//! rules-watch — validate a rules directory and optionally watch it.
//!
//! Loads every rule file, reports per-file status and the compiled
//! severity distribution, then (with `--watch`) keeps re-publishing
//! snapshots as files change. Useful for authoring rules locally before
//! they reach a serving deployment.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use guardian_rules::{LoadStatus, RuleLoader, RuleRegistry};

/// Rule directory validator and hot-reload watcher.
#[derive(Parser, Debug)]
#[command(name = "rules-watch", version, about)]
struct Cli {
    /// Directory containing rule YAML files.
    #[arg(long, env = "GUARDIAN_RULES_DIR", default_value = "data/rules")]
    rules_dir: PathBuf,

    /// Keep watching for changes instead of exiting after validation.
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let registry = Arc::new(RuleRegistry::new());
    let mut loader = RuleLoader::new(cli.rules_dir.clone(), Arc::clone(&registry));

    let results = loader.reload()?;
    let mut loaded = 0usize;
    let mut failed = 0usize;
    for result in &results {
        match &result.status {
            LoadStatus::Loaded { rule_count } => {
                loaded += rule_count;
                info!(path = %result.path.display(), rules = rule_count, "loaded");
            }
            LoadStatus::Skipped { reason } => {
                info!(path = %result.path.display(), reason = %reason, "skipped");
            }
            LoadStatus::Failed { error } => {
                failed += 1;
                tracing::error!(path = %result.path.display(), error = %error, "failed");
            }
        }
    }

    let snapshot = registry.current();
    let mut counts: Vec<(String, usize)> = snapshot
        .severity_counts()
        .into_iter()
        .map(|(severity, count)| (severity.to_string(), count))
        .collect();
    counts.sort();
    info!(
        registry_version = snapshot.registry_version,
        rules = loaded,
        failed_files = failed,
        severity_counts = ?counts,
        content_hash = %snapshot.content_hash,
        "rules directory validated"
    );

    if failed > 0 && !cli.watch {
        anyhow::bail!("{} rule file(s) failed to parse", failed);
    }

    if cli.watch {
        loader.watch()?;
        info!(path = %cli.rules_dir.display(), "watching for changes (ctrl-c to exit)");
        tokio::signal::ctrl_c().await?;
        info!("rules-watch exiting");
    }

    Ok(())
}
