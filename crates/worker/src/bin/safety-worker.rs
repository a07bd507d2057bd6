//! safety-worker — queue consumer for the safety enforcement pipeline.
//!
//! Claims admitted requests from the inference stream, runs the model and
//! post-check, and routes outputs to the response stream or escalation.
//! Scale out by running more processes with distinct `--consumer` names.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use guardian_audit::AuditStore;
use guardian_canary::CanarySubsystem;
use guardian_core::config::{load_dotenv, Config, LogConfig};
use guardian_engine::{EngineConfig, Guardian};
use guardian_escalation::{EscalationConfig, EscalationHandler};
use guardian_limiter::{AdaptiveRateLimiter, ShedControl, SuspensionStore};
use guardian_notify::{Dispatcher, Notifier, PagerNotifier, WebhookNotifier};
use guardian_queue::StreamBroker;
use guardian_risk::RiskScoreManager;
use guardian_rules::{RuleLoader, RuleRegistry};
use guardian_store::KvStore;
use guardian_worker::{
    HttpModelClient, InferenceWorker, ShutdownSignal, WorkerConfig, WorkerRunner,
    WorkerRunnerConfig,
};

// ── CLI ─────────────────────────────────────────────────────────────

/// Safety pipeline inference worker.
#[derive(Parser, Debug)]
#[command(name = "safety-worker", version, about)]
struct Cli {
    /// Unique consumer name within the worker group.
    #[arg(long, env = "WORKER_CONSUMER_NAME", default_value = "worker-0")]
    consumer: String,

    /// Health ping interval in seconds.
    #[arg(long, env = "WORKER_HEALTH_INTERVAL", default_value_t = 30)]
    health_interval: u64,
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log.level.clone()));
    if log.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

// ── Backend selection ───────────────────────────────────────────────

async fn connect_kv(config: &Config) -> anyhow::Result<Arc<dyn KvStore>> {
    if config.degraded_mode {
        return Ok(Arc::new(guardian_store::MemoryStore::new()));
    }
    let url = config.store.redis_url.as_deref().ok_or_else(|| {
        anyhow::anyhow!("REDIS_URL must be set (or SAFETY_DEGRADED_MODE=true for tests)")
    })?;
    #[cfg(feature = "store-redis")]
    {
        Ok(Arc::new(guardian_store::RedisStore::connect(url).await?))
    }
    #[cfg(not(feature = "store-redis"))]
    {
        let _ = url;
        anyhow::bail!("shared store backend requires the 'store-redis' cargo feature")
    }
}

async fn connect_broker(config: &Config) -> anyhow::Result<Arc<dyn StreamBroker>> {
    if config.degraded_mode {
        return Ok(Arc::new(guardian_queue::MemoryBroker::new()));
    }
    let url = config.store.redis_url.as_deref().ok_or_else(|| {
        anyhow::anyhow!("REDIS_URL must be set (or SAFETY_DEGRADED_MODE=true for tests)")
    })?;
    #[cfg(feature = "queue-redis")]
    {
        Ok(Arc::new(guardian_queue::RedisStreamBroker::connect(url).await?))
    }
    #[cfg(not(feature = "queue-redis"))]
    {
        let _ = url;
        anyhow::bail!("queue backend requires the 'queue-redis' cargo feature")
    }
}

async fn connect_audit(config: &Config) -> anyhow::Result<Arc<dyn AuditStore>> {
    if config.degraded_mode {
        return Ok(Arc::new(guardian_audit::MemoryAuditStore::new()));
    }
    let url = config.audit.database_url.as_deref().ok_or_else(|| {
        anyhow::anyhow!("DATABASE_URL must be set (or SAFETY_DEGRADED_MODE=true for tests)")
    })?;
    #[cfg(feature = "audit-postgres")]
    {
        Ok(Arc::new(guardian_audit::PgAuditStore::connect(url).await?))
    }
    #[cfg(not(feature = "audit-postgres"))]
    {
        let _ = url;
        anyhow::bail!("audit ledger backend requires the 'audit-postgres' cargo feature")
    }
}

/// Build notification channels from the environment. Missing configuration
/// degrades to log-only dispatch.
fn build_dispatcher() -> Dispatcher {
    let mut primary: Vec<Box<dyn Notifier>> = Vec::new();
    if let Ok(url) = std::env::var("NOTIFY_WEBHOOK_URL") {
        match WebhookNotifier::new(url, Default::default()) {
            Ok(notifier) => primary.push(Box::new(notifier)),
            Err(e) => tracing::warn!(error = %e, "webhook channel misconfigured, skipping"),
        }
    }
    let mut paging: Vec<Box<dyn Notifier>> = Vec::new();
    if let (Ok(url), Ok(key)) = (
        std::env::var("PAGER_EVENTS_URL"),
        std::env::var("PAGER_ROUTING_KEY"),
    ) {
        paging.push(Box::new(PagerNotifier::new(url, key)));
    }
    Dispatcher::new(primary, paging)
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let config = Config::from_env();
    init_tracing(&config.log);
    config.log_summary();

    let cli = Cli::parse();

    let kv = connect_kv(&config).await?;
    let broker = connect_broker(&config).await?;
    let audit = connect_audit(&config).await?;

    // Rules: load once (mandatory-rule failures are fatal at startup),
    // then watch for changes and poll at the configured interval.
    let registry = Arc::new(RuleRegistry::new());
    let mut loader = RuleLoader::new(config.guardian.rules_dir.clone(), Arc::clone(&registry));
    loader.reload()?;
    loader.watch()?;
    let reload_interval = Duration::from_secs(config.guardian.reload_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(reload_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = loader.reload() {
                tracing::warn!(error = %e, "periodic rule reload rejected");
            }
        }
    });

    let engine_config = EngineConfig {
        max_input_length: config.guardian.max_input_length,
        cache_size: config.guardian.cache_size,
        ..EngineConfig::default()
    };
    let guardian = Arc::new(Guardian::new(Arc::clone(&registry), engine_config));
    let cache_guardian = Arc::clone(&guardian);
    registry.subscribe(move |version| {
        info!(registry_version = version, "snapshot swapped, clearing evaluation cache");
        cache_guardian.invalidate_cache();
    });

    let risk = Arc::new(RiskScoreManager::new(Arc::clone(&kv)));
    let canary = Arc::new(CanarySubsystem::new(Arc::clone(&kv), Arc::clone(&risk)));
    let suspensions = Arc::new(SuspensionStore::new(Arc::clone(&kv)));
    let limiter = Arc::new(AdaptiveRateLimiter::new(
        Arc::clone(&kv),
        Arc::clone(&risk),
        Arc::new(ShedControl::new()),
    ));
    let escalation = Arc::new(EscalationHandler::new(
        Arc::clone(&audit),
        Arc::new(build_dispatcher()),
        limiter,
        Arc::clone(&suspensions),
        Arc::clone(&registry),
        Arc::clone(&kv),
        Arc::clone(&broker),
        EscalationConfig::default(),
    ));

    let model_url = config
        .model
        .api_url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("MODEL_API_URL must be set"))?;
    let model = Arc::new(HttpModelClient::new(
        model_url,
        Duration::from_secs(config.model.timeout_secs),
    )?);

    let worker_config = WorkerConfig {
        consumer_name: cli.consumer.clone(),
        model_retries: config.model.max_retries,
        ..WorkerConfig::default()
    };
    let worker = Arc::new(InferenceWorker::new(
        Arc::clone(&broker),
        guardian,
        canary,
        risk,
        suspensions,
        escalation,
        audit,
        model,
        None,
        kv,
        worker_config,
    ));

    let runner_config = WorkerRunnerConfig {
        name: cli.consumer,
        health_interval: Duration::from_secs(cli.health_interval),
    };
    let shutdown = Arc::new(ShutdownSignal::new());

    info!("safety-worker starting");
    WorkerRunner::run(worker, broker, runner_config, shutdown).await;
    info!("safety-worker exited cleanly");
    Ok(())
}
