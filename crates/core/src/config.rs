//! Environment-driven configuration for the safety pipeline.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::TrustTier;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env_opt(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Deployment environment name ("dev", "staging", "prod").
    pub environment: String,
    pub auth: AuthConfig,
    pub store: StoreConfig,
    pub audit: AuditConfig,
    pub model: ModelConfig,
    pub guardian: GuardianConfig,
    pub log: LogConfig,
    /// Test-only: substitute in-process stores for the shared backends.
    pub degraded_mode: bool,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env() -> Self {
        Self {
            environment: env_or("SAFETY_ENV", "dev"),
            auth: AuthConfig::from_env(),
            store: StoreConfig::from_env(),
            audit: AuditConfig::from_env(),
            model: ModelConfig::from_env(),
            guardian: GuardianConfig::from_env(),
            log: LogConfig::from_env(),
            degraded_mode: env_bool("SAFETY_DEGRADED_MODE", false),
        }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (env: {}):", self.environment);
        tracing::info!(
            "  auth:      jwt={}, api_keys={}",
            if self.auth.jwt_secret.is_some() { "set" } else { "(none)" },
            self.auth.api_keys.len()
        );
        tracing::info!(
            "  store:     redis={}",
            self.store.redis_url.as_deref().unwrap_or("(none)")
        );
        tracing::info!(
            "  audit:     database={}",
            if self.audit.database_url.is_some() { "set" } else { "(none)" }
        );
        tracing::info!(
            "  model:     url={}",
            self.model.api_url.as_deref().unwrap_or("(none)")
        );
        tracing::info!(
            "  guardian:  rules_dir={}, reload={}s, max_input={}, cache={}",
            self.guardian.rules_dir.display(),
            self.guardian.reload_interval_secs,
            self.guardian.max_input_length,
            self.guardian.cache_size
        );
        if self.degraded_mode {
            tracing::warn!("SAFETY_DEGRADED_MODE enabled — using in-process stores");
        }
    }

    /// Return a redacted view safe for diagnostics (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "environment": self.environment,
            "auth": {
                "jwt_configured": self.auth.jwt_secret.is_some(),
                "api_key_count": self.auth.api_keys.len(),
            },
            "store": { "redis_configured": self.store.redis_url.is_some() },
            "audit": { "database_configured": self.audit.database_url.is_some() },
            "model": { "api_url": self.model.api_url },
            "guardian": {
                "rules_dir": self.guardian.rules_dir,
                "reload_interval_secs": self.guardian.reload_interval_secs,
                "max_input_length": self.guardian.max_input_length,
                "cache_size": self.guardian.cache_size,
            },
            "degraded_mode": self.degraded_mode,
        })
    }
}

// ── Auth ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// JWT signing secret for the auth collaborator.
    pub jwt_secret: Option<String>,
    /// Static API key → tier map parsed from `SAFETY_API_KEYS`.
    pub api_keys: HashMap<String, TrustTier>,
}

impl AuthConfig {
    fn from_env() -> Self {
        Self {
            jwt_secret: env_opt("SAFETY_JWT_SECRET"),
            api_keys: parse_api_keys(&env_or("SAFETY_API_KEYS", "")),
        }
    }
}

/// Parse `key:tier,key:tier` pairs; entries with unknown tiers are dropped
/// with a warning.
fn parse_api_keys(raw: &str) -> HashMap<String, TrustTier> {
    let mut map = HashMap::new();
    for entry in raw.split(',').filter(|e| !e.trim().is_empty()) {
        match entry.split_once(':') {
            Some((key, tier_str)) => match TrustTier::parse(tier_str.trim()) {
                Some(tier) => {
                    map.insert(key.trim().to_string(), tier);
                }
                None => {
                    tracing::warn!(tier = %tier_str, "unknown tier in SAFETY_API_KEYS entry, skipping");
                }
            },
            None => {
                tracing::warn!("malformed SAFETY_API_KEYS entry (expected key:tier), skipping");
            }
        }
    }
    map
}

// ── Shared store ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// URL of the shared key-value / stream store.
    pub redis_url: Option<String>,
}

impl StoreConfig {
    fn from_env() -> Self {
        Self {
            redis_url: env_opt("REDIS_URL"),
        }
    }
}

// ── Audit ledger ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Durable audit store connection URL.
    pub database_url: Option<String>,
}

impl AuditConfig {
    fn from_env() -> Self {
        Self {
            database_url: env_opt("DATABASE_URL"),
        }
    }
}

// ── Model collaborator ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub api_url: Option<String>,
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
    /// Retry ceiling before routing to escalation as MODEL_UNAVAILABLE.
    pub max_retries: u32,
}

impl ModelConfig {
    fn from_env() -> Self {
        Self {
            api_url: env_opt("MODEL_API_URL"),
            timeout_secs: env_u64("MODEL_TIMEOUT_SECS", 60),
            max_retries: env_u64("MODEL_MAX_RETRIES", 3) as u32,
        }
    }
}

// ── Guardian engine ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianConfig {
    pub rules_dir: PathBuf,
    pub reload_interval_secs: u64,
    pub max_input_length: usize,
    pub cache_size: usize,
}

impl GuardianConfig {
    fn from_env() -> Self {
        Self {
            rules_dir: PathBuf::from(env_or("GUARDIAN_RULES_DIR", "data/rules")),
            reload_interval_secs: env_u64("GUARDIAN_RELOAD_INTERVAL", 60),
            max_input_length: env_usize("GUARDIAN_MAX_INPUT_LENGTH", 50_000),
            cache_size: env_usize("GUARDIAN_CACHE_SIZE", 10_000),
        }
    }
}

// ── Logging ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl LogConfig {
    fn from_env() -> Self {
        Self {
            level: env_or("SAFETY_LOG_LEVEL", "info"),
            json: env_bool("SAFETY_LOG_JSON", false),
        }
    }
}
