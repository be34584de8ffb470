use std::fs;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::transfer::{RetryPolicy, WorkerConfig};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// When false, the engine's per-attempt debug spans are filtered out
    #[serde(default = "default_true")]
    pub enable_tracing: bool,
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// PostgreSQL connection URL; in-memory stores are used when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub postgres_max_connections: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LedgerConfig {
    /// Minor-unit resolution of the ledger currency (2 for cents)
    pub currency_decimals: u32,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Terminal outcomes kept in memory for hot replays; older keys replay
    /// from the ledger store
    #[serde(default = "default_idempotency_cache_size")]
    pub idempotency_cache_size: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            currency_decimals: 2,
            retry: RetryConfig::default(),
            recovery: RecoveryConfig::default(),
            idempotency_cache_size: default_idempotency_cache_size(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 2,
            max_delay_ms: 100,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecoveryConfig {
    pub scan_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub batch_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            stale_threshold_secs: 60,
            batch_size: 100,
        }
    }
}

impl RecoveryConfig {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            scan_interval: Duration::from_secs(self.scan_interval_secs),
            stale_threshold: Duration::from_secs(self.stale_threshold_secs),
            batch_size: self.batch_size,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    20
}

fn default_idempotency_cache_size() -> usize {
    crate::transfer::DEFAULT_OUTCOME_CAPACITY
}

impl AppConfig {
    pub fn load(env: &str) -> Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid config: {}", config_path))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: AppConfig =
            serde_yaml::from_str(content).context("Failed to parse config yaml")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let ledger = &self.ledger;
        if ledger.retry.max_attempts == 0 {
            bail!("ledger.retry.max_attempts must be at least 1");
        }
        if ledger.retry.max_delay_ms < ledger.retry.base_delay_ms {
            bail!("ledger.retry.max_delay_ms must not be below base_delay_ms");
        }
        if ledger.recovery.batch_size == 0 {
            bail!("ledger.recovery.batch_size must be at least 1");
        }
        if ledger.idempotency_cache_size == 0 {
            bail!("ledger.idempotency_cache_size must be at least 1");
        }
        if ledger.recovery.scan_interval_secs == 0 {
            bail!("ledger.recovery.scan_interval_secs must be at least 1");
        }
        if ledger.currency_decimals > 18 {
            bail!("ledger.currency_decimals must be at most 18");
        }
        if !matches!(self.rotation.as_str(), "never" | "hourly" | "daily") {
            bail!("rotation must be one of never, hourly, daily");
        }

        let worst_case = ledger.retry.policy().worst_case();
        if Duration::from_secs(ledger.recovery.stale_threshold_secs) <= worst_case {
            tracing::warn!(
                stale_threshold_secs = ledger.recovery.stale_threshold_secs,
                retry_worst_case_ms = worst_case.as_millis() as u64,
                "Recovery may discard transfers that are still retrying"
            );
        }
        Ok(())
    }
}
