//! Recovery Worker
//!
//! Background worker that resolves transfers left PENDING by crashed or
//! cancelled callers.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::engine::{RecoveryReport, TransferEngine};
use super::error::TransferError;

/// Configuration for the recovery worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to scan for stale transfers
    pub scan_interval: Duration,
    /// How long a transfer must sit in PENDING to be considered abandoned.
    /// Must exceed the engine's worst-case retry time.
    pub stale_threshold: Duration,
    /// Maximum transfers to process per scan
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

/// Recovery Worker
///
/// Periodically asks the engine to resolve stale PENDING records against the
/// account store's mutation journal.
pub struct RecoveryWorker {
    engine: Arc<TransferEngine>,
    config: WorkerConfig,
}

impl RecoveryWorker {
    pub fn new(engine: Arc<TransferEngine>, config: WorkerConfig) -> Self {
        if config.stale_threshold <= engine.retry_policy().worst_case() {
            warn!(
                stale_threshold_ms = config.stale_threshold.as_millis() as u64,
                retry_worst_case_ms = engine.retry_policy().worst_case().as_millis() as u64,
                "Stale threshold does not exceed worst-case retry time"
            );
        }
        Self { engine, config }
    }

    pub fn with_defaults(engine: Arc<TransferEngine>) -> Self {
        Self::new(engine, WorkerConfig::default())
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run the recovery loop forever
    pub async fn run(&self) -> ! {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            batch_size = self.config.batch_size,
            "Starting recovery worker"
        );

        loop {
            if let Err(e) = self.scan_and_recover().await {
                error!(error = %e, "Recovery scan failed");
            }

            tokio::time::sleep(self.config.scan_interval).await;
        }
    }

    /// Run a single scan and recovery cycle
    pub async fn scan_and_recover(&self) -> Result<RecoveryReport, TransferError> {
        let report = self
            .engine
            .recover_pending(self.config.stale_threshold, self.config.batch_size)
            .await?;

        if report.scanned == 0 {
            debug!("No stale transfers found");
            return Ok(report);
        }

        info!(
            scanned = report.scanned,
            completed = report.completed,
            discarded = report.discarded,
            errors = report.errors,
            "Recovery scan finished"
        );
        if report.scanned == self.config.batch_size {
            debug!("Batch full, more stale transfers may remain");
        }

        Ok(report)
    }
}
