//! Dead-letter garbage collector.

use std::sync::Arc;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;
use todoai_queue::{DeadLetterPurger, QueueError};

use crate::config::GcConfig;
use crate::error::WorkerResult;
use crate::metrics;
use crate::retry::OutageLog;

/// Periodically purges dead letters older than the retention window.
pub struct GarbageCollector {
    purger: Option<Arc<dyn DeadLetterPurger>>,
    config: GcConfig,
}

impl GarbageCollector {
    pub fn new(purger: Option<Arc<dyn DeadLetterPurger>>, config: GcConfig) -> Self {
        Self { purger, config }
    }

    /// One purge under the configured timeout. Without a purger this is a
    /// no-op returning zero.
    pub async fn run_once(&self) -> WorkerResult<u64> {
        let Some(purger) = &self.purger else {
            return Ok(0);
        };

        let purged = tokio::time::timeout(
            self.config.timeout,
            purger.purge_dead_letters(self.config.retention),
        )
        .await
        .map_err(|_| {
            QueueError::purge_failed(QueueError::timeout(self.config.timeout, "dead-letter purge"))
        })?
        .map_err(QueueError::purge_failed)?;

        metrics::record_dlq_purged(purged);
        Ok(purged)
    }

    /// Purge every `interval` until `cancel` fires. Failures are logged and
    /// the loop keeps going.
    pub async fn run(&self, cancel: CancellationToken) {
        if self.purger.is_none() {
            info!("No dead-letter purger configured, garbage collector idle");
            return;
        }
        info!(
            interval_secs = self.config.interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "Starting dead-letter garbage collector"
        );

        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut outage = OutageLog::new("dead_letter_gc", 3);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.run_once().await {
                Ok(purged) => {
                    outage.succeeded();
                    if purged > 0 {
                        info!(purged, "Purged stale dead letters");
                    }
                }
                Err(e) => outage.failed(&e),
            }
        }
        info!("Garbage collector stopped");
    }
}
