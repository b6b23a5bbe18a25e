//! Reclaims `session_last_flush:*` keys once they age past the retention window.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::traits::{PeriodicJob, TickReport};
use crate::config::SessionsConfig;
use crate::observability::Metrics;
use crate::sessions::{keys, Clock};
use crate::storage::FastStore;

pub struct StaleKeyReaper {
    fast: Arc<dyn FastStore>,
    clock: Arc<dyn Clock>,
    retention_secs: i64,
    interval: Duration,
    retry: Duration,
    metrics: Metrics,
}

impl StaleKeyReaper {
    pub fn new(
        fast: Arc<dyn FastStore>,
        clock: Arc<dyn Clock>,
        config: &SessionsConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            fast,
            clock,
            retention_secs: i64::try_from(config.last_flush_retention_secs).unwrap_or(i64::MAX),
            interval: Duration::from_secs(config.reaper_interval_secs),
            retry: Duration::from_secs(config.reaper_retry_secs),
            metrics,
        }
    }
}

#[async_trait]
impl PeriodicJob for StaleKeyReaper {
    async fn tick(&self) -> anyhow::Result<TickReport> {
        self.fast.ping().await?;
        let candidates = self.fast.scan_prefix(keys::LAST_FLUSH_PREFIX).await?;
        if candidates.is_empty() {
            return Ok(TickReport::new(0, 0, 0));
        }

        let cutoff = self.clock.now_secs().saturating_sub(self.retention_secs);
        let values = self.fast.mget(&candidates).await?;

        // Missing or non-integer marks count as epoch 0, i.e. stale.
        let stale: Vec<String> = candidates
            .iter()
            .zip(values)
            .filter(|(_, value)| {
                let mark = value
                    .as_deref()
                    .and_then(|v| v.trim().parse::<i64>().ok())
                    .unwrap_or(0);
                mark < cutoff
            })
            .map(|(key, _)| key.clone())
            .collect();

        let deleted = if stale.is_empty() {
            0
        } else {
            self.fast.delete(&stale).await?
        };
        self.metrics.reaped_keys.inc_by(deleted as u64);
        if deleted > 0 {
            tracing::info!(deleted, scanned = candidates.len(), "Stale last-flush keys reaped");
        }

        Ok(TickReport::new(candidates.len(), deleted, 0))
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn retry_interval(&self) -> Duration {
        self.retry
    }

    fn name(&self) -> &str {
        "reaper"
    }
}
