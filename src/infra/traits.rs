use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Summary of one periodic job sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickReport {
    /// Items looked at this sweep (sessions, keys, demo entries).
    pub examined: usize,
    /// Items acted on (flushed, deleted, evicted).
    pub acted: usize,
    /// Items that failed and were left for the next sweep.
    pub failed: usize,
    pub checked_at: DateTime<Utc>,
}

impl TickReport {
    pub fn new(examined: usize, acted: usize, failed: usize) -> Self {
        Self {
            examined,
            acted,
            failed,
            checked_at: Utc::now(),
        }
    }
}

/// A background job run on a fixed interval until shutdown.
///
/// A tick that returns `Err` is retried after [`PeriodicJob::retry_interval`]
/// instead of the regular interval. Per-item failures belong in
/// [`TickReport::failed`], not in `Err`.
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    async fn tick(&self) -> anyhow::Result<TickReport>;
    fn interval(&self) -> Duration;
    fn retry_interval(&self) -> Duration {
        self.interval()
    }
    fn name(&self) -> &str;
}
