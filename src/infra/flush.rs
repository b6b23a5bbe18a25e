//! Write-behind flush scheduler.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::traits::{PeriodicJob, TickReport};
use crate::config::SessionsConfig;
use crate::observability::Metrics;
use crate::sessions::{FlushPolicy, SessionCoordinator};

/// Sweeps `active_sessions` and commits every session the [`FlushPolicy`]
/// marks as due. Sessions are processed one at a time; a failing session is
/// logged and left active for the next sweep.
pub struct FlushScheduler {
    coordinator: Arc<SessionCoordinator>,
    policy: FlushPolicy,
    interval: Duration,
    retry: Duration,
    metrics: Metrics,
}

impl FlushScheduler {
    pub fn new(coordinator: Arc<SessionCoordinator>, config: &SessionsConfig, metrics: Metrics) -> Self {
        Self {
            coordinator,
            policy: FlushPolicy::from(config),
            interval: Duration::from_secs(config.flush_interval_secs),
            retry: Duration::from_secs(config.flush_retry_secs),
            metrics,
        }
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    /// Commit every active session regardless of policy. Run once at shutdown,
    /// since the in-process fast tier does not outlive the process.
    pub async fn drain(&self) -> anyhow::Result<TickReport> {
        let sessions = self.coordinator.active_sessions().await?;
        let mut flushed = 0;
        let mut failed = 0;
        for session_id in &sessions {
            if self.commit(session_id, "shutdown").await {
                flushed += 1;
            } else {
                failed += 1;
            }
        }
        Ok(TickReport::new(sessions.len(), flushed, failed))
    }

    async fn commit(&self, session_id: &str, reason: &str) -> bool {
        match self.coordinator.commit_flush(session_id).await {
            Ok(outcome) => {
                self.metrics
                    .flush_outcomes
                    .with_label_values(&[outcome.kind()])
                    .inc();
                self.metrics
                    .flushed_messages
                    .inc_by(outcome.messages_written() as u64);
                tracing::info!(
                    session_id,
                    reason,
                    outcome = outcome.kind(),
                    messages = outcome.messages_written(),
                    "Session flushed"
                );
                true
            }
            Err(e) => {
                tracing::warn!(
                    session_id,
                    reason,
                    error = %e,
                    "Session flush failed; left active"
                );
                self.metrics.flush_failures.inc();
                false
            }
        }
    }
}

#[async_trait]
impl PeriodicJob for FlushScheduler {
    async fn tick(&self) -> anyhow::Result<TickReport> {
        self.coordinator.fast_store().ping().await?;
        let sessions = self.coordinator.active_sessions().await?;
        self.metrics
            .active_sessions
            .set(i64::try_from(sessions.len()).unwrap_or(i64::MAX));

        let now = self.coordinator.clock().now_secs();
        let mut flushed = 0;
        let mut failed = 0;

        for session_id in &sessions {
            let state = match self.coordinator.pending_state(session_id).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Flush check failed; will retry");
                    self.metrics.flush_failures.inc();
                    failed += 1;
                    continue;
                }
            };

            let decision = self.policy.evaluate(&state, now);
            if !decision.should_flush() {
                continue;
            }

            if self.commit(session_id, decision.as_str()).await {
                flushed += 1;
            } else {
                failed += 1;
            }
        }

        Ok(TickReport::new(sessions.len(), flushed, failed))
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn retry_interval(&self) -> Duration {
        self.retry
    }

    fn name(&self) -> &str {
        "flush"
    }
}
