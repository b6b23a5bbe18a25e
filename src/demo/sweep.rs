use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::registry::DemoRegistry;
use crate::config::DemoConfig;
use crate::infra::{PeriodicJob, TickReport};

/// Evicts demo sessions that have been idle past the session timeout.
pub struct DemoSweeper {
    registry: Arc<DemoRegistry>,
    timeout_secs: u64,
    interval: Duration,
}

impl DemoSweeper {
    pub fn new(registry: Arc<DemoRegistry>, config: &DemoConfig) -> Self {
        Self {
            registry,
            timeout_secs: config.session_timeout_secs,
            interval: Duration::from_secs(config.sweep_interval_secs),
        }
    }
}

#[async_trait]
impl PeriodicJob for DemoSweeper {
    async fn tick(&self) -> anyhow::Result<TickReport> {
        let examined = self.registry.len();
        let evicted = self.registry.evict_inactive(self.timeout_secs);
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), sessions = ?evicted, "Inactive demo sessions evicted");
        }
        Ok(TickReport::new(examined, evicted.len(), 0))
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn name(&self) -> &str {
        "demo_sweep"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::DemoMessage;
    use crate::sessions::ManualClock;

    #[tokio::test]
    async fn tick_evicts_idle_sessions() {
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = Arc::new(DemoRegistry::new(clock.clone()));
        registry.enqueue(
            "d1",
            DemoMessage {
                message: "q".into(),
                pdf_id: "p".into(),
            },
        );
        let sweeper = DemoSweeper::new(registry.clone(), &DemoConfig::default());

        let report = sweeper.tick().await.unwrap();
        assert_eq!((report.examined, report.acted), (1, 0));

        clock.advance(301);
        let report = sweeper.tick().await.unwrap();
        assert_eq!((report.examined, report.acted), (1, 1));
        assert!(registry.is_empty());
        assert_eq!(sweeper.interval(), Duration::from_secs(60));
    }
}
