use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::traits::PeriodicJob;

/// Drive `job` until `shutdown` flips to `true` (or its sender is dropped).
///
/// Ticks run back to back with the job's interval in between, so two sweeps of
/// the same job never overlap.
pub async fn run_job(job: Arc<dyn PeriodicJob>, mut shutdown: watch::Receiver<bool>) {
    tracing::info!(job = job.name(), interval_secs = job.interval().as_secs(), "Periodic job started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let delay = match job.tick().await {
            Ok(report) => {
                if report.acted > 0 || report.failed > 0 {
                    tracing::info!(
                        job = job.name(),
                        examined = report.examined,
                        acted = report.acted,
                        failed = report.failed,
                        "Periodic job sweep finished"
                    );
                } else {
                    tracing::debug!(job = job.name(), examined = report.examined, "Periodic job sweep idle");
                }
                job.interval()
            }
            Err(e) => {
                tracing::warn!(job = job.name(), error = %e, "Periodic job sweep failed; retrying");
                job.retry_interval()
            }
        };

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!(job = job.name(), "Periodic job stopped");
}

pub fn spawn_job(job: Arc<dyn PeriodicJob>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(run_job(job, shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::traits::TickReport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingJob {
        ticks: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl PeriodicJob for CountingJob {
        async fn tick(&self) -> anyhow::Result<TickReport> {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                anyhow::bail!("store offline");
            }
            Ok(TickReport::new(1, 0, 0))
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(20)
        }

        fn retry_interval(&self) -> Duration {
            Duration::from_secs(10)
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_on_interval_until_shutdown() {
        let job = Arc::new(CountingJob {
            ticks: AtomicUsize::new(0),
            fail_first: false,
        });
        let (tx, rx) = watch::channel(false);
        let handle = spawn_job(job.clone(), rx);

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(job.ticks.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(job.ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tick_uses_retry_interval() {
        let job = Arc::new(CountingJob {
            ticks: AtomicUsize::new(0),
            fail_first: true,
        });
        let (tx, rx) = watch::channel(false);
        let handle = spawn_job(job.clone(), rx);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(job.ticks.load(Ordering::SeqCst), 2);

        drop(tx);
        handle.await.unwrap();
    }
}
