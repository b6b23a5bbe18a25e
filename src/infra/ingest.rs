//! Drains `pdf_ingestion_queue` and hands each task to the ingestion service.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::traits::{PeriodicJob, TickReport};
use crate::config::IngestionConfig;
use crate::observability::Metrics;
use crate::sessions::keys;
use crate::storage::FastStore;

/// One queued request to index a PDF for retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionTask {
    #[serde(rename = "pdfId")]
    pub pdf_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
}

impl IngestionTask {
    pub fn new(pdf_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            pdf_id: pdf_id.into(),
            user_id: user_id.into(),
        }
    }

    /// Queue wire form: `{"pdfId": .., "userId": ..}`.
    pub fn to_payload(&self) -> String {
        serde_json::json!({ "pdfId": self.pdf_id, "userId": self.user_id }).to_string()
    }

    pub fn from_payload(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Whatever turns a queued task into indexed documents.
#[async_trait]
pub trait PdfIngestor: Send + Sync {
    async fn ingest(&self, task: &IngestionTask) -> anyhow::Result<()>;
    fn name(&self) -> &str;
}

/// Posts each task as JSON to an external ingestion service.
pub struct WebhookIngestor {
    endpoint: String,
    client: Client,
}

impl WebhookIngestor {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }
}

#[async_trait]
impl PdfIngestor for WebhookIngestor {
    async fn ingest(&self, task: &IngestionTask) -> anyhow::Result<()> {
        let response = self.client.post(&self.endpoint).json(task).send().await?;
        if !response.status().is_success() {
            return Err(crate::providers::api_error("ingestion", response).await);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// Pops up to `batch_limit` tasks per tick, oldest first. A failed hand-off
/// puts the task back on the queue and ends the tick, so an unreachable
/// service is retried on the next tick instead of in a tight loop.
pub struct IngestionWorker {
    fast: Arc<dyn FastStore>,
    ingestor: Arc<dyn PdfIngestor>,
    batch_limit: usize,
    interval: Duration,
    retry: Duration,
    metrics: Metrics,
}

impl IngestionWorker {
    pub fn new(
        fast: Arc<dyn FastStore>,
        ingestor: Arc<dyn PdfIngestor>,
        config: &IngestionConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            fast,
            ingestor,
            batch_limit: config.batch_limit.max(1),
            interval: Duration::from_secs(config.poll_interval_secs),
            retry: Duration::from_secs(config.retry_secs),
            metrics,
        }
    }

    fn count(&self, outcome: &str) {
        self.metrics
            .ingestion_tasks
            .with_label_values(&[outcome])
            .inc();
    }
}

/// Build the worker for the configured endpoint, or `None` when ingestion
/// hand-off is disabled.
pub fn create_ingestion_worker(
    config: &IngestionConfig,
    fast: Arc<dyn FastStore>,
    metrics: Metrics,
) -> Option<IngestionWorker> {
    let endpoint = config.endpoint()?;
    let ingestor = WebhookIngestor::new(endpoint, Duration::from_secs(config.request_timeout_secs));
    tracing::info!(endpoint, "PDF ingestion hand-off enabled");
    Some(IngestionWorker::new(fast, Arc::new(ingestor), config, metrics))
}

#[async_trait]
impl PeriodicJob for IngestionWorker {
    async fn tick(&self) -> anyhow::Result<TickReport> {
        let mut examined = 0;
        let mut handed_off = 0;
        let mut failed = 0;

        while examined < self.batch_limit {
            let Some(raw) = self.fast.rpop(keys::PDF_INGESTION_QUEUE).await? else {
                break;
            };
            examined += 1;

            let task = match IngestionTask::from_payload(&raw) {
                Ok(task) => task,
                Err(e) => {
                    tracing::warn!(payload = %raw, error = %e, "Dropping malformed ingestion task");
                    self.count("malformed");
                    failed += 1;
                    continue;
                }
            };

            match self.ingestor.ingest(&task).await {
                Ok(()) => {
                    tracing::info!(
                        pdf_id = %task.pdf_id,
                        user_id = %task.user_id,
                        ingestor = self.ingestor.name(),
                        "PDF ingestion task handed off"
                    );
                    self.count("handed_off");
                    handed_off += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        pdf_id = %task.pdf_id,
                        error = %e,
                        "PDF ingestion hand-off failed; task requeued"
                    );
                    self.count("requeued");
                    failed += 1;
                    self.fast
                        .lpush(keys::PDF_INGESTION_QUEUE, &raw)
                        .await
                        .with_context(|| format!("failed to requeue ingestion task {raw}"))?;
                    break;
                }
            }
        }

        Ok(TickReport::new(examined, handed_off, failed))
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn retry_interval(&self) -> Duration {
        self.retry
    }

    fn name(&self) -> &str {
        "ingestion"
    }
}
