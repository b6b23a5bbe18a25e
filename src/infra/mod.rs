//! Background jobs: write-behind flushing, stale-key reaping and PDF
//! ingestion hand-off.

pub mod flush;
pub mod ingest;
pub mod reaper;
pub mod runner;
pub mod traits;

pub use flush::FlushScheduler;
pub use ingest::{
    create_ingestion_worker, IngestionTask, IngestionWorker, PdfIngestor, WebhookIngestor,
};
pub use reaper::StaleKeyReaper;
pub use runner::{run_job, spawn_job};
pub use traits::{PeriodicJob, TickReport};
