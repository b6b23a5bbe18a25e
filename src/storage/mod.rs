//! Storage tiers: a fast key/value tier for in-flight sessions and a durable
//! document tier for committed history.

pub mod in_memory;
pub mod sqlite;
pub mod traits;

use anyhow::Result;
use std::sync::Arc;

use crate::config::Config;

pub use in_memory::{InMemoryDurableStore, InMemoryFastStore};
pub use sqlite::SqliteDurableStore;
pub use traits::{
    DurableBatch, DurableOp, DurableRecord, DurableStore, FastOp, FastStore, Pipeline,
    SessionSummary, StoreError, StoreResult,
};

/// Create the fast tier.
pub fn create_fast_store() -> Arc<dyn FastStore> {
    Arc::new(InMemoryFastStore::new())
}

/// Create the durable tier selected by `[storage] durable_backend`.
pub async fn create_durable_store(config: &Config) -> Result<Arc<dyn DurableStore>> {
    match config.storage.durable_backend.as_str() {
        "memory" => {
            tracing::warn!("Durable backend is in-memory; history is lost on restart");
            Ok(Arc::new(InMemoryDurableStore::new()))
        }
        "sqlite" => Ok(Arc::new(
            SqliteDurableStore::open(config.sqlite_path()).await?,
        )),
        other => anyhow::bail!("unknown durable backend: {other}"),
    }
}
