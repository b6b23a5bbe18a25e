//! Storage traits for the two session tiers.
//!
//! [`FastStore`] is a Redis-shaped key/value + set + list store that holds
//! in-flight session state. [`DurableStore`] is a document store that holds one
//! [`DurableRecord`] per chat session and accepts atomic per-batch writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sessions::types::Message;

/// Errors raised by either storage tier.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached or refused the operation.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// A document targeted by an update does not exist.
    #[error("document not found: {0}")]
    NotFound(String),
    /// A stored value is present but has the wrong shape.
    #[error("corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A single fast-tier mutation. A [`Pipeline`] of these is applied atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastOp {
    Set { key: String, value: String },
    Incr { key: String },
    Delete { keys: Vec<String> },
    SetAdd { set: String, member: String },
    SetRemove { set: String, member: String },
}

/// Ordered batch of fast-tier mutations, executed as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    ops: Vec<FastOp>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(FastOp::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn incr(mut self, key: impl Into<String>) -> Self {
        self.ops.push(FastOp::Incr { key: key.into() });
        self
    }

    pub fn delete<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ops.push(FastOp::Delete {
            keys: keys.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn sadd(mut self, set: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(FastOp::SetAdd {
            set: set.into(),
            member: member.into(),
        });
        self
    }

    pub fn srem(mut self, set: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(FastOp::SetRemove {
            set: set.into(),
            member: member.into(),
        });
        self
    }

    pub fn ops(&self) -> &[FastOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Low-latency mutable store for not-yet-durable session state.
///
/// Values are plain strings; keys live until explicitly deleted.
#[async_trait]
pub trait FastStore: Send + Sync {
    /// Cheap liveness probe used by background jobs before a sweep.
    async fn ping(&self) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Fetch several keys in one round trip. Missing keys yield `None` in place.
    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>>;

    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> StoreResult<usize>;

    async fn smembers(&self, set: &str) -> StoreResult<Vec<String>>;

    /// List every key beginning with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Push to the head of a list, returning the new length.
    async fn lpush(&self, list: &str, value: &str) -> StoreResult<usize>;

    /// Pop from the tail of a list.
    async fn rpop(&self, list: &str) -> StoreResult<Option<String>>;

    /// Apply every op in `pipeline` atomically, in order.
    async fn execute(&self, pipeline: Pipeline) -> StoreResult<()>;

    /// The name of this store implementation.
    fn name(&self) -> &str;
}

/// Permanent projection of a chat session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableRecord {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "latest_pdfId")]
    pub latest_pdf_id: String,
    pub title: Option<String>,
    pub chat_history: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DurableRecord {
    /// Timestamp of the last durably committed message, or 0 for an empty history.
    pub fn high_water_mark(&self) -> i64 {
        self.chat_history.last().map_or(0, |m| m.timestamp)
    }
}

/// Listing row for a user's sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub chat_session_id: String,
    pub title: Option<String>,
    #[serde(rename = "latest_pdfId")]
    pub latest_pdf_id: String,
    pub message_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// A single document mutation inside a [`DurableBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOp {
    /// Create or wholesale overwrite a document.
    Put { id: String, record: DurableRecord },
    /// Create the document only if it is missing. An existing document,
    /// including its title, is left as it is.
    CreateIfAbsent { id: String, record: DurableRecord },
    /// Union-append messages to the document's history. Messages already present
    /// are not duplicated.
    AppendHistory {
        id: String,
        messages: Vec<Message>,
        updated_at: DateTime<Utc>,
    },
    SetLatestPdf { id: String, pdf_id: String },
}

/// Ordered set of document writes committed atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DurableBatch {
    ops: Vec<DurableOp>,
}

impl DurableBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: DurableOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[DurableOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<DurableOp> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Authoritative document store surviving process restarts.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, id: &str) -> StoreResult<Option<DurableRecord>>;

    /// Create or overwrite a document outside of a batch.
    async fn put(&self, id: &str, record: &DurableRecord) -> StoreResult<()>;

    /// Update the title of an existing document. Fails with
    /// [`StoreError::NotFound`] when the document is missing.
    async fn update_title(&self, id: &str, title: &str, at: DateTime<Utc>) -> StoreResult<()>;

    /// Delete a document. Deleting a missing document is not an error.
    async fn delete(&self, id: &str) -> StoreResult<()>;

    /// Apply every op in `batch` atomically. Either all ops land or none do.
    async fn commit(&self, batch: DurableBatch) -> StoreResult<()>;

    /// Sessions owned by `user_id`, most recently updated first.
    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<SessionSummary>>;

    /// The name of this store implementation.
    fn name(&self) -> &str;
}
