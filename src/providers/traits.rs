use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One message in a model prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// A chat completion backend.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Single-shot completion.
    async fn complete(&self, messages: &[ChatMessage]) -> anyhow::Result<String>;

    /// Stream the answer fragment by fragment into `tx`, returning the full text.
    /// May fail after some fragments were already sent.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        tx: mpsc::UnboundedSender<String>,
    ) -> anyhow::Result<String>;

    fn name(&self) -> &str;
}

/// Restricts retrieval to one user's PDF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalFilter {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "pdfId")]
    pub pdf_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub content: String,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub score: Option<f32>,
}

/// Vector-store search over ingested PDF chunks.
#[async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(
        &self,
        query: &str,
        filter: &RetrievalFilter,
        mode: &str,
        k: usize,
    ) -> anyhow::Result<Vec<RetrievedDocument>>;

    fn name(&self) -> &str;
}
