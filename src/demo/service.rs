//! Demo answers: streamed straight from the model, outside the relay.

use futures_util::stream::{self, Stream};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::registry::{DemoMessage, DemoRegistry};
use crate::chat::IndentNormalizer;
use crate::chat::prompt::answer_prompt;
use crate::config::Config;
use crate::providers::{ChatModel, RetrievalFilter, Retriever};
use crate::relay::RelayEvent;
use crate::sessions::window_history;

/// User id demo retrievals are filtered on.
pub const DEMO_USER_ID: &str = "demo-user";

struct DemoInner {
    registry: Arc<DemoRegistry>,
    model: Arc<dyn ChatModel>,
    retriever: Arc<dyn Retriever>,
    secret: Option<String>,
    dequeue_timeout: Duration,
    max_words: usize,
    min_messages: usize,
    max_messages: usize,
    retrieval_k: usize,
    retrieval_mode: String,
}

#[derive(Clone)]
pub struct DemoService {
    inner: Arc<DemoInner>,
}

impl DemoService {
    pub fn new(
        registry: Arc<DemoRegistry>,
        model: Arc<dyn ChatModel>,
        retriever: Arc<dyn Retriever>,
        config: &Config,
    ) -> Self {
        Self {
            inner: Arc::new(DemoInner {
                registry,
                model,
                retriever,
                secret: config.demo.secret.clone().filter(|s| !s.is_empty()),
                dequeue_timeout: Duration::from_secs(config.demo.dequeue_timeout_secs),
                max_words: config.history.max_words,
                min_messages: config.history.min_messages,
                max_messages: config.history.max_messages,
                retrieval_k: config.provider.retrieval_k,
                retrieval_mode: config.provider.retrieval_mode.clone(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<DemoRegistry> {
        &self.inner.registry
    }

    /// Constant-time comparison against the configured secret. With no secret
    /// configured, demo mode is closed.
    pub fn check_secret(&self, presented: &str) -> bool {
        let Some(expected) = self.inner.secret.as_deref() else {
            return false;
        };
        let (a, b) = (expected.as_bytes(), presented.as_bytes());
        a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }

    pub fn send(&self, session_id: &str, message: DemoMessage) {
        tracing::info!(session_id, pdf_id = %message.pdf_id, "Demo message queued");
        self.inner.registry.enqueue(session_id, message);
    }

    /// Wait for the next queued question and stream its answer.
    ///
    /// Yields chunk events followed by exactly one terminal event. A timeout
    /// while waiting yields a single error event.
    pub fn answer(&self, session_id: String) -> impl Stream<Item = RelayEvent> + Send {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { produce(inner, session_id, tx).await });

        stream::unfold(rx, |mut rx| async move {
            let event = rx.recv().await?;
            Some((event, rx))
        })
    }
}

async fn produce(inner: Arc<DemoInner>, session_id: String, events: mpsc::UnboundedSender<RelayEvent>) {
    let Some(question) = inner
        .registry
        .dequeue(&session_id, inner.dequeue_timeout)
        .await
    else {
        tracing::warn!(session_id = %session_id, "Timed out waiting for demo message");
        let _ = events.send(RelayEvent::Error("Timeout waiting for message".into()));
        return;
    };

    let filter = RetrievalFilter {
        user_id: DEMO_USER_ID.into(),
        pdf_id: question.pdf_id.clone(),
    };
    let documents = match inner
        .retriever
        .retrieve(&question.message, &filter, &inner.retrieval_mode, inner.retrieval_k)
        .await
    {
        Ok(documents) => documents,
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Demo retrieval failed");
            let _ = events.send(RelayEvent::Error("Internal server error".into()));
            return;
        }
    };

    let history = inner.registry.history(&session_id);
    let window = window_history(
        &history,
        inner.max_messages,
        inner.max_words,
        inner.min_messages,
    );
    let prompt = answer_prompt(&window, &documents, &question.message);

    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<String>();
    let forward = async {
        let mut normalizer = IndentNormalizer::new();
        let mut answer = String::new();
        while let Some(raw) = raw_rx.recv().await {
            let chunk = normalizer.push(&raw);
            if chunk.is_empty() {
                continue;
            }
            answer.push_str(&chunk);
            let _ = events.send(RelayEvent::Chunk(chunk));
        }
        answer
    };
    let (streamed, answer) = tokio::join!(inner.model.stream(&prompt, raw_tx), forward);

    match streamed {
        Ok(_) => {
            inner
                .registry
                .record_exchange(&session_id, &question.pdf_id, &question.message, &answer);
            tracing::info!(session_id = %session_id, "Demo answer streamed");
            let _ = events.send(RelayEvent::End);
        }
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Demo model stream failed");
            let _ = events.send(RelayEvent::Error("Internal server error".into()));
        }
    }
}
