//! The chat send pipeline: session bootstrap, history windowing, human append
//! and a background producer that streams the model's answer to the relay.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::indent::IndentNormalizer;
use super::prompt::{answer_prompt, clean_title, title_prompt, FALLBACK_TITLE, PLACEHOLDER_TITLE};
use crate::config::Config;
use crate::infra::IngestionTask;
use crate::observability::Metrics;
use crate::providers::{ChatModel, RetrievalFilter, Retriever};
use crate::relay::{pump, BatchConfig, RelayHub, RelayMessage};
use crate::sessions::{
    keys, window_history, Message, Role, SessionCoordinator, SessionError, SessionResult,
};

/// Message shown to stream clients when the answer cannot be produced.
const UPSTREAM_FAILURE: &str = "The assistant could not complete this answer";

/// One user turn.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub session_id: String,
    pub user_id: String,
    pub pdf_id: String,
    pub message: String,
}

/// How a background answer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// The stream completed. `stored` is false when the AI message could not
    /// be appended afterwards.
    Completed { chunks: usize, stored: bool },
    /// Retrieval or the model failed; nothing was stored.
    Failed { reason: String },
}

/// Handles to the background work started by [`ChatService::send`].
#[derive(Debug)]
pub struct SendTicket {
    pub new_session: bool,
    /// Resolves to the title that was written, or `None` after all retries failed.
    pub title: Option<JoinHandle<Option<String>>>,
    pub response: JoinHandle<ResponseOutcome>,
}

/// Retry schedule for writing a generated title.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TitleRetry {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for TitleRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

struct ChatInner {
    coordinator: Arc<SessionCoordinator>,
    hub: RelayHub,
    model: Arc<dyn ChatModel>,
    retriever: Arc<dyn Retriever>,
    max_words: usize,
    min_messages: usize,
    max_messages: usize,
    batch: BatchConfig,
    retrieval_k: usize,
    retrieval_mode: String,
    title_retry: TitleRetry,
    metrics: Option<Metrics>,
}

impl ChatInner {
    fn count_append(&self, role: Role) {
        if let Some(metrics) = &self.metrics {
            metrics
                .messages_appended
                .with_label_values(&[role.as_str()])
                .inc();
        }
    }
}

#[derive(Clone)]
pub struct ChatService {
    inner: Arc<ChatInner>,
}

impl ChatService {
    pub fn new(
        coordinator: Arc<SessionCoordinator>,
        hub: RelayHub,
        model: Arc<dyn ChatModel>,
        retriever: Arc<dyn Retriever>,
        config: &Config,
    ) -> Self {
        Self {
            inner: Arc::new(ChatInner {
                coordinator,
                hub,
                model,
                retriever,
                max_words: config.history.max_words,
                min_messages: config.history.min_messages,
                max_messages: config.history.max_messages,
                batch: BatchConfig::from(&config.stream),
                retrieval_k: config.provider.retrieval_k,
                retrieval_mode: config.provider.retrieval_mode.clone(),
                title_retry: TitleRetry::default(),
                metrics: None,
            }),
        }
    }

    /// Builder-style setters; call before the service is shared.
    pub fn with_metrics(self, metrics: Metrics) -> Self {
        self.map_inner(|inner| inner.metrics = Some(metrics))
    }

    pub fn with_title_retry(self, retry: TitleRetry) -> Self {
        self.map_inner(|inner| inner.title_retry = retry)
    }

    fn map_inner(self, apply: impl FnOnce(&mut ChatInner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                apply(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(shared) => {
                tracing::warn!("ChatService already shared; builder setting ignored");
                Self { inner: shared }
            }
        }
    }

    pub fn coordinator(&self) -> &Arc<SessionCoordinator> {
        &self.inner.coordinator
    }

    pub fn hub(&self) -> &RelayHub {
        &self.inner.hub
    }

    /// Accept one user message and start answering it in the background.
    ///
    /// A session without a durable document is created first with a placeholder
    /// title, and a title is generated from this message in a separate task.
    /// The history window is taken before the human message is appended, so the
    /// question is never repeated inside its own context. A session already
    /// owned by another user is refused with [`SessionError::NotOwner`].
    pub async fn send(&self, request: SendRequest) -> SessionResult<SendTicket> {
        let inner = &self.inner;
        let SendRequest {
            session_id,
            user_id,
            pdf_id,
            message,
        } = request;

        let durable = inner.coordinator.durable_record(&session_id).await?;
        let owner = match &durable {
            Some(record) => Some(record.user_id.clone()),
            None => inner
                .coordinator
                .fast_record(&session_id)
                .await?
                .map(|record| record.user_id),
        };
        if owner.as_deref().is_some_and(|owner| owner != user_id) {
            tracing::warn!(session_id = %session_id, user_id = %user_id, "Send to another user's session refused");
            return Err(SessionError::NotOwner { session_id });
        }

        let new_session = durable.is_none();
        let title = if new_session {
            inner
                .coordinator
                .create_session(&session_id, &user_id, &pdf_id, PLACEHOLDER_TITLE)
                .await?;
            let task_inner = Arc::clone(inner);
            let (sid, first) = (session_id.clone(), message.clone());
            Some(tokio::spawn(async move {
                generate_title(task_inner, sid, first).await
            }))
        } else {
            None
        };

        let history = inner.coordinator.get_history(&session_id).await?;
        let window = window_history(
            &history,
            inner.max_messages,
            inner.max_words,
            inner.min_messages,
        );

        inner
            .coordinator
            .add_message(&session_id, &user_id, &pdf_id, Role::Human, &message)
            .await?;
        inner.count_append(Role::Human);

        tracing::info!(
            session_id = %session_id,
            user_id = %user_id,
            new_session,
            window = window.len(),
            "Chat message accepted"
        );

        let task_inner = Arc::clone(inner);
        let response = tokio::spawn(async move {
            respond(task_inner, session_id, user_id, pdf_id, message, window).await
        });

        Ok(SendTicket {
            new_session,
            title,
            response,
        })
    }

    /// Queue a PDF for the ingestion worker.
    pub async fn enqueue_pdf_ingestion(&self, pdf_id: &str, user_id: &str) -> SessionResult<usize> {
        let task = IngestionTask::new(pdf_id, user_id).to_payload();
        let depth = self
            .inner
            .coordinator
            .fast_store()
            .lpush(keys::PDF_INGESTION_QUEUE, &task)
            .await?;
        tracing::info!(pdf_id, user_id, depth, "PDF ingestion task queued");
        Ok(depth)
    }
}

async fn generate_title(inner: Arc<ChatInner>, session_id: String, first_message: String) -> Option<String> {
    let title = match inner.model.complete(&title_prompt(&first_message)).await {
        Ok(raw) => clean_title(&raw),
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "Title generation failed");
            FALLBACK_TITLE.to_string()
        }
    };

    let retry = inner.title_retry;
    let mut delay = retry.base_delay;
    for attempt in 1..=retry.attempts.max(1) {
        match inner.coordinator.update_session_title(&session_id, &title).await {
            Ok(()) => {
                tracing::info!(session_id = %session_id, title = %title, "Session title set");
                return Some(title);
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, attempt, error = %e, "Title update failed");
                if attempt < retry.attempts {
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }

    tracing::error!(session_id = %session_id, "Giving up on session title");
    None
}

async fn respond(
    inner: Arc<ChatInner>,
    session_id: String,
    user_id: String,
    pdf_id: String,
    question: String,
    window: Vec<Message>,
) -> ResponseOutcome {
    let filter = RetrievalFilter {
        user_id: user_id.clone(),
        pdf_id: pdf_id.clone(),
    };
    let documents = match inner
        .retriever
        .retrieve(&question, &filter, &inner.retrieval_mode, inner.retrieval_k)
        .await
    {
        Ok(documents) => documents,
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Retrieval failed");
            inner.hub.publish(
                &session_id,
                RelayMessage::Error {
                    message: UPSTREAM_FAILURE.into(),
                },
            );
            return ResponseOutcome::Failed {
                reason: e.to_string(),
            };
        }
    };

    let prompt = answer_prompt(&window, &documents, &question);
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<String>();
    let (chunk_tx, chunk_rx) = mpsc::unbounded_channel::<String>();

    let normalize = async move {
        let mut normalizer = IndentNormalizer::new();
        let mut answer = String::new();
        while let Some(raw) = raw_rx.recv().await {
            let chunk = normalizer.push(&raw);
            if chunk.is_empty() {
                continue;
            }
            answer.push_str(&chunk);
            let _ = chunk_tx.send(chunk);
        }
        answer
    };

    tracing::debug!(session_id = %session_id, model = inner.model.name(), "Streaming answer");
    let (streamed, answer, chunks) = tokio::join!(
        inner.model.stream(&prompt, raw_tx),
        normalize,
        pump(chunk_rx, &inner.hub, &session_id, inner.batch),
    );

    if let Err(e) = streamed {
        tracing::error!(
            session_id = %session_id,
            chunks,
            error = %e,
            "Model stream failed; partial answer discarded"
        );
        inner.hub.publish(
            &session_id,
            RelayMessage::Error {
                message: UPSTREAM_FAILURE.into(),
            },
        );
        return ResponseOutcome::Failed {
            reason: e.to_string(),
        };
    }

    let stored = match inner
        .coordinator
        .add_message(&session_id, &user_id, &pdf_id, Role::Ai, &answer)
        .await
    {
        Ok(_) => {
            inner.count_append(Role::Ai);
            true
        }
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Failed to store AI answer");
            false
        }
    };

    inner.hub.publish(&session_id, RelayMessage::Complete);
    tracing::info!(session_id = %session_id, chunks, stored, "Answer streamed");
    ResponseOutcome::Completed { chunks, stored }
}
