//! Process-local state for unauthenticated demo chats.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::sessions::{Clock, Message, Role};

/// A queued demo question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoMessage {
    pub message: String,
    pub pdf_id: String,
}

struct DemoSession {
    tx: mpsc::UnboundedSender<DemoMessage>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<DemoMessage>>>,
    history: Vec<Message>,
    last_activity: i64,
}

impl DemoSession {
    fn new(now: i64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            history: Vec::new(),
            last_activity: now,
        }
    }
}

/// Per-session queues, histories and activity stamps for demo mode.
///
/// Nothing here touches the session tiers. Entries live until
/// [`DemoRegistry::evict_inactive`] removes them.
pub struct DemoRegistry {
    sessions: Mutex<HashMap<String, DemoSession>>,
    clock: Arc<dyn Clock>,
}

impl DemoRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Queue a question and mark the session active.
    pub fn enqueue(&self, session_id: &str, message: DemoMessage) {
        let now = self.clock.now_secs();
        let mut sessions = self.sessions.lock();
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| DemoSession::new(now));
        session.last_activity = now;
        // The receiver lives in the same entry, so the send cannot fail.
        let _ = session.tx.send(message);
    }

    /// Wait up to `timeout` for the next queued question.
    ///
    /// Returns `None` on timeout, or when the session is evicted while waiting.
    pub async fn dequeue(&self, session_id: &str, timeout: Duration) -> Option<DemoMessage> {
        let rx = {
            let now = self.clock.now_secs();
            let mut sessions = self.sessions.lock();
            let session = sessions
                .entry(session_id.to_string())
                .or_insert_with(|| DemoSession::new(now));
            Arc::clone(&session.rx)
        };

        let wait = async {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Append one question/answer pair and refresh the activity stamp.
    pub fn record_exchange(&self, session_id: &str, pdf_id: &str, question: &str, answer: &str) {
        let now = self.clock.now_secs();
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(session_id) else {
            return;
        };
        let base = session
            .history
            .last()
            .map_or(now, |m| now.max(m.timestamp.saturating_add(1)));
        for (offset, (role, content)) in [(Role::Human, question), (Role::Ai, answer)]
            .into_iter()
            .enumerate()
        {
            session.history.push(Message {
                role,
                content: content.to_string(),
                timestamp: base + offset as i64,
                pdf_id: pdf_id.to_string(),
            });
        }
        session.last_activity = now;
    }

    pub fn history(&self, session_id: &str) -> Vec<Message> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    /// Remove sessions idle for longer than `timeout_secs`, returning their ids.
    pub fn evict_inactive(&self, timeout_secs: u64) -> Vec<String> {
        let now = self.clock.now_secs();
        let timeout = i64::try_from(timeout_secs).unwrap_or(i64::MAX);
        let mut sessions = self.sessions.lock();
        let stale: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| now.saturating_sub(s.last_activity) > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            sessions.remove(id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
