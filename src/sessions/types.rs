//! Session data model shared by both storage tiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::storage::StoreError;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Ai,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Human => "human",
            Role::Ai => "ai",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Role::Human),
            "ai" => Ok(Role::Ai),
            other => Err(format!("unknown role {other:?}")),
        }
    }
}

/// One chat turn. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Seconds since epoch, strictly increasing within a session.
    pub timestamp: i64,
    #[serde(rename = "pdfId")]
    pub pdf_id: String,
}

/// Fast-tier JSON payload stored under `session:{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastTierRecord {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "pdfId")]
    pub pdf_id: String,
    #[serde(default)]
    pub chat_history: Vec<Message>,
}

impl FastTierRecord {
    pub fn new(user_id: impl Into<String>, pdf_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            pdf_id: pdf_id.into(),
            chat_history: Vec::new(),
        }
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.chat_history.last().map(|m| m.timestamp)
    }
}

/// Result of committing one session's fast tier to the durable tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// No durable document existed; it was created with `messages` entries.
    Created { messages: usize },
    /// `messages` new entries were appended to an existing document.
    Appended { messages: usize },
    /// A fast record existed but held nothing newer than the durable tier.
    Unchanged,
    /// No fast record existed; only bookkeeping was cleared.
    Empty,
}

impl FlushOutcome {
    /// Metric label for this outcome.
    pub fn kind(&self) -> &'static str {
        match self {
            FlushOutcome::Created { .. } => "created",
            FlushOutcome::Appended { .. } => "appended",
            FlushOutcome::Unchanged => "unchanged",
            FlushOutcome::Empty => "empty",
        }
    }

    pub fn messages_written(&self) -> usize {
        match self {
            FlushOutcome::Created { messages } | FlushOutcome::Appended { messages } => *messages,
            FlushOutcome::Unchanged | FlushOutcome::Empty => 0,
        }
    }
}

/// Errors surfaced by the session coordinator.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),
    #[error("corrupt fast-tier payload for session {session_id}: {reason}")]
    Decode { session_id: String, reason: String },
    #[error("failed to update title for session {session_id}: {source}")]
    TitleUpdateFailed {
        session_id: String,
        #[source]
        source: StoreError,
    },
    #[error("session {session_id} belongs to another user")]
    NotOwner { session_id: String },
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;
