use serde::{Deserialize, Serialize};

/// Payload published on a session's relay channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// An ordered batch of answer fragments.
    Chunks { content: Vec<String> },
    /// The answer finished; no more chunks follow.
    Complete,
    /// The answer failed; no more chunks follow.
    Error { message: String },
}

impl RelayMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::Chunks { .. } => "chunks",
            RelayMessage::Complete => "complete",
            RelayMessage::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RelayMessage::Chunks { .. })
    }
}

/// One event delivered to a streaming client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Chunk(String),
    End,
    Error(String),
    KeepAlive,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay channel for session {0} closed")]
    Closed(String),
}
