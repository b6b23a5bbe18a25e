//! Producer side: batch model chunks before publishing them.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use super::hub::RelayHub;
use super::types::RelayMessage;
use crate::config::StreamConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_chunks: usize,
    pub max_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_chunks: 5,
            max_delay: Duration::from_millis(100),
        }
    }
}

impl From<&StreamConfig> for BatchConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            max_chunks: config.batch_size.max(1),
            max_delay: config.batch_interval(),
        }
    }
}

/// Forward chunks from `chunks` to the session channel in batches.
///
/// A batch is published when it holds `max_chunks` chunks or when `max_delay`
/// has passed since its first chunk, whichever comes first. Remaining chunks
/// are published when `chunks` closes. Terminal markers are the caller's job.
/// Returns the number of chunks forwarded.
pub async fn pump(
    mut chunks: mpsc::UnboundedReceiver<String>,
    hub: &RelayHub,
    session_id: &str,
    config: BatchConfig,
) -> usize {
    let mut batch: Vec<String> = Vec::with_capacity(config.max_chunks);
    let mut deadline: Option<Instant> = None;
    let mut forwarded = 0;

    let mut publish = |batch: &mut Vec<String>, deadline: &mut Option<Instant>| {
        if batch.is_empty() {
            return;
        }
        forwarded += batch.len();
        hub.publish(
            session_id,
            RelayMessage::Chunks {
                content: std::mem::take(batch),
            },
        );
        *deadline = None;
    };

    loop {
        let next = match deadline {
            Some(at) => tokio::select! {
                chunk = chunks.recv() => Some(chunk),
                () = sleep_until(at) => None,
            },
            None => Some(chunks.recv().await),
        };

        match next {
            Some(Some(chunk)) => {
                if batch.is_empty() {
                    deadline = Some(Instant::now() + config.max_delay);
                }
                batch.push(chunk);
                if batch.len() >= config.max_chunks {
                    publish(&mut batch, &mut deadline);
                }
            }
            Some(None) => {
                publish(&mut batch, &mut deadline);
                break;
            }
            None => publish(&mut batch, &mut deadline),
        }
    }

    forwarded
}
