//! Consumer side: turn a subscription into a flat stream of client events.

use futures_util::stream::{self, Stream};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::hub::Subscription;
use super::types::{RelayEvent, RelayMessage};
use crate::config::StreamConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub poll_interval: Duration,
    pub keep_alive: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            keep_alive: Duration::from_secs(15),
        }
    }
}

impl From<&StreamConfig> for ConsumerConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            keep_alive: config.keep_alive(),
        }
    }
}

struct ConsumerState {
    subscription: Subscription,
    pending: VecDeque<String>,
    last_event: Instant,
    finished: bool,
    config: ConsumerConfig,
}

/// Unpack batches into one [`RelayEvent::Chunk`] per fragment, in order.
///
/// Ends after emitting [`RelayEvent::End`] or [`RelayEvent::Error`]. Emits
/// [`RelayEvent::KeepAlive`] after `keep_alive` without any event. Dropping the
/// stream drops the subscription.
pub fn relay_events(
    subscription: Subscription,
    config: ConsumerConfig,
) -> impl Stream<Item = RelayEvent> + Send {
    let state = ConsumerState {
        subscription,
        pending: VecDeque::new(),
        last_event: Instant::now(),
        finished: false,
        config,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(chunk) = st.pending.pop_front() {
                st.last_event = Instant::now();
                return Some((RelayEvent::Chunk(chunk), st));
            }
            if st.finished {
                return None;
            }

            match tokio::time::timeout(st.config.poll_interval, st.subscription.recv()).await {
                Ok(Ok(RelayMessage::Chunks { content })) => st.pending.extend(content),
                Ok(Ok(RelayMessage::Complete)) => {
                    st.finished = true;
                    return Some((RelayEvent::End, st));
                }
                Ok(Ok(RelayMessage::Error { message })) => {
                    st.finished = true;
                    return Some((RelayEvent::Error(message), st));
                }
                Ok(Err(e)) => {
                    st.finished = true;
                    return Some((RelayEvent::Error(e.to_string()), st));
                }
                Err(_) => {
                    if st.last_event.elapsed() >= st.config.keep_alive {
                        st.last_event = Instant::now();
                        return Some((RelayEvent::KeepAlive, st));
                    }
                }
            }
        }
    })
}
