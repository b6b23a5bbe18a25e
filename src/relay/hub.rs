//! In-process pub/sub keyed by session id.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::types::{RelayError, RelayMessage};
use crate::observability::Metrics;

type Subscribers = HashMap<String, Vec<(Uuid, mpsc::UnboundedSender<RelayMessage>)>>;

struct HubInner {
    channels: Mutex<Subscribers>,
    metrics: Option<Metrics>,
}

impl HubInner {
    fn unsubscribe(&self, session_id: &str, id: Uuid) {
        let mut channels = self.channels.lock();
        if let Some(subs) = channels.get_mut(session_id) {
            subs.retain(|(sub_id, _)| *sub_id != id);
            if subs.is_empty() {
                channels.remove(session_id);
            }
        }
    }
}

/// Per-session channels with pub/sub semantics: every live subscriber gets
/// every message in publish order; a message published with no subscriber is
/// dropped.
#[derive(Clone)]
pub struct RelayHub {
    inner: Arc<HubInner>,
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                channels: Mutex::new(HashMap::new()),
                metrics: None,
            }),
        }
    }

    pub fn with_metrics(metrics: Metrics) -> Self {
        Self {
            inner: Arc::new(HubInner {
                channels: Mutex::new(HashMap::new()),
                metrics: Some(metrics),
            }),
        }
    }

    /// Publish to every subscriber of `session_id`, returning how many received it.
    pub fn publish(&self, session_id: &str, message: RelayMessage) -> usize {
        if let Some(metrics) = &self.inner.metrics {
            metrics
                .relay_events
                .with_label_values(&[message.kind()])
                .inc();
        }

        let mut channels = self.inner.channels.lock();
        let Some(subs) = channels.get_mut(session_id) else {
            tracing::debug!(session_id, kind = message.kind(), "Relay message dropped: no subscriber");
            return 0;
        };
        subs.retain(|(_, tx)| tx.send(message.clone()).is_ok());
        let delivered = subs.len();
        if subs.is_empty() {
            channels.remove(session_id);
        }
        delivered
    }

    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.inner
            .channels
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push((id, tx));
        tracing::debug!(session_id, subscriber = %id, "Relay subscriber attached");
        Subscription {
            id,
            session_id: session_id.to_string(),
            rx,
            hub: self.inner.clone(),
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.inner
            .channels
            .lock()
            .get(session_id)
            .map_or(0, Vec::len)
    }
}

/// A live subscription. Dropping it unsubscribes and releases the channel.
pub struct Subscription {
    id: Uuid,
    session_id: String,
    rx: mpsc::UnboundedReceiver<RelayMessage>,
    hub: Arc<HubInner>,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn recv(&mut self) -> Result<RelayMessage, RelayError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| RelayError::Closed(self.session_id.clone()))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.session_id, self.id);
        tracing::debug!(session_id = %self.session_id, subscriber = %self.id, "Relay subscriber detached");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_in_publish_order() {
        let hub = RelayHub::new();
        let mut a = hub.subscribe("s1");
        let mut b = hub.subscribe("s1");

        assert_eq!(
            hub.publish("s1", RelayMessage::Chunks { content: vec!["x".into()] }),
            2
        );
        assert_eq!(hub.publish("s1", RelayMessage::Complete), 2);

        for sub in [&mut a, &mut b] {
            assert_eq!(
                sub.recv().await.unwrap(),
                RelayMessage::Chunks { content: vec!["x".into()] }
            );
            assert_eq!(sub.recv().await.unwrap(), RelayMessage::Complete);
        }
    }

    #[test]
    fn publish_without_subscriber_is_dropped() {
        let hub = RelayHub::new();
        assert_eq!(hub.publish("s1", RelayMessage::Complete), 0);

        let sub = hub.subscribe("s1");
        drop(sub);
        assert_eq!(hub.publish("s1", RelayMessage::Complete), 0);
    }

    #[test]
    fn dropping_subscription_releases_channel() {
        let hub = RelayHub::new();
        let a = hub.subscribe("s1");
        let b = hub.subscribe("s1");
        assert_eq!(hub.subscriber_count("s1"), 2);
        drop(a);
        assert_eq!(hub.subscriber_count("s1"), 1);
        drop(b);
        assert_eq!(hub.subscriber_count("s1"), 0);
    }

    #[test]
    fn sessions_are_isolated() {
        let hub = RelayHub::new();
        let _a = hub.subscribe("s1");
        assert_eq!(hub.publish("s2", RelayMessage::Complete), 0);
    }

    #[test]
    fn publish_counts_metrics() {
        let metrics = Metrics::new().unwrap();
        let hub = RelayHub::with_metrics(metrics.clone());
        hub.publish("s1", RelayMessage::Complete);
        assert_eq!(
            metrics.relay_events.with_label_values(&["complete"]).get(),
            1
        );
    }
}
