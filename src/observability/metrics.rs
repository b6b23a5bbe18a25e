//! Prometheus metrics for the write-behind pipeline and stream relay.

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Process-wide metric handles, registered on a private registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub flush_outcomes: IntCounterVec,
    pub flush_failures: IntCounter,
    pub flushed_messages: IntCounter,
    pub reaped_keys: IntCounter,
    pub active_sessions: IntGauge,
    pub relay_events: IntCounterVec,
    pub messages_appended: IntCounterVec,
    pub ingestion_tasks: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("versa".into()), None)?;

        let flush_outcomes = IntCounterVec::new(
            Opts::new("flush_outcomes_total", "Session flushes by outcome"),
            &["kind"],
        )?;
        let flush_failures = IntCounter::new(
            "flush_failures_total",
            "Session flushes that failed and were deferred",
        )?;
        let flushed_messages = IntCounter::new(
            "flushed_messages_total",
            "Messages committed to the durable tier",
        )?;
        let reaped_keys = IntCounter::new(
            "reaped_keys_total",
            "Stale last-flush keys deleted by the reaper",
        )?;
        let active_sessions = IntGauge::new(
            "active_sessions",
            "Sessions with unflushed fast-tier state at the last sweep",
        )?;
        let relay_events = IntCounterVec::new(
            Opts::new("relay_events_total", "Stream relay messages published"),
            &["kind"],
        )?;
        let messages_appended = IntCounterVec::new(
            Opts::new("messages_appended_total", "Messages appended to the fast tier"),
            &["role"],
        )?;
        let ingestion_tasks = IntCounterVec::new(
            Opts::new("ingestion_tasks_total", "PDF ingestion tasks taken off the queue"),
            &["outcome"],
        )?;

        registry.register(Box::new(flush_outcomes.clone()))?;
        registry.register(Box::new(flush_failures.clone()))?;
        registry.register(Box::new(flushed_messages.clone()))?;
        registry.register(Box::new(reaped_keys.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(relay_events.clone()))?;
        registry.register(Box::new(messages_appended.clone()))?;
        registry.register(Box::new(ingestion_tasks.clone()))?;

        Ok(Self {
            registry,
            flush_outcomes,
            flush_failures,
            flushed_messages,
            reaped_keys,
            active_sessions,
            relay_events,
            messages_appended,
            ingestion_tasks,
        })
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_prefixed_names() {
        let metrics = Metrics::new().unwrap();
        metrics.flush_outcomes.with_label_values(&["created"]).inc();
        metrics.reaped_keys.inc_by(3);
        metrics.active_sessions.set(2);

        let text = metrics.render().unwrap();
        assert!(text.contains("versa_flush_outcomes_total{kind=\"created\"} 1"));
        assert!(text.contains("versa_reaped_keys_total 3"));
        assert!(text.contains("versa_active_sessions 2"));
    }

    #[test]
    fn separate_instances_do_not_collide() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.flush_failures.inc();
        assert!(!b.render().unwrap().contains("versa_flush_failures_total 1"));
    }
}
