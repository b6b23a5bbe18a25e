//! Flush decision policy for the write-behind scheduler.

use crate::config::SessionsConfig;

/// Why a session is (or is not) flushed this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// No durable document exists yet.
    New,
    /// Pending message count reached the threshold.
    Threshold,
    /// Inactive past the idle window with at least one pending message.
    Idle,
    Skip,
}

impl FlushDecision {
    pub fn should_flush(self) -> bool {
        !matches!(self, FlushDecision::Skip)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FlushDecision::New => "new",
            FlushDecision::Threshold => "threshold",
            FlushDecision::Idle => "idle",
            FlushDecision::Skip => "skip",
        }
    }
}

/// Snapshot of one session's fast-tier bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingState {
    pub durable_exists: bool,
    pub pending_messages: u64,
    /// Seconds since epoch of the last append, if recorded.
    pub last_activity: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub threshold: u64,
    pub idle_secs: u64,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            threshold: 6,
            idle_secs: 300,
        }
    }
}

impl From<&SessionsConfig> for FlushPolicy {
    fn from(config: &SessionsConfig) -> Self {
        Self {
            threshold: config.flush_threshold,
            idle_secs: config.idle_flush_secs,
        }
    }
}

impl FlushPolicy {
    /// Evaluate NEW, THRESHOLD, IDLE in that order; first match wins.
    pub fn evaluate(&self, state: &PendingState, now_secs: i64) -> FlushDecision {
        if !state.durable_exists {
            return FlushDecision::New;
        }
        if state.pending_messages >= self.threshold {
            return FlushDecision::Threshold;
        }
        if state.pending_messages >= 1 {
            // A missing activity stamp counts as idle since the epoch.
            let last = state.last_activity.unwrap_or(0);
            let idle = now_secs.saturating_sub(last);
            if idle >= i64::try_from(self.idle_secs).unwrap_or(i64::MAX) {
                return FlushDecision::Idle;
            }
        }
        FlushDecision::Skip
    }
}
