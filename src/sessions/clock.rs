use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Wall-clock source in whole seconds since the epoch.
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> i64;

    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.now_secs(), 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        Utc::now().timestamp()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    secs: AtomicI64,
}

impl ManualClock {
    pub fn new(secs: i64) -> Self {
        Self {
            secs: AtomicI64::new(secs),
        }
    }

    pub fn set(&self, secs: i64) {
        self.secs.store(secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> i64 {
        self.secs.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(100);
        clock.advance(5);
        assert_eq!(clock.now_secs(), 105);
        assert_eq!(clock.now().timestamp(), 105);
        clock.set(7);
        assert_eq!(clock.now_secs(), 7);
    }
}
