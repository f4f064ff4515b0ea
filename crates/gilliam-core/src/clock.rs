//! Scheduler clock.
//!
//! Lease expiry and heartbeat loss are measured in ticks read from a
//! [`Clock`]. Tests drive a [`LogicalClock`] explicitly; the daemon uses
//! [`SystemClock`], where one tick is one second.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::Tick;

/// Source of the current tick.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Tick;
}

/// Manually advanced clock.
#[derive(Debug, Default)]
pub struct LogicalClock {
    tick: AtomicU64,
}

impl LogicalClock {
    pub fn new(start: Tick) -> Self {
        Self {
            tick: AtomicU64::new(start),
        }
    }

    /// Move the clock forward and return the new tick.
    pub fn advance(&self, ticks: u64) -> Tick {
        self.tick.fetch_add(ticks, Ordering::SeqCst) + ticks
    }

    /// Jump to an absolute tick. Going backwards is ignored.
    pub fn set(&self, tick: Tick) {
        self.tick.fetch_max(tick, Ordering::SeqCst);
    }
}

impl Clock for LogicalClock {
    fn now(&self) -> Tick {
        self.tick.load(Ordering::SeqCst)
    }
}

/// Wall clock in whole seconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Tick {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_clock_advances() {
        let clock = LogicalClock::new(5);
        assert_eq!(clock.now(), 5);
        assert_eq!(clock.advance(10), 15);
        assert_eq!(clock.now(), 15);
    }

    #[test]
    fn logical_clock_never_goes_back() {
        let clock = LogicalClock::new(20);
        clock.set(10);
        assert_eq!(clock.now(), 20);
        clock.set(31);
        assert_eq!(clock.now(), 31);
    }

    #[test]
    fn system_clock_is_past_2020() {
        assert!(SystemClock.now() > 1_577_836_800);
    }
}
