//! Token bucket throttling lease grants.

use gilliam_core::{DispatchLimit, Tick};

/// Allows up to `rate` grants per `per_ticks` ticks, refilling continuously.
///
/// The bucket starts full, so a burst of `rate` grants is allowed straight
/// away.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    rate: f64,
    per_ticks: f64,
    allowance: f64,
    last_check: Tick,
}

impl TokenBucket {
    pub fn new(limit: DispatchLimit, now: Tick) -> Self {
        let rate = f64::from(limit.rate);
        Self {
            rate,
            per_ticks: limit.per_ticks.max(1) as f64,
            allowance: rate,
            last_check: now,
        }
    }

    fn refill(&mut self, now: Tick) {
        let elapsed = now.saturating_sub(self.last_check) as f64;
        self.last_check = self.last_check.max(now);
        self.allowance = (self.allowance + elapsed * (self.rate / self.per_ticks)).min(self.rate);
    }

    /// Take a token if one is available.
    pub fn try_acquire(&mut self, now: Tick) -> bool {
        self.refill(now);
        if self.allowance < 1.0 {
            return false;
        }
        self.allowance -= 1.0;
        true
    }

    /// Whole tokens currently available.
    pub fn available(&mut self, now: Tick) -> u32 {
        self.refill(now);
        self.allowance.floor() as u32
    }
}
