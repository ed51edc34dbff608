//! Exponential reconnect backoff.
//!
//! `delay = min(base * 2^min(attempts, exponent_cap), max)`
//!
//! With the defaults (1 s base, 60 s max, cap 7) the schedule after
//! successive failures is 1, 2, 4, 8, 16, 32, 60, 60, ... seconds.
//! The attempt counter saturates at a ceiling; reaching it is reported
//! once as exhaustion, but retries keep running at the capped delay.

use crate::config::TransportTuning;

#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    exponent_cap: u32,
    ceiling: u32,
    attempts: u32,
    exhausted_reported: bool,
}

impl Backoff {
    pub fn new(base_ms: u64, max_ms: u64, exponent_cap: u32, ceiling: u32) -> Self {
        Self {
            base_ms,
            max_ms,
            exponent_cap,
            ceiling,
            attempts: 0,
            exhausted_reported: false,
        }
    }

    pub fn from_tuning(t: &TransportTuning) -> Self {
        Self::new(
            t.backoff_base_ms,
            t.backoff_max_ms,
            t.backoff_exponent_cap,
            t.max_reconnect_attempts,
        )
    }

    /// Delay for the current attempt count, without advancing it.
    pub fn current_delay_ms(&self) -> u64 {
        let shift = self.attempts.min(self.exponent_cap).min(32);
        self.base_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_ms)
    }

    /// Record a failed attempt; returns the delay before the next one.
    pub fn on_failure(&mut self) -> u64 {
        let delay = self.current_delay_ms();
        if self.attempts < self.ceiling {
            self.attempts += 1;
        }
        delay
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.exhausted_reported = false;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.ceiling
    }

    /// `true` exactly once per exhaustion episode.
    pub fn take_exhausted(&mut self) -> bool {
        if self.is_exhausted() && !self.exhausted_reported {
            self.exhausted_reported = true;
            true
        } else {
            false
        }
    }
}
