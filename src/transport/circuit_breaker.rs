//! Three-state failure gate for broker connection attempts.
//!
//! ```text
//!            N consecutive failures
//!   CLOSED ─────────────────────────▶ OPEN
//!     ▲                                │ open_duration elapsed
//!     │ trial success                  ▼
//!     └──────────────────────────── HALF_OPEN ──┐
//!                                      ▲        │ trial failure / trial timeout
//!                                      └── OPEN ◀┘ (timer restarts)
//! ```
//!
//! Pure bookkeeping: no I/O, time is passed in by the caller.

use log::{info, warn};
use serde::Serialize;

use crate::config::TransportTuning;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    last_transition_ms: u64,
    /// Set while the single half-open trial is outstanding.
    trial_started_ms: Option<u64>,
    failure_threshold: u32,
    open_duration_ms: u64,
    trial_duration_ms: u64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_duration_ms: u64, trial_duration_ms: u64) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_transition_ms: 0,
            trial_started_ms: None,
            failure_threshold: failure_threshold.max(1),
            open_duration_ms,
            trial_duration_ms,
        }
    }

    pub fn from_tuning(tuning: &TransportTuning) -> Self {
        Self::new(
            tuning.failure_threshold,
            tuning.open_duration_ms,
            tuning.trial_duration_ms,
        )
    }

    /// Whether an outbound attempt may be made right now.
    ///
    /// In HALF_OPEN the first call takes the single trial slot; every
    /// further call returns `false` until the trial is resolved.
    pub fn allow_request(&mut self, now_ms: u64) -> bool {
        self.refresh(now_ms);
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                if self.trial_started_ms.is_some() {
                    false
                } else {
                    self.trial_started_ms = Some(now_ms);
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self, now_ms: u64) {
        self.consecutive_failures = 0;
        self.trial_started_ms = None;
        if self.state != BreakerState::Closed {
            self.transition(BreakerState::Closed, now_ms);
        }
    }

    pub fn record_failure(&mut self, now_ms: u64) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            BreakerState::Closed => {
                if self.consecutive_failures >= self.failure_threshold {
                    self.transition(BreakerState::Open, now_ms);
                }
            }
            BreakerState::HalfOpen => {
                self.trial_started_ms = None;
                self.transition(BreakerState::Open, now_ms);
            }
            // Already open: the window is not extended by further failures.
            BreakerState::Open => {}
        }
    }

    /// Current state, with time-driven transitions applied.
    pub fn state_at(&mut self, now_ms: u64) -> BreakerState {
        self.refresh(now_ms);
        self.state
    }

    /// Last computed state (no time-driven refresh).
    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_transition_ms(&self) -> u64 {
        self.last_transition_ms
    }

    // ── Internal ──────────────────────────────────────────────────

    fn refresh(&mut self, now_ms: u64) {
        match self.state {
            BreakerState::Open => {
                if now_ms.saturating_sub(self.last_transition_ms) >= self.open_duration_ms {
                    self.trial_started_ms = None;
                    self.transition(BreakerState::HalfOpen, now_ms);
                }
            }
            BreakerState::HalfOpen => {
                if let Some(started) = self.trial_started_ms {
                    if now_ms.saturating_sub(started) >= self.trial_duration_ms {
                        warn!("breaker: trial unanswered after {} ms", self.trial_duration_ms);
                        self.trial_started_ms = None;
                        self.transition(BreakerState::Open, now_ms);
                    }
                }
            }
            BreakerState::Closed => {}
        }
    }

    fn transition(&mut self, to: BreakerState, now_ms: u64) {
        info!(
            "breaker: {:?} -> {:?} (failures={})",
            self.state, to, self.consecutive_failures
        );
        self.state = to;
        self.last_transition_ms = now_ms;
    }
}
