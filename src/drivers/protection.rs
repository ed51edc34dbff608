//! Runtime protection for pumps and other wear-sensitive loads.
//!
//! Two independent limits, both enforced locally:
//!
//! 1. **Continuous runtime**: a load may not stay on longer than
//!    `max_runtime_ms`.  Hitting the cap starts a mandatory
//!    `cooldown_ms` during which activation is refused.
//! 2. **Activation rate**: at most `max_activations_per_window` off→on
//!    transitions within the trailing `window_ms`.
//!
//! A refusal is a [`Refusal`], not an error: callers must be able to tell
//! "protection said no" from "the hardware failed".

use core::fmt;

use heapless::HistoryBuffer;
use serde::{Deserialize, Serialize};

/// Activation timestamps kept per guard; bounds `max_activations_per_window`.
pub const ACTIVATION_HISTORY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RuntimeProtectionPolicy {
    pub max_runtime_ms: u64,
    pub cooldown_ms: u64,
    pub max_activations_per_window: u16,
    pub window_ms: u64,
}

impl Default for RuntimeProtectionPolicy {
    fn default() -> Self {
        Self {
            max_runtime_ms: 600_000,    // 10 min
            cooldown_ms: 300_000,       // 5 min
            max_activations_per_window: 20,
            window_ms: 3_600_000,       // 1 h
        }
    }
}

impl RuntimeProtectionPolicy {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_runtime_ms == 0 {
            return Err("protection.max_runtime_ms must be > 0");
        }
        if self.window_ms == 0 {
            return Err("protection.window_ms must be > 0");
        }
        if self.max_activations_per_window == 0
            || self.max_activations_per_window as usize > ACTIVATION_HISTORY
        {
            return Err("protection.max_activations_per_window must be 1..=32");
        }
        Ok(())
    }
}

/// Why an activation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// Runtime cap was hit; cooldown still running.
    RuntimeCooldown { remaining_ms: u64 },
    /// Activation budget for the trailing window is spent.
    DutyCycleLimit { retry_in_ms: u64 },
}

impl Refusal {
    /// Alert type published alongside the refusal.
    pub const fn alert_type(self) -> &'static str {
        match self {
            Self::RuntimeCooldown { .. } => "runtime_cooldown",
            Self::DutyCycleLimit { .. } => "duty_cycle_limit",
        }
    }
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RuntimeCooldown { remaining_ms } => {
                write!(f, "refused: runtime cooldown ({remaining_ms} ms remaining)")
            }
            Self::DutyCycleLimit { retry_in_ms } => {
                write!(f, "refused: activation limit reached (retry in {retry_in_ms} ms)")
            }
        }
    }
}

/// Per-driver bookkeeping for [`RuntimeProtectionPolicy`].
#[derive(Debug, Clone)]
pub struct DutyCycleGuard {
    policy: RuntimeProtectionPolicy,
    history: HistoryBuffer<u64, ACTIVATION_HISTORY>,
    run_started_ms: Option<u64>,
    cooldown_until_ms: Option<u64>,
    total_active_ms: u64,
}

impl DutyCycleGuard {
    pub fn new(policy: RuntimeProtectionPolicy) -> Self {
        Self {
            policy,
            history: HistoryBuffer::new(),
            run_started_ms: None,
            cooldown_until_ms: None,
            total_active_ms: 0,
        }
    }

    /// A guard for `policy` that inherits `previous`'s activation history,
    /// pending cooldown and accumulated on-time.  Rebuilding a driver must
    /// not hand out a fresh budget.  `previous` is expected to be stopped;
    /// a run still open on it is not carried.
    pub fn carry_over(previous: &Self, policy: RuntimeProtectionPolicy) -> Self {
        Self {
            policy,
            history: previous.history.clone(),
            run_started_ms: None,
            cooldown_until_ms: previous.cooldown_until_ms,
            total_active_ms: previous.total_active_ms,
        }
    }

    pub fn policy(&self) -> &RuntimeProtectionPolicy {
        &self.policy
    }

    pub fn can_activate(&self, now_ms: u64) -> Result<(), Refusal> {
        if let Some(until) = self.cooldown_until_ms {
            if now_ms < until {
                return Err(Refusal::RuntimeCooldown {
                    remaining_ms: until - now_ms,
                });
            }
        }

        let max = self.policy.max_activations_per_window as usize;
        if self.activations_in_window(now_ms) >= max {
            // The oldest in-window activation is the next to age out.
            let oldest = self
                .history
                .oldest_ordered()
                .copied()
                .find(|&t| self.in_window(t, now_ms))
                .unwrap_or(now_ms);
            return Err(Refusal::DutyCycleLimit {
                retry_in_ms: (oldest + self.policy.window_ms).saturating_sub(now_ms),
            });
        }
        Ok(())
    }

    /// Off→on transition.  Callers check [`can_activate`](Self::can_activate) first.
    pub fn on_start(&mut self, now_ms: u64) {
        if self.run_started_ms.is_none() {
            self.history.write(now_ms);
            self.run_started_ms = Some(now_ms);
        }
    }

    /// On→off transition.  Starts the cooldown if the run reached the cap.
    pub fn on_stop(&mut self, now_ms: u64) {
        if let Some(started) = self.run_started_ms.take() {
            let ran = now_ms.saturating_sub(started);
            self.total_active_ms = self.total_active_ms.saturating_add(ran);
            if ran >= self.policy.max_runtime_ms {
                self.cooldown_until_ms = Some(now_ms.saturating_add(self.policy.cooldown_ms));
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.run_started_ms.is_some()
    }

    pub fn continuous_runtime_ms(&self, now_ms: u64) -> u64 {
        self.run_started_ms
            .map_or(0, |s| now_ms.saturating_sub(s))
    }

    pub fn runtime_exceeded(&self, now_ms: u64) -> bool {
        self.is_running() && self.continuous_runtime_ms(now_ms) >= self.policy.max_runtime_ms
    }

    pub fn cooling_down(&self, now_ms: u64) -> bool {
        self.cooldown_until_ms.is_some_and(|until| now_ms < until)
    }

    pub fn activations_in_window(&self, now_ms: u64) -> usize {
        self.history
            .oldest_ordered()
            .filter(|&&t| self.in_window(t, now_ms))
            .count()
    }

    /// Accumulated on-time, including the current run.
    pub fn total_active_ms(&self, now_ms: u64) -> u64 {
        self.total_active_ms
            .saturating_add(self.continuous_runtime_ms(now_ms))
    }

    fn in_window(&self, t: u64, now_ms: u64) -> bool {
        now_ms.saturating_sub(t) < self.policy.window_ms
    }
}
