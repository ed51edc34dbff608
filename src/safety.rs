//! Emergency-stop state machine.
//!
//! ```text
//!            stop (any state)
//!   NORMAL ───────────────────▶ ACTIVE ◀───────────┐
//!     ▲                          │ clear           │ verification failed
//!     │                          ▼                 │
//!     │                       CLEARING ────────────┘
//!     │                          │ verification passed
//!     │   plan drained           ▼
//!     └──────────────────── RESUMING  (one actuator per inter_actuator_delay)
//! ```
//!
//! The controller is the only writer of [`EmergencyState`].  It is entered
//! only through an explicit remote command or a local hardware fault
//! signal; nothing in here watches sensor values.

use core::fmt;

use log::{error, info, warn};
use serde::Serialize;

use crate::app::ports::{MessagingPort, PinPort, Qos, MAX_ACTUATORS};
use crate::config::RecoveryConfig;
use crate::error::{SafetyError, VerificationFailure};
use crate::protocol::{self, EmergencyStateMsg};
use crate::registry::{self, ActuatorRegistry};
use crate::transport::TransportClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmergencyState {
    Normal,
    Active,
    Clearing,
    Resuming,
}

impl EmergencyState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Active => "ACTIVE",
            Self::Clearing => "CLEARING",
            Self::Resuming => "RESUMING",
        }
    }
}

impl fmt::Display for EmergencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a system-wide stop came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSource {
    Remote,
    LocalFault,
}

/// One step of the resume sequence, reported by [`SafetyController::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStep {
    Resumed(u8),
    /// Failed per-actuator verification; stays latched.
    Skipped(u8),
    Complete,
}

pub struct SafetyController {
    state: EmergencyState,
    triggered_at_ms: u64,
    reason: heapless::String<64>,
    recovery: RecoveryConfig,
    clear_failures: u8,
    last_failure_ms: Option<u64>,
    plan: heapless::Deque<u8, MAX_ACTUATORS>,
    plan_started: bool,
    next_resume_ms: u64,
}

impl SafetyController {
    pub fn new(recovery: RecoveryConfig) -> Self {
        Self {
            state: EmergencyState::Normal,
            triggered_at_ms: 0,
            reason: heapless::String::new(),
            recovery,
            clear_failures: 0,
            last_failure_ms: None,
            plan: heapless::Deque::new(),
            plan_started: false,
            next_resume_ms: 0,
        }
    }

    // ── Transitions ───────────────────────────────────────────────

    /// Stop everything.  Valid from every state; an in-flight resume is
    /// abandoned.  Returns the number of actuators stopped.
    pub fn emergency_stop_all<M: MessagingPort>(
        &mut self,
        reason: &str,
        source: StopSource,
        registry: &mut ActuatorRegistry,
        pins: &mut impl PinPort,
        link: &mut TransportClient<M>,
        now_ms: u64,
    ) -> usize {
        self.state = EmergencyState::Active;
        self.triggered_at_ms = now_ms;
        self.reason.clear();
        let _ = self.reason.push_str(truncate(reason, 64));
        self.plan.clear();
        self.plan_started = false;

        let stopped = registry.emergency_stop_all(reason, pins, link, now_ms);
        error!("EMERGENCY STOP ({source:?}): {reason}; {stopped} actuator(s) de-energised");
        self.publish_state(registry, link, None, now_ms);
        stopped
    }

    /// Request release of a system-wide stop.
    ///
    /// Only valid from ACTIVE.  On a verification failure the controller
    /// returns to ACTIVE and counts the failure; after
    /// `max_clear_retries` failures further requests are refused until
    /// `verification_timeout_ms` has passed since the last one.
    pub fn clear_emergency_stop<M: MessagingPort>(
        &mut self,
        registry: &mut ActuatorRegistry,
        link: &mut TransportClient<M>,
        now_ms: u64,
    ) -> Result<(), SafetyError> {
        if self.state != EmergencyState::Active {
            return Err(SafetyError::InvalidState(self.state));
        }
        self.check_lockout(now_ms)?;

        self.state = EmergencyState::Clearing;
        if let Err(failure) = self.verify_system_safety(link, now_ms) {
            self.state = EmergencyState::Active;
            self.clear_failures = self.clear_failures.saturating_add(1);
            self.last_failure_ms = Some(now_ms);
            warn!(
                "emergency clear rejected ({failure}); failure {}/{}",
                self.clear_failures, self.recovery.max_clear_retries
            );
            let mut detail = heapless::String::<64>::new();
            let _ = fmt::Write::write_fmt(&mut detail, format_args!("{failure}"));
            self.publish_state(registry, link, Some(&detail), now_ms);
            return Err(SafetyError::VerificationFailed(failure));
        }

        self.clear_failures = 0;
        self.last_failure_ms = None;
        registry.clear_emergency_flags();
        self.state = EmergencyState::Resuming;
        info!("emergency cleared after {} ms", now_ms.saturating_sub(self.triggered_at_ms));
        self.publish_state(registry, link, None, now_ms);

        if self.recovery.auto_resume {
            self.start_plan(registry, now_ms);
        }
        Ok(())
    }

    /// Start (or confirm) the sequenced re-enable.
    ///
    /// From RESUMING this starts the plan if it is not already running.
    /// From ACTIVE it runs the same verified clear first.
    pub fn resume_operation<M: MessagingPort>(
        &mut self,
        registry: &mut ActuatorRegistry,
        link: &mut TransportClient<M>,
        now_ms: u64,
    ) -> Result<(), SafetyError> {
        match self.state {
            EmergencyState::Resuming => {}
            EmergencyState::Active => self.clear_emergency_stop(registry, link, now_ms)?,
            other => return Err(SafetyError::InvalidState(other)),
        }
        if !self.plan_started {
            self.start_plan(registry, now_ms);
        }
        Ok(())
    }

    /// Re-enable one actuator that was stopped on its own.  Only valid
    /// while the system is NORMAL.
    pub fn clear_actuator<M: MessagingPort>(
        &mut self,
        gpio: u8,
        registry: &mut ActuatorRegistry,
        pins: &impl PinPort,
        link: &mut TransportClient<M>,
        now_ms: u64,
    ) -> Result<(), SafetyError> {
        if self.state != EmergencyState::Normal {
            return Err(SafetyError::InvalidState(self.state));
        }
        registry.verify_actuator_safety(gpio, pins)?;
        registry.reenable(gpio)?;
        info!("GPIO {gpio}: emergency latch cleared");
        registry.publish_status(gpio, link, now_ms);
        Ok(())
    }

    // ── Verification ──────────────────────────────────────────────

    /// System-level preconditions for leaving ACTIVE.
    pub fn verify_system_safety<M: MessagingPort>(
        &self,
        link: &TransportClient<M>,
        now_ms: u64,
    ) -> Result<(), VerificationFailure> {
        if self.recovery.require_connectivity && !link.is_connected() {
            return Err(VerificationFailure::TransportDown);
        }
        if link.queue_headroom() == 0 {
            return Err(VerificationFailure::NoQueueHeadroom);
        }
        let elapsed = now_ms.saturating_sub(self.triggered_at_ms);
        if elapsed < self.recovery.min_stop_duration_ms {
            return Err(VerificationFailure::TooSoon {
                remaining_ms: self.recovery.min_stop_duration_ms - elapsed,
            });
        }
        Ok(())
    }

    fn check_lockout(&mut self, now_ms: u64) -> Result<(), SafetyError> {
        if self.clear_failures < self.recovery.max_clear_retries {
            return Ok(());
        }
        let since = self.last_failure_ms.map_or(u64::MAX, |t| now_ms.saturating_sub(t));
        if since < self.recovery.verification_timeout_ms {
            return Err(SafetyError::LockedOut {
                remaining_ms: self.recovery.verification_timeout_ms - since,
            });
        }
        info!("emergency clear lockout expired");
        self.clear_failures = 0;
        Ok(())
    }

    // ── Resume sequencing ─────────────────────────────────────────

    fn start_plan(&mut self, registry: &ActuatorRegistry, now_ms: u64) {
        self.plan.clear();
        for gpio in registry.resume_order(self.recovery.critical_first) {
            let _ = self.plan.push_back(gpio);
        }
        self.plan_started = true;
        self.next_resume_ms = now_ms;
        info!("resume plan: {} actuator(s)", self.plan.len());
    }

    /// Advance the resume plan.  Re-enables at most one actuator per call
    /// and then waits `inter_actuator_delay_ms`; actuators that fail
    /// verification are skipped without waiting.
    pub fn tick<M: MessagingPort>(
        &mut self,
        registry: &mut ActuatorRegistry,
        pins: &impl PinPort,
        link: &mut TransportClient<M>,
        now_ms: u64,
    ) -> heapless::Vec<ResumeStep, { MAX_ACTUATORS + 1 }> {
        let mut steps = heapless::Vec::new();
        if self.state != EmergencyState::Resuming || !self.plan_started {
            return steps;
        }
        if now_ms < self.next_resume_ms {
            return steps;
        }

        while let Some(gpio) = self.plan.pop_front() {
            let verified = registry
                .verify_actuator_safety(gpio, pins)
                .and_then(|()| registry.reenable(gpio));
            match verified {
                Ok(()) => {
                    info!("resume: GPIO {gpio} re-enabled");
                    registry.publish_status(gpio, link, now_ms);
                    let _ = steps.push(ResumeStep::Resumed(gpio));
                    self.next_resume_ms = now_ms.saturating_add(self.recovery.inter_actuator_delay_ms);
                    if !self.plan.is_empty() {
                        return steps;
                    }
                    break;
                }
                Err(e) => {
                    warn!("resume: GPIO {gpio} skipped ({e})");
                    registry.publish_alert(gpio, "resume_skipped", "actuator failed verification", link, now_ms);
                    let _ = steps.push(ResumeStep::Skipped(gpio));
                }
            }
        }

        self.state = EmergencyState::Normal;
        self.plan_started = false;
        self.reason.clear();
        info!("resume complete");
        self.publish_state(registry, link, None, now_ms);
        let _ = steps.push(ResumeStep::Complete);
        steps
    }

    // ── Reporting ─────────────────────────────────────────────────

    /// Publish the current state (QoS 1).
    pub fn publish_state<M: MessagingPort>(
        &self,
        registry: &ActuatorRegistry,
        link: &mut TransportClient<M>,
        error: Option<&str>,
        now_ms: u64,
    ) {
        let payload = protocol::encode(&EmergencyStateMsg {
            state: self.state,
            reason: &self.reason,
            since_ms: self.triggered_at_ms,
            error,
            ts: now_ms,
        });
        registry::send(
            link,
            &registry.topics().emergency_state(),
            &payload,
            Qos::AtLeastOnce,
            1,
            now_ms,
        );
    }

    pub fn state(&self) -> EmergencyState {
        self.state
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn triggered_at_ms(&self) -> u64 {
        self.triggered_at_ms
    }

    pub fn clear_failures(&self) -> u8 {
        self.clear_failures
    }

    /// Actuators still waiting in the resume plan.
    pub fn pending_resume(&self) -> usize {
        self.plan.len()
    }
}

/// Longest prefix of `s` that fits in `max` bytes on a char boundary.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
