//! Uniform actuator surface over the closed set of driver variants.
//!
//! ```text
//!                     ┌── Binary (relay, pump) ── DutyCycleGuard
//!   ActuatorDriver ───┼── Pwm                  ── DutyCycleGuard (optional)
//!                     └── Valve (dual GPIO)    ── timed travel
//! ```
//!
//! The variant set is fixed at compile time, so dispatch is a `match`
//! rather than a trait object.  The wrapper owns what every variant
//! shares: configuration, the emergency-stop latch and status reporting.
//! GPIO access comes in through the [`PinPort`] passed to each call.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::PinPort;
use crate::config::SystemConfig;
use crate::error::{ActuatorError, ConfigRejection, RejectionCode};
use crate::pins;

use super::binary::BinaryDriver;
use super::protection::{DutyCycleGuard, Refusal, RuntimeProtectionPolicy};
use super::pwm::PwmDriver;
use super::valve::{ValveDriver, ValvePosition};

// ───────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorKind {
    Relay,
    Pump,
    Pwm,
    Valve,
}

impl ActuatorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Relay => "relay",
            Self::Pump => "pump",
            Self::Pwm => "pwm",
            Self::Valve => "valve",
        }
    }

    /// Valves drive a second (close-direction) pin.
    pub const fn needs_aux(self) -> bool {
        matches!(self, Self::Valve)
    }
}

/// One configured actuator.  Immutable once applied; reconfiguration
/// replaces the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorConfig {
    pub gpio: u8,
    pub aux_gpio: Option<u8>,
    pub kind: ActuatorKind,
    pub name: heapless::String<32>,
    pub zone: heapless::String<24>,
    pub subzone: Option<heapless::String<24>>,
    pub active: bool,
    /// Re-enabled first during emergency recovery.
    pub critical: bool,
    pub inverted: bool,
    /// Boot level: 0/1 for binary loads, duty for PWM, travel for valves.
    pub default_state: f32,
    /// Overrides the system default policy.
    pub protection: Option<RuntimeProtectionPolicy>,
    /// Valve full-stroke time; falls back to the system default.
    pub transition_ms: Option<u32>,
}

impl ActuatorConfig {
    /// Pins this actuator claims, primary first.
    pub fn gpios(&self) -> heapless::Vec<u8, 2> {
        let mut v = heapless::Vec::new();
        let _ = v.push(self.gpio);
        if let Some(aux) = self.aux_gpio {
            let _ = v.push(aux);
        }
        v
    }

    /// Structural checks that need no knowledge of other actuators.
    pub fn validate(&self) -> Result<(), ConfigRejection> {
        use RejectionCode as C;

        for gpio in self.gpios() {
            if !pins::is_assignable(gpio) {
                return Err(ConfigRejection::new(C::OutOfRange, "gpio is not assignable"));
            }
        }
        match (self.kind.needs_aux(), self.aux_gpio) {
            (true, None) => {
                return Err(ConfigRejection::new(C::MissingField, "valve requires aux_gpio"));
            }
            (false, Some(_)) => {
                return Err(ConfigRejection::new(
                    C::TypeMismatch,
                    "aux_gpio only applies to valves",
                ));
            }
            (true, Some(aux)) if aux == self.gpio => {
                return Err(ConfigRejection::new(C::GpioConflict, "aux_gpio equals gpio"));
            }
            _ => {}
        }
        if !self.default_state.is_finite() || !(0.0..=1.0).contains(&self.default_state) {
            return Err(ConfigRejection::new(C::OutOfRange, "default_state must be 0.0..=1.0"));
        }
        if let Some(p) = &self.protection {
            p.validate()
                .map_err(|detail| ConfigRejection::new(C::ValidationFailed, detail))?;
        }
        if self.transition_ms == Some(0) {
            return Err(ConfigRejection::new(C::OutOfRange, "transition_ms must be > 0"));
        }
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────
// Runtime state and results
// ───────────────────────────────────────────────────────────────

/// Read-only snapshot for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ActuatorRuntimeState {
    pub gpio: u8,
    #[serde(rename = "type")]
    pub kind: ActuatorKind,
    /// Normalised output: 0/1 binary, duty level, or valve travel.
    pub value: f32,
    pub state: bool,
    pub emergency_stopped: bool,
    pub total_active_ms: u64,
    pub activations_in_window: u16,
    pub cooling_down: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<ValvePosition>,
    pub moving: bool,
}

/// Outcome of an accepted command.  Hardware faults and invalid input
/// are `Err`; a protection refusal is a normal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandEffect {
    Applied,
    Refused(Refusal),
}

/// Something a driver did on its own during `tick()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    /// Continuous-runtime cap reached; output switched off.
    RuntimeCutoff { ran_ms: u64 },
    /// Valve finished travelling.
    ValveSettled(ValvePosition),
}

enum Variant {
    Binary(BinaryDriver),
    Pwm(PwmDriver),
    Valve(ValveDriver),
}

// ───────────────────────────────────────────────────────────────
// Driver
// ───────────────────────────────────────────────────────────────

pub struct ActuatorDriver {
    config: ActuatorConfig,
    variant: Variant,
    emergency_stopped: bool,
}

impl ActuatorDriver {
    /// Build the variant for `config`.  Pumps fall back to the system
    /// default policy; relays and PWM loads are guarded only when they
    /// carry their own.
    ///
    /// `previous` is the guard of the driver this one replaces; its
    /// history and cooldown carry over so a reconfiguration cannot reset
    /// protection.
    pub fn new(
        config: ActuatorConfig,
        system: &SystemConfig,
        previous: Option<&DutyCycleGuard>,
    ) -> Self {
        let policy = match (config.kind, config.protection) {
            (_, Some(p)) => Some(p),
            (ActuatorKind::Pump, None) => Some(system.default_protection),
            _ => None,
        };
        let guard = policy.map(|p| match previous {
            Some(prev) => DutyCycleGuard::carry_over(prev, p),
            None => DutyCycleGuard::new(p),
        });
        let variant = match config.kind {
            ActuatorKind::Relay | ActuatorKind::Pump => {
                Variant::Binary(BinaryDriver::new(&config, guard))
            }
            ActuatorKind::Pwm => {
                Variant::Pwm(PwmDriver::new(&config, system.pwm_resolution_bits, guard))
            }
            ActuatorKind::Valve => Variant::Valve(ValveDriver::new(
                &config,
                config.aux_gpio.unwrap_or(config.gpio),
                config.transition_ms.unwrap_or(system.valve_transition_ms),
            )),
        };
        Self {
            config,
            variant,
            emergency_stopped: false,
        }
    }

    /// Put the outputs into their boot state.  With `start_stopped` the
    /// driver comes up latched and de-energised.
    pub fn begin(
        &mut self,
        pins: &mut impl PinPort,
        start_stopped: bool,
        now_ms: u64,
    ) -> Result<(), ActuatorError> {
        self.emergency_stopped = start_stopped;
        let boot_on = !start_stopped && self.config.default_state > 0.0;
        match &mut self.variant {
            Variant::Binary(d) => {
                d.begin(pins, now_ms)?;
                if boot_on && self.config.default_state >= 0.5 {
                    d.set(true, pins, now_ms)?;
                }
            }
            Variant::Pwm(d) => {
                d.begin(pins, now_ms)?;
                if boot_on {
                    d.set_level(self.config.default_state, pins, now_ms)?;
                }
            }
            Variant::Valve(d) => d.begin(pins, start_stopped, now_ms)?,
        }
        info!(
            "actuator {} ({}) on GPIO {} ready{}",
            self.config.name,
            self.config.kind.as_str(),
            self.config.gpio,
            if start_stopped { " [stopped]" } else { "" }
        );
        Ok(())
    }

    /// Normalised command: threshold 0.5 for binary loads, duty for PWM,
    /// nearest position for valves.
    pub fn set_value(
        &mut self,
        value: f32,
        pins: &mut impl PinPort,
        now_ms: u64,
    ) -> Result<CommandEffect, ActuatorError> {
        self.ensure_enabled()?;
        if !(0.0..=1.0).contains(&value) {
            return Err(ActuatorError::OutOfRange);
        }
        match &mut self.variant {
            Variant::Binary(d) => d.set(value >= 0.5, pins, now_ms),
            Variant::Pwm(d) => d.set_level(value, pins, now_ms),
            Variant::Valve(d) => d.move_to_position(ValvePosition::nearest(value), pins, now_ms),
        }
    }

    pub fn set_binary(
        &mut self,
        on: bool,
        pins: &mut impl PinPort,
        now_ms: u64,
    ) -> Result<CommandEffect, ActuatorError> {
        self.ensure_enabled()?;
        match &mut self.variant {
            Variant::Binary(d) => d.set(on, pins, now_ms),
            Variant::Pwm(d) => d.set_on(on, pins, now_ms),
            Variant::Valve(d) => {
                let target = if on { ValvePosition::Open } else { ValvePosition::Closed };
                d.move_to_position(target, pins, now_ms)
            }
        }
    }

    pub fn toggle(
        &mut self,
        pins: &mut impl PinPort,
        now_ms: u64,
    ) -> Result<CommandEffect, ActuatorError> {
        let on = match &self.variant {
            Variant::Binary(d) => d.is_on(),
            Variant::Pwm(d) => d.level() > 0.0,
            Variant::Valve(d) => match d.target() {
                Some(t) => t != ValvePosition::Closed,
                None => d.fraction() >= 0.5,
            },
        };
        self.set_binary(!on, pins, now_ms)
    }

    /// Force the de-energised state and latch.  Bypasses protection and
    /// always latches, even when the output write fails.
    pub fn emergency_stop(
        &mut self,
        reason: &str,
        pins: &mut impl PinPort,
        now_ms: u64,
    ) -> Result<(), ActuatorError> {
        self.emergency_stopped = true;
        let result = self.de_energize(pins, now_ms);
        match result {
            Ok(()) => warn!("actuator GPIO {} emergency stopped: {}", self.config.gpio, reason),
            Err(e) => warn!(
                "actuator GPIO {} emergency stop write failed ({e}): {}",
                self.config.gpio, reason
            ),
        }
        result
    }

    /// Release the latch.  Outputs are left untouched.
    pub fn clear_emergency(&mut self) -> Result<(), ActuatorError> {
        self.emergency_stopped = false;
        Ok(())
    }

    pub fn tick(&mut self, pins: &mut impl PinPort, now_ms: u64) -> Option<DriverEvent> {
        match &mut self.variant {
            Variant::Binary(d) => d.tick(pins, now_ms),
            Variant::Pwm(d) => d.tick(pins, now_ms),
            Variant::Valve(d) => d.tick(pins, now_ms),
        }
    }

    /// Whether protection would allow an activation right now.
    pub fn can_activate(&self, now_ms: u64) -> Result<(), Refusal> {
        let refusal = match &self.variant {
            Variant::Binary(d) => d.refusal(now_ms),
            Variant::Pwm(d) => d.refusal(now_ms),
            Variant::Valve(_) => None,
        };
        refusal.map_or(Ok(()), Err)
    }

    /// Safe to re-enable: de-energised and still the owner of its pins.
    pub fn verify_safe(&self, pins: &impl PinPort) -> bool {
        let owner = crate::app::ports::PinOwner::Actuator { slot: self.config.gpio };
        let pins_held = self.config.gpios().iter().all(|&g| pins.owner_of(g) == Some(owner));
        pins_held && !self.is_energized()
    }

    pub fn is_energized(&self) -> bool {
        match &self.variant {
            Variant::Binary(d) => d.is_on(),
            Variant::Pwm(d) => d.level() > 0.0,
            Variant::Valve(d) => d.is_moving(),
        }
    }

    pub fn guard(&self) -> Option<&DutyCycleGuard> {
        match &self.variant {
            Variant::Binary(d) => d.guard(),
            Variant::Pwm(d) => d.guard(),
            Variant::Valve(_) => None,
        }
    }

    pub fn status(&self, now_ms: u64) -> ActuatorRuntimeState {
        let guard = self.guard();
        let (value, position, moving) = match &self.variant {
            Variant::Binary(d) => (if d.is_on() { 1.0 } else { 0.0 }, None, false),
            Variant::Pwm(d) => (d.level(), None, false),
            Variant::Valve(d) => (d.fraction(), Some(d.position()), d.is_moving()),
        };
        ActuatorRuntimeState {
            gpio: self.config.gpio,
            kind: self.config.kind,
            value,
            state: value > 0.0,
            emergency_stopped: self.emergency_stopped,
            total_active_ms: guard.map_or(0, |g| g.total_active_ms(now_ms)),
            activations_in_window: guard.map_or(0, |g| g.activations_in_window(now_ms) as u16),
            cooling_down: guard.is_some_and(|g| g.cooling_down(now_ms)),
            position,
            moving,
        }
    }

    pub fn config(&self) -> &ActuatorConfig {
        &self.config
    }

    pub fn gpio(&self) -> u8 {
        self.config.gpio
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stopped
    }

    fn ensure_enabled(&self) -> Result<(), ActuatorError> {
        if self.emergency_stopped {
            Err(ActuatorError::EmergencyStopped)
        } else {
            Ok(())
        }
    }

    fn de_energize(&mut self, pins: &mut impl PinPort, now_ms: u64) -> Result<(), ActuatorError> {
        match &mut self.variant {
            Variant::Binary(d) => d.force_off(pins, now_ms),
            Variant::Pwm(d) => d.force_off(pins, now_ms),
            Variant::Valve(d) => d.halt(pins, now_ms),
        }
    }
}
