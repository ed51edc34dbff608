//! Variable-output driver on an LEDC channel (dosing pumps, fans, lights).
//!
//! Input is a normalised 0.0–1.0 level.  Anything outside that range (or
//! NaN) is a caller error and is rejected, never clamped.  With
//! `inverted`, 1.0 maps to duty 0 (active-low drivers).

use log::warn;

use crate::app::ports::PinPort;
use crate::drivers::actuator::{ActuatorConfig, CommandEffect, DriverEvent};
use crate::drivers::protection::{DutyCycleGuard, Refusal};
use crate::error::ActuatorError;

pub struct PwmDriver {
    gpio: u8,
    inverted: bool,
    resolution_bits: u8,
    level: f32,
    /// Last non-zero level, restored by ON/TOGGLE.
    resume_level: f32,
    guard: Option<DutyCycleGuard>,
}

impl PwmDriver {
    pub fn new(config: &ActuatorConfig, resolution_bits: u8, guard: Option<DutyCycleGuard>) -> Self {
        let resume_level = if config.default_state > 0.0 {
            config.default_state
        } else {
            1.0
        };
        Self {
            gpio: config.gpio,
            inverted: config.inverted,
            resolution_bits,
            level: 0.0,
            resume_level,
            guard,
        }
    }

    pub fn begin(&mut self, pins: &mut impl PinPort, now_ms: u64) -> Result<(), ActuatorError> {
        self.force_off(pins, now_ms)
    }

    /// Raw duty count for a normalised level.
    pub fn duty_for(&self, level: f32) -> u32 {
        let max = (1u32 << self.resolution_bits) - 1;
        let duty = (level * max as f32).round() as u32;
        if self.inverted { max - duty.min(max) } else { duty.min(max) }
    }

    pub fn set_level(
        &mut self,
        level: f32,
        pins: &mut impl PinPort,
        now_ms: u64,
    ) -> Result<CommandEffect, ActuatorError> {
        if !(0.0..=1.0).contains(&level) {
            return Err(ActuatorError::OutOfRange);
        }
        if level == 0.0 {
            self.force_off(pins, now_ms)?;
            return Ok(CommandEffect::Applied);
        }

        let starting = self.level == 0.0;
        if starting {
            if let Some(refusal) = self.refusal(now_ms) {
                warn!("GPIO {}: activation {}", self.gpio, refusal);
                return Ok(CommandEffect::Refused(refusal));
            }
        }

        self.write(pins, level)?;
        self.level = level;
        self.resume_level = level;
        if starting {
            if let Some(g) = self.guard.as_mut() {
                g.on_start(now_ms);
            }
        }
        Ok(CommandEffect::Applied)
    }

    /// ON restores the last non-zero level; OFF is level 0.
    pub fn set_on(
        &mut self,
        on: bool,
        pins: &mut impl PinPort,
        now_ms: u64,
    ) -> Result<CommandEffect, ActuatorError> {
        if !on {
            return self.set_level(0.0, pins, now_ms);
        }
        if self.level > 0.0 {
            return Ok(CommandEffect::Applied);
        }
        self.set_level(self.resume_level, pins, now_ms)
    }

    pub fn force_off(&mut self, pins: &mut impl PinPort, now_ms: u64) -> Result<(), ActuatorError> {
        let result = self.write(pins, 0.0);
        self.level = 0.0;
        if let Some(g) = self.guard.as_mut() {
            g.on_stop(now_ms);
        }
        result
    }

    pub fn tick(&mut self, pins: &mut impl PinPort, now_ms: u64) -> Option<DriverEvent> {
        let guard = self.guard.as_ref()?;
        if !(self.level > 0.0 && guard.runtime_exceeded(now_ms)) {
            return None;
        }
        let ran_ms = guard.continuous_runtime_ms(now_ms);
        if let Err(e) = self.force_off(pins, now_ms) {
            warn!("GPIO {}: cutoff write failed ({e})", self.gpio);
        }
        Some(DriverEvent::RuntimeCutoff { ran_ms })
    }

    pub fn refusal(&self, now_ms: u64) -> Option<Refusal> {
        self.guard.as_ref().and_then(|g| g.can_activate(now_ms).err())
    }

    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn guard(&self) -> Option<&DutyCycleGuard> {
        self.guard.as_ref()
    }

    fn write(&self, pins: &mut impl PinPort, level: f32) -> Result<(), ActuatorError> {
        pins.write_pwm(self.gpio, self.duty_for(level), self.resolution_bits)
            .map_err(|_| ActuatorError::HardwareFault)
    }
}
