//! Motorised ball valve on two direction pins, no position feedback.
//!
//! ```text
//!   primary GPIO (open)  ──┐      ┌── aux GPIO (close)
//!                          ▼      ▼
//!                      [ H-bridge / relays ]──▶ valve motor
//! ```
//!
//! Position is dead-reckoned from drive time: a full CLOSED→OPEN stroke
//! takes `transition_ms`, partial strokes take the proportional share.
//! `tick()` advances the estimate and drops both pins once the computed
//! travel time has elapsed.  Both pins are never driven at once.

use log::{debug, warn};
use serde::Serialize;

use crate::app::ports::PinPort;
use crate::drivers::actuator::{ActuatorConfig, CommandEffect, DriverEvent};
use crate::error::ActuatorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValvePosition {
    Closed,
    Mid,
    Open,
}

impl ValvePosition {
    pub const fn fraction(self) -> f32 {
        match self {
            Self::Closed => 0.0,
            Self::Mid => 0.5,
            Self::Open => 1.0,
        }
    }

    /// Nearest discrete position for an estimated travel fraction.
    pub fn nearest(fraction: f32) -> Self {
        if fraction < 0.25 {
            Self::Closed
        } else if fraction <= 0.75 {
            Self::Mid
        } else {
            Self::Open
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Motion {
    from: f32,
    target: ValvePosition,
    started_ms: u64,
    duration_ms: u64,
}

pub struct ValveDriver {
    open_gpio: u8,
    close_gpio: u8,
    inverted: bool,
    transition_ms: u32,
    /// Estimated travel, 0.0 = closed, 1.0 = open.
    fraction: f32,
    motion: Option<Motion>,
    default_position: ValvePosition,
}

impl ValveDriver {
    /// `config.aux_gpio` is guaranteed by validation for valves.
    pub fn new(config: &ActuatorConfig, close_gpio: u8, transition_ms: u32) -> Self {
        Self {
            open_gpio: config.gpio,
            close_gpio,
            inverted: config.inverted,
            transition_ms,
            fraction: 0.0,
            motion: None,
            default_position: ValvePosition::nearest(config.default_state),
        }
    }

    /// Assume CLOSED with the drive off, then travel to the boot position
    /// unless the valve starts stopped.
    pub fn begin(
        &mut self,
        pins: &mut impl PinPort,
        start_stopped: bool,
        now_ms: u64,
    ) -> Result<(), ActuatorError> {
        self.drive(pins, 0)?;
        self.fraction = 0.0;
        self.motion = None;
        if !start_stopped && self.default_position != ValvePosition::Closed {
            self.move_to_position(self.default_position, pins, now_ms)?;
        }
        Ok(())
    }

    pub fn move_to_position(
        &mut self,
        target: ValvePosition,
        pins: &mut impl PinPort,
        now_ms: u64,
    ) -> Result<CommandEffect, ActuatorError> {
        self.update_estimate(now_ms);
        if let Some(m) = self.motion {
            if m.target == target {
                return Ok(CommandEffect::Applied);
            }
        }

        let delta = target.fraction() - self.fraction;
        if delta.abs() < f32::EPSILON {
            self.halt(pins, now_ms)?;
            return Ok(CommandEffect::Applied);
        }

        let duration_ms = (delta.abs() * self.transition_ms as f32).round() as u64;
        let direction = if delta > 0.0 { 1 } else { -1 };
        // Break before make: release the opposite pin first.
        self.drive(pins, 0)?;
        self.drive(pins, direction)?;
        debug!(
            "valve {}: {:.2} -> {:?} over {} ms",
            self.open_gpio, self.fraction, target, duration_ms
        );
        self.motion = Some(Motion {
            from: self.fraction,
            target,
            started_ms: now_ms,
            duration_ms,
        });
        Ok(CommandEffect::Applied)
    }

    /// Stop the motor where it is.
    pub fn halt(&mut self, pins: &mut impl PinPort, now_ms: u64) -> Result<(), ActuatorError> {
        self.update_estimate(now_ms);
        self.motion = None;
        self.drive(pins, 0)
    }

    pub fn tick(&mut self, pins: &mut impl PinPort, now_ms: u64) -> Option<DriverEvent> {
        let motion = self.motion?;
        if now_ms.saturating_sub(motion.started_ms) < motion.duration_ms {
            self.update_estimate(now_ms);
            return None;
        }
        self.fraction = motion.target.fraction();
        self.motion = None;
        if let Err(e) = self.drive(pins, 0) {
            warn!("valve {}: halt write failed ({e})", self.open_gpio);
        }
        Some(DriverEvent::ValveSettled(motion.target))
    }

    pub fn position(&self) -> ValvePosition {
        ValvePosition::nearest(self.fraction)
    }

    pub fn fraction(&self) -> f32 {
        self.fraction
    }

    pub fn is_moving(&self) -> bool {
        self.motion.is_some()
    }

    pub fn target(&self) -> Option<ValvePosition> {
        self.motion.map(|m| m.target)
    }

    pub fn close_gpio(&self) -> u8 {
        self.close_gpio
    }

    fn update_estimate(&mut self, now_ms: u64) {
        if let Some(m) = self.motion {
            let elapsed = now_ms.saturating_sub(m.started_ms);
            let progress = if m.duration_ms == 0 {
                1.0
            } else {
                (elapsed as f32 / m.duration_ms as f32).min(1.0)
            };
            self.fraction = m.from + (m.target.fraction() - m.from) * progress;
        }
    }

    /// `direction`: 1 = opening, -1 = closing, 0 = both pins released.
    fn drive(&self, pins: &mut impl PinPort, direction: i8) -> Result<(), ActuatorError> {
        let (open, close) = match direction {
            1 => (true, false),
            -1 => (false, true),
            _ => (false, false),
        };
        pins.write_digital(self.close_gpio, close != self.inverted)
            .and_then(|()| pins.write_digital(self.open_gpio, open != self.inverted))
            .map_err(|_| ActuatorError::HardwareFault)
    }
}
