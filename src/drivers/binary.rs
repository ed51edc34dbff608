//! On/off load driver (relay, pump contactor).
//!
//! One digital output.  Pumps always carry a [`DutyCycleGuard`]; plain
//! relays only when their configuration supplies a policy.
//!
//! The guard is consulted on every off→on transition, and `tick()` cuts
//! the output itself once the continuous-runtime cap is reached, so the
//! limit holds even if the controller never sends OFF.

use log::{info, warn};

use crate::app::ports::PinPort;
use crate::drivers::actuator::{ActuatorConfig, CommandEffect, DriverEvent};
use crate::drivers::protection::{DutyCycleGuard, Refusal};
use crate::error::ActuatorError;

pub struct BinaryDriver {
    gpio: u8,
    inverted: bool,
    on: bool,
    guard: Option<DutyCycleGuard>,
}

impl BinaryDriver {
    pub fn new(config: &ActuatorConfig, guard: Option<DutyCycleGuard>) -> Self {
        Self {
            gpio: config.gpio,
            inverted: config.inverted,
            on: false,
            guard,
        }
    }

    /// Drive the output to its de-energised level.
    pub fn begin(&mut self, pins: &mut impl PinPort, now_ms: u64) -> Result<(), ActuatorError> {
        self.write(pins, false)?;
        self.on = false;
        if let Some(g) = self.guard.as_mut() {
            g.on_stop(now_ms);
        }
        Ok(())
    }

    pub fn set(
        &mut self,
        on: bool,
        pins: &mut impl PinPort,
        now_ms: u64,
    ) -> Result<CommandEffect, ActuatorError> {
        if on == self.on {
            return Ok(CommandEffect::Applied);
        }

        if on {
            if let Some(refusal) = self.refusal(now_ms) {
                warn!("GPIO {}: activation {}", self.gpio, refusal);
                return Ok(CommandEffect::Refused(refusal));
            }
            self.write(pins, true)?;
            self.on = true;
            if let Some(g) = self.guard.as_mut() {
                g.on_start(now_ms);
            }
        } else {
            self.force_off(pins, now_ms)?;
        }
        Ok(CommandEffect::Applied)
    }

    /// De-energise unconditionally.  The logical state is updated even when
    /// the write fails, so no later path believes the load is still on.
    pub fn force_off(&mut self, pins: &mut impl PinPort, now_ms: u64) -> Result<(), ActuatorError> {
        let result = self.write(pins, false);
        self.on = false;
        if let Some(g) = self.guard.as_mut() {
            g.on_stop(now_ms);
        }
        result
    }

    pub fn tick(&mut self, pins: &mut impl PinPort, now_ms: u64) -> Option<DriverEvent> {
        let guard = self.guard.as_ref()?;
        if !(self.on && guard.runtime_exceeded(now_ms)) {
            return None;
        }
        let ran_ms = guard.continuous_runtime_ms(now_ms);
        info!("GPIO {}: runtime cap reached after {} ms, switching off", self.gpio, ran_ms);
        if let Err(e) = self.force_off(pins, now_ms) {
            warn!("GPIO {}: cutoff write failed ({e})", self.gpio);
        }
        Some(DriverEvent::RuntimeCutoff { ran_ms })
    }

    pub fn refusal(&self, now_ms: u64) -> Option<Refusal> {
        self.guard.as_ref().and_then(|g| g.can_activate(now_ms).err())
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    pub fn guard(&self) -> Option<&DutyCycleGuard> {
        self.guard.as_ref()
    }

    fn write(&self, pins: &mut impl PinPort, on: bool) -> Result<(), ActuatorError> {
        pins.write_digital(self.gpio, on != self.inverted)
            .map_err(|_| ActuatorError::HardwareFault)
    }
}
