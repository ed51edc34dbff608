//! GPIO bank: the [`PinPort`] implementation over `drivers::hw_init`.
//!
//! Keeps the ownership table for every pin on the chip and hands out LEDC
//! channels lazily, the first time a pin receives a PWM duty.  A released
//! pin gives its channel back and returns to its reset state.
//!
//! ```text
//!   reserve_pin ──▶ owner table ──▶ hw_init::configure_output (driven low)
//!   write_pwm   ──▶ channel map ──▶ hw_init::ledc_attach (first use) ──▶ ledc_set
//!   release_pin ──▶ ledc_detach / reset_pin ──▶ owner cleared
//! ```

use log::{debug, warn};

use crate::app::ports::{PinOwner, PinPort};
use crate::drivers::hw_init;
use crate::error::PinError;
use crate::pins::{self, LEDC_CHANNELS, MAX_GPIO, RESERVED_GPIOS, STATUS_LED_GPIO};

const PIN_COUNT: usize = MAX_GPIO as usize + 1;

pub struct GpioBank {
    owners: [Option<PinOwner>; PIN_COUNT],
    /// `channels[ch] = Some(pin)` while `pin` is attached to LEDC channel `ch`.
    channels: [Option<u8>; LEDC_CHANNELS],
    levels: [bool; PIN_COUNT],
    duties: [u32; PIN_COUNT],
}

impl Default for GpioBank {
    fn default() -> Self {
        Self::new()
    }
}

impl GpioBank {
    /// Empty bank with the status LED already held by the system.
    pub fn new() -> Self {
        let mut owners = [None; PIN_COUNT];
        owners[STATUS_LED_GPIO as usize] = Some(PinOwner::System);
        Self {
            owners,
            channels: [None; LEDC_CHANNELS],
            levels: [false; PIN_COUNT],
            duties: [0; PIN_COUNT],
        }
    }

    /// Last level written to `pin`.
    pub fn level(&self, pin: u8) -> Option<bool> {
        self.owners.get(pin as usize)?.map(|_| self.levels[pin as usize])
    }

    /// Last PWM duty written to `pin`.
    pub fn duty(&self, pin: u8) -> Option<u32> {
        self.channel_of(pin).map(|_| self.duties[pin as usize])
    }

    pub fn free_channels(&self) -> usize {
        self.channels.iter().filter(|c| c.is_none()).count()
    }

    fn channel_of(&self, pin: u8) -> Option<u32> {
        self.channels
            .iter()
            .position(|c| *c == Some(pin))
            .map(|ch| ch as u32)
    }

    fn ensure_owned(&self, pin: u8) -> Result<(), PinError> {
        match self.owners.get(pin as usize) {
            Some(Some(_)) => Ok(()),
            Some(None) => Err(PinError::NotReserved(pin)),
            None => Err(PinError::InvalidPin(pin)),
        }
    }

    fn attach_channel(&mut self, pin: u8) -> Result<u32, PinError> {
        if let Some(ch) = self.channel_of(pin) {
            return Ok(ch);
        }
        let Some(slot) = self.channels.iter().position(Option::is_none) else {
            warn!("gpio: no free LEDC channel for GPIO {pin}");
            return Err(PinError::WriteFailed(pin));
        };
        let ch = slot as u32;
        hw_init::ledc_attach(ch, pin).map_err(|e| {
            warn!("gpio: attach GPIO {pin} to LEDC {ch}: {e}");
            PinError::WriteFailed(pin)
        })?;
        self.channels[slot] = Some(pin);
        debug!("gpio: GPIO {pin} on LEDC channel {ch}");
        Ok(ch)
    }
}

impl PinPort for GpioBank {
    fn reserve_pin(&mut self, pin: u8, owner: PinOwner) -> Result<(), PinError> {
        let usable = match owner {
            PinOwner::Actuator { .. } => pins::is_assignable(pin),
            PinOwner::Sensor | PinOwner::System => pin <= MAX_GPIO && !RESERVED_GPIOS.contains(&pin),
        };
        if !usable {
            return Err(PinError::InvalidPin(pin));
        }
        match self.owners[pin as usize] {
            Some(current) if current == owner => return Ok(()),
            Some(current) => return Err(PinError::AlreadyClaimed { pin, owner: current }),
            None => {}
        }
        if matches!(owner, PinOwner::Actuator { .. }) {
            hw_init::configure_output(pin).map_err(|e| {
                warn!("gpio: configure GPIO {pin}: {e}");
                PinError::WriteFailed(pin)
            })?;
            self.levels[pin as usize] = false;
        }
        self.owners[pin as usize] = Some(owner);
        debug!("gpio: GPIO {pin} reserved by {owner}");
        Ok(())
    }

    fn release_pin(&mut self, pin: u8) {
        let Some(slot) = self.owners.get_mut(pin as usize) else {
            return;
        };
        if slot.take().is_none() {
            return;
        }
        if let Some(ch) = self.channel_of(pin) {
            hw_init::ledc_detach(ch);
            self.channels[ch as usize] = None;
        }
        hw_init::reset_pin(pin);
        self.levels[pin as usize] = false;
        self.duties[pin as usize] = 0;
        debug!("gpio: GPIO {pin} released");
    }

    fn owner_of(&self, pin: u8) -> Option<PinOwner> {
        self.owners.get(pin as usize).copied().flatten()
    }

    fn write_digital(&mut self, pin: u8, high: bool) -> Result<(), PinError> {
        self.ensure_owned(pin)?;
        hw_init::gpio_write(pin, high).map_err(|_| PinError::WriteFailed(pin))?;
        self.levels[pin as usize] = high;
        Ok(())
    }

    fn write_pwm(&mut self, pin: u8, duty: u32, resolution_bits: u8) -> Result<(), PinError> {
        self.ensure_owned(pin)?;
        let max = (1u32 << resolution_bits.min(20)) - 1;
        let duty = duty.min(max);
        let ch = self.attach_channel(pin)?;
        hw_init::ledc_set(ch, duty).map_err(|_| PinError::WriteFailed(pin))?;
        self.duties[pin as usize] = duty;
        Ok(())
    }
}
