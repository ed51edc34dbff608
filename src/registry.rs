//! Actuator registry. Owns every configured driver.
//!
//! Responsibilities:
//! - validate configuration items against GPIO ownership before any
//!   driver is built (all-or-nothing per item),
//! - route commands to drivers, gated on the emergency state,
//! - force stops on behalf of the [`SafetyController`],
//! - publish status / response / alert messages through the transport.
//!
//! The registry never re-enables an actuator on its own: latches are
//! released only through the safety controller.

use log::{error, info, warn};

use crate::app::ports::{MessagingPort, PinOwner, PinPort, Qos, MAX_ACTUATORS};
use crate::config::SystemConfig;
use crate::drivers::actuator::{ActuatorConfig, ActuatorDriver, ActuatorRuntimeState, CommandEffect, DriverEvent};
use crate::drivers::protection::DutyCycleGuard;
use crate::error::{ActuatorError, ConfigRejection, PinError, RejectionCode, SafetyError};
use crate::protocol::{self, ActuatorCommand, AlertMsg, ResponseMsg, StatusMsg, Topics};
use crate::safety::{EmergencyState, SafetyController};
use crate::transport::TransportClient;

/// Result of applying one configuration item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureOutcome {
    Created,
    Replaced,
    Removed,
}

pub struct ActuatorRegistry {
    drivers: heapless::Vec<ActuatorDriver, MAX_ACTUATORS>,
    system: SystemConfig,
    topics: Topics,
    /// Set by a system-wide stop; released only by a verified clear.
    stop_all_latched: bool,
    /// Guards of removed actuators, handed to whatever is next configured
    /// on the same GPIO.
    retired: heapless::Vec<(u8, DutyCycleGuard), MAX_ACTUATORS>,
}

impl ActuatorRegistry {
    pub fn new(system: SystemConfig, topics: Topics) -> Self {
        Self {
            drivers: heapless::Vec::new(),
            system,
            topics,
            stop_all_latched: false,
            retired: heapless::Vec::new(),
        }
    }

    // ── Configuration ─────────────────────────────────────────────

    /// Apply one configuration item.
    ///
    /// Rejects with `GPIO_CONFLICT` if any pin is held by another owner.
    /// A rejected item leaves the previous driver and all pin claims as
    /// they were.  During an emergency the new driver starts latched and
    /// de-energised.
    pub fn configure(
        &mut self,
        config: ActuatorConfig,
        emergency_active: bool,
        pins: &mut impl PinPort,
        now_ms: u64,
    ) -> Result<ConfigureOutcome, ConfigRejection> {
        config.validate()?;
        let gpio = config.gpio;

        if !config.active {
            return match self.remove(gpio, pins, now_ms) {
                Ok(()) | Err(ActuatorError::NotFound) => Ok(ConfigureOutcome::Removed),
                Err(_) => Err(ConfigRejection::new(
                    RejectionCode::ValidationFailed,
                    "could not release actuator",
                )),
            };
        }

        let owner = PinOwner::Actuator { slot: gpio };
        for pin in config.gpios() {
            if let Some(other) = pins.owner_of(pin) {
                if other != owner {
                    warn!("configure GPIO {gpio}: pin {pin} already held by {other}");
                    return Err(ConfigRejection::new(
                        RejectionCode::GpioConflict,
                        "gpio already claimed",
                    ));
                }
            }
        }

        let existing = self.index_of(gpio);
        if existing.is_none() && self.drivers.is_full() {
            return Err(ConfigRejection::new(
                RejectionCode::ValidationFailed,
                "actuator table full",
            ));
        }

        // Claim new pins first so a failure leaves the old driver intact.
        let mut claimed: heapless::Vec<u8, 2> = heapless::Vec::new();
        for pin in config.gpios() {
            if pins.owner_of(pin) == Some(owner) {
                continue;
            }
            if let Err(e) = pins.reserve_pin(pin, owner) {
                for &p in &claimed {
                    pins.release_pin(p);
                }
                return Err(reservation_rejection(gpio, e));
            }
            let _ = claimed.push(pin);
        }

        if let Some(i) = existing {
            if let Err(e) = self.drivers[i].emergency_stop("reconfigure", pins, now_ms) {
                warn!("configure GPIO {gpio}: old driver shutdown write failed ({e})");
            }
        }

        // Protection bookkeeping outlives the driver: read it after the
        // old run has been closed by the stop above.
        let previous = match existing {
            Some(i) => self.drivers[i]
                .guard()
                .cloned()
                .or_else(|| self.retired_guard(gpio)),
            None => self.retired_guard(gpio),
        };
        let mut driver = ActuatorDriver::new(config, &self.system, previous.as_ref());
        let start_stopped = emergency_active || self.stop_all_latched;
        if let Err(e) = driver.begin(pins, start_stopped, now_ms) {
            error!("configure GPIO {gpio}: begin failed ({e})");
            for &p in &claimed {
                pins.release_pin(p);
            }
            return Err(ConfigRejection::new(
                RejectionCode::ValidationFailed,
                "output initialisation failed",
            ));
        }

        match existing {
            Some(i) => {
                let new_pins = driver.config().gpios();
                for old in self.drivers[i].config().gpios() {
                    if !new_pins.contains(&old) {
                        pins.release_pin(old);
                    }
                }
                if driver.guard().is_some() {
                    self.retired.retain(|(g, _)| *g != gpio);
                } else if let Some(old) = self.drivers[i].guard().cloned() {
                    self.retire_guard(gpio, old);
                }
                self.drivers[i] = driver;
                info!("GPIO {gpio}: actuator replaced");
                Ok(ConfigureOutcome::Replaced)
            }
            None => {
                // Capacity checked above.
                let _ = self.drivers.push(driver);
                self.retired.retain(|(g, _)| *g != gpio);
                info!("GPIO {gpio}: actuator created ({} total)", self.drivers.len());
                Ok(ConfigureOutcome::Created)
            }
        }
    }

    /// De-energise, release every pin, and drop the driver.
    pub fn remove(
        &mut self,
        gpio: u8,
        pins: &mut impl PinPort,
        now_ms: u64,
    ) -> Result<(), ActuatorError> {
        let i = self.index_of(gpio).ok_or(ActuatorError::NotFound)?;
        let mut driver = self.drivers.remove(i);
        if let Err(e) = driver.emergency_stop("removed", pins, now_ms) {
            warn!("remove GPIO {gpio}: shutdown write failed ({e})");
        }
        for pin in driver.config().gpios() {
            pins.release_pin(pin);
        }
        if let Some(guard) = driver.guard() {
            self.retire_guard(gpio, guard.clone());
        }
        info!("GPIO {gpio}: actuator removed");
        Ok(())
    }

    fn retired_guard(&self, gpio: u8) -> Option<DutyCycleGuard> {
        self.retired
            .iter()
            .find(|(g, _)| *g == gpio)
            .map(|(_, guard)| guard.clone())
    }

    fn retire_guard(&mut self, gpio: u8, guard: DutyCycleGuard) {
        self.retired.retain(|(g, _)| *g != gpio);
        if self.retired.is_full() {
            self.retired.remove(0);
        }
        let _ = self.retired.push((gpio, guard));
    }

    // ── Commands ──────────────────────────────────────────────────

    /// Apply a control command and publish its response (and status on
    /// change, alert on refusal).
    pub fn handle_command<M: MessagingPort>(
        &mut self,
        gpio: u8,
        command: ActuatorCommand,
        emergency: EmergencyState,
        pins: &mut impl PinPort,
        link: &mut TransportClient<M>,
        now_ms: u64,
    ) -> Result<CommandEffect, ActuatorError> {
        let result = self.apply_command(gpio, command, emergency, pins, now_ms);
        let value = self.get(gpio).map(|d| d.status(now_ms).value);

        match &result {
            Ok(CommandEffect::Applied) => {
                self.publish_response(gpio, command.name(), value, true, "ok", emergency, link, now_ms);
                self.publish_status(gpio, link, now_ms);
            }
            Ok(CommandEffect::Refused(refusal)) => {
                let mut msg = heapless::String::<80>::new();
                let _ = core::fmt::Write::write_fmt(&mut msg, format_args!("{refusal}"));
                self.publish_response(gpio, command.name(), value, false, &msg, emergency, link, now_ms);
                self.publish_alert(gpio, refusal.alert_type(), &msg, link, now_ms);
            }
            Err(e) => {
                self.publish_response(gpio, command.name(), value, false, e.as_str(), emergency, link, now_ms);
            }
        }
        result
    }

    fn apply_command(
        &mut self,
        gpio: u8,
        command: ActuatorCommand,
        emergency: EmergencyState,
        pins: &mut impl PinPort,
        now_ms: u64,
    ) -> Result<CommandEffect, ActuatorError> {
        // Emergency gate comes before any driver is touched.
        if emergency != EmergencyState::Normal {
            return Err(ActuatorError::EmergencyActive);
        }
        let driver = self.get_mut(gpio).ok_or(ActuatorError::NotFound)?;
        match command {
            ActuatorCommand::On => driver.set_binary(true, pins, now_ms),
            ActuatorCommand::Off => driver.set_binary(false, pins, now_ms),
            ActuatorCommand::Toggle => driver.toggle(pins, now_ms),
            ActuatorCommand::Set(v) => driver.set_value(v, pins, now_ms),
        }
    }

    /// Answer a command that never reached a driver (rate limit, parse
    /// failure).
    pub fn reject_command<M: MessagingPort>(
        &self,
        gpio: u8,
        command: &str,
        error: ActuatorError,
        emergency: EmergencyState,
        link: &mut TransportClient<M>,
        now_ms: u64,
    ) {
        let value = self.get(gpio).map(|d| d.status(now_ms).value);
        self.publish_response(gpio, command, value, false, error.as_str(), emergency, link, now_ms);
    }

    // ── Emergency paths ───────────────────────────────────────────

    /// Force every driver off and latch it.  Returns how many drivers were
    /// stopped.  Individual write failures do not stop the sweep.
    pub fn emergency_stop_all<M: MessagingPort>(
        &mut self,
        reason: &str,
        pins: &mut impl PinPort,
        link: &mut TransportClient<M>,
        now_ms: u64,
    ) -> usize {
        self.stop_all_latched = true;
        for i in 0..self.drivers.len() {
            let gpio = self.drivers[i].gpio();
            if let Err(e) = self.drivers[i].emergency_stop(reason, pins, now_ms) {
                error!("GPIO {gpio}: emergency stop output failed ({e})");
            }
            self.publish_alert(gpio, "emergency_stop", reason, link, now_ms);
            self.publish_status(gpio, link, now_ms);
        }
        self.drivers.len()
    }

    pub fn emergency_stop_actuator<M: MessagingPort>(
        &mut self,
        gpio: u8,
        reason: &str,
        pins: &mut impl PinPort,
        link: &mut TransportClient<M>,
        now_ms: u64,
    ) -> Result<(), ActuatorError> {
        let driver = self.get_mut(gpio).ok_or(ActuatorError::NotFound)?;
        let result = driver.emergency_stop(reason, pins, now_ms);
        self.publish_alert(gpio, "emergency_stop", reason, link, now_ms);
        self.publish_status(gpio, link, now_ms);
        result
    }

    /// Release the system-wide latch.  Drivers stay individually latched
    /// until re-enabled one by one.
    pub fn clear_emergency_flags(&mut self) {
        self.stop_all_latched = false;
    }

    /// Delegates to the safety controller's verified clear.
    pub fn clear_emergency_stop<M: MessagingPort>(
        &mut self,
        safety: &mut SafetyController,
        link: &mut TransportClient<M>,
        now_ms: u64,
    ) -> Result<(), SafetyError> {
        safety.clear_emergency_stop(self, link, now_ms)
    }

    /// Delegates to the safety controller's sequenced resume.
    pub fn resume_operation<M: MessagingPort>(
        &mut self,
        safety: &mut SafetyController,
        link: &mut TransportClient<M>,
        now_ms: u64,
    ) -> Result<(), SafetyError> {
        safety.resume_operation(self, link, now_ms)
    }

    /// De-energised and still owning its pins.
    pub fn verify_actuator_safety(&self, gpio: u8, pins: &impl PinPort) -> Result<(), SafetyError> {
        let driver = self.get(gpio).ok_or(SafetyError::ActuatorUnsafe(gpio))?;
        if driver.verify_safe(pins) {
            Ok(())
        } else {
            Err(SafetyError::ActuatorUnsafe(gpio))
        }
    }

    /// Release one driver's latch.  Only the safety controller calls this.
    pub(crate) fn reenable(&mut self, gpio: u8) -> Result<(), SafetyError> {
        if self.stop_all_latched {
            return Err(SafetyError::InvalidState(EmergencyState::Active));
        }
        let driver = self.get_mut(gpio).ok_or(SafetyError::ActuatorUnsafe(gpio))?;
        driver
            .clear_emergency()
            .map_err(|_| SafetyError::ActuatorUnsafe(gpio))
    }

    /// Latched drivers in resume order: critical first (if requested),
    /// otherwise configuration order.
    pub fn resume_order(&self, critical_first: bool) -> heapless::Vec<u8, MAX_ACTUATORS> {
        let mut order: heapless::Vec<u8, MAX_ACTUATORS> = heapless::Vec::new();
        let latched = self.drivers.iter().filter(|d| d.is_emergency_stopped());
        if critical_first {
            for d in latched.clone().filter(|d| d.config().critical) {
                let _ = order.push(d.gpio());
            }
            for d in latched.filter(|d| !d.config().critical) {
                let _ = order.push(d.gpio());
            }
        } else {
            for d in latched {
                let _ = order.push(d.gpio());
            }
        }
        order
    }

    // ── Periodic ──────────────────────────────────────────────────

    /// Advance every driver.  Publishes what the drivers did on their own.
    pub fn tick<M: MessagingPort>(
        &mut self,
        pins: &mut impl PinPort,
        link: &mut TransportClient<M>,
        now_ms: u64,
    ) -> heapless::Vec<(u8, DriverEvent), MAX_ACTUATORS> {
        let mut events = heapless::Vec::new();
        for i in 0..self.drivers.len() {
            let Some(event) = self.drivers[i].tick(pins, now_ms) else {
                continue;
            };
            let gpio = self.drivers[i].gpio();
            if let DriverEvent::RuntimeCutoff { ran_ms } = event {
                let mut msg = heapless::String::<64>::new();
                let _ = core::fmt::Write::write_fmt(
                    &mut msg,
                    format_args!("max runtime reached after {ran_ms} ms"),
                );
                self.publish_alert(gpio, "runtime_limit", &msg, link, now_ms);
            }
            self.publish_status(gpio, link, now_ms);
            let _ = events.push((gpio, event));
        }
        events
    }

    // ── Publishing ────────────────────────────────────────────────

    pub fn publish_status<M: MessagingPort>(&self, gpio: u8, link: &mut TransportClient<M>, now_ms: u64) {
        let Some(driver) = self.get(gpio) else {
            return;
        };
        let state = driver.status(now_ms);
        let cfg = driver.config();
        let payload = protocol::encode(&StatusMsg {
            state: &state,
            name: &cfg.name,
            zone: &cfg.zone,
            ts: now_ms,
        });
        send(link, &self.topics.status(gpio), &payload, Qos::AtMostOnce, 0, now_ms);
    }

    pub fn publish_all_status<M: MessagingPort>(&self, link: &mut TransportClient<M>, now_ms: u64) {
        for d in &self.drivers {
            self.publish_status(d.gpio(), link, now_ms);
        }
    }

    pub fn publish_response<M: MessagingPort>(
        &self,
        gpio: u8,
        command: &str,
        value: Option<f32>,
        success: bool,
        message: &str,
        emergency: EmergencyState,
        link: &mut TransportClient<M>,
        now_ms: u64,
    ) {
        let payload = protocol::encode(&ResponseMsg {
            gpio,
            command,
            value,
            success,
            message,
            emergency_state: emergency,
            ts: now_ms,
        });
        send(link, &self.topics.response(gpio), &payload, Qos::AtLeastOnce, 1, now_ms);
    }

    pub fn publish_alert<M: MessagingPort>(
        &self,
        gpio: u8,
        alert_type: &str,
        message: &str,
        link: &mut TransportClient<M>,
        now_ms: u64,
    ) {
        let payload = protocol::encode(&AlertMsg {
            gpio,
            alert_type,
            message,
            ts: now_ms,
        });
        send(link, &self.topics.alert(gpio), &payload, Qos::AtLeastOnce, 1, now_ms);
    }

    // ── Accessors ─────────────────────────────────────────────────

    pub fn get(&self, gpio: u8) -> Option<&ActuatorDriver> {
        self.drivers.iter().find(|d| d.gpio() == gpio)
    }

    fn get_mut(&mut self, gpio: u8) -> Option<&mut ActuatorDriver> {
        self.drivers.iter_mut().find(|d| d.gpio() == gpio)
    }

    fn index_of(&self, gpio: u8) -> Option<usize> {
        self.drivers.iter().position(|d| d.gpio() == gpio)
    }

    pub fn status(&self, gpio: u8, now_ms: u64) -> Option<ActuatorRuntimeState> {
        self.get(gpio).map(|d| d.status(now_ms))
    }

    pub fn configs(&self) -> heapless::Vec<ActuatorConfig, MAX_ACTUATORS> {
        self.drivers.iter().map(|d| d.config().clone()).collect()
    }

    pub fn gpios(&self) -> impl Iterator<Item = u8> + '_ {
        self.drivers.iter().map(ActuatorDriver::gpio)
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn is_stop_all_latched(&self) -> bool {
        self.stop_all_latched
    }
}

/// Pin reservation failed after the ownership pre-check passed: the
/// capability and the registry disagree about who owns the pin.
fn reservation_rejection(gpio: u8, e: PinError) -> ConfigRejection {
    match e {
        PinError::AlreadyClaimed { pin, owner } => {
            error!("GPIO {gpio}: ownership divergence, pin {pin} claimed by {owner}");
            ConfigRejection::new(RejectionCode::GpioConflict, "gpio already claimed")
        }
        PinError::InvalidPin(_) => {
            ConfigRejection::new(RejectionCode::OutOfRange, "gpio is not assignable")
        }
        _ => ConfigRejection::new(RejectionCode::ValidationFailed, "gpio reservation failed"),
    }
}

pub(crate) fn send<M: MessagingPort>(
    link: &mut TransportClient<M>,
    topic: &str,
    payload: &[u8],
    qos: Qos,
    retries: u8,
    now_ms: u64,
) {
    if let Err(e) = link.publish(topic, payload, qos, retries, now_ms) {
        warn!("publish {topic}: {e}");
    }
}
