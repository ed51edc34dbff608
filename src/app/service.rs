//! Application service, the hexagonal core.
//!
//! [`AppService`] owns the transport client, the actuator registry and the
//! safety controller, and wires them to the broker.  Pins, storage and the
//! event sink are passed in at every call, so the whole service runs
//! against mock adapters on the host.
//!
//! ```text
//!                 ┌──────────────────────────────────────┐
//!  MessagingPort ◀┤ TransportClient                      │
//!                 │   ▲ publish        │ inbound         │
//!                 │   │                ▼                 │
//!                 │ ActuatorRegistry ◀─ AppCommand::route├──▶ EventSink
//!       PinPort ◀─┤   ▲                                  │
//!                 │ SafetyController (sole writer of     │
//!    ConfigPort ◀─┤   EmergencyState)                    │
//!                 └──────────────────────────────────────┘
//! ```
//!
//! One call to [`AppService::tick`] per control-loop iteration.  Nothing in
//! it blocks beyond the bounded in-place publish retry.

use core::fmt::{self, Write as _};
use std::time::Duration;

use burster::Limiter;
use log::{info, warn};

use crate::config::SystemConfig;
use crate::drivers::actuator::{CommandEffect, DriverEvent};
use crate::error::{ActuatorError, ConfigRejection, RejectionCode, SafetyError};
use crate::protocol::{
    self, ConfigErrorEntry, ConfigItem, ConfigResponseMsg, EmergencyAction, EmergencyRequest,
    HeartbeatMsg, Topics,
};
use crate::registry::{self, ActuatorRegistry, ConfigureOutcome};
use crate::safety::{EmergencyState, ResumeStep, SafetyController, StopSource};
use crate::transport::{LinkEvent, TransportClient};

use super::commands::AppCommand;
use super::events::{EventCode, Severity};
use super::ports::{ConfigPort, EventSink, InboundMessage, MessagingPort, PinPort, Qos, StoreError};

/// Inbound messages handled per tick; the rest wait for the next one.
pub const MAX_INBOUND_PER_TICK: usize = 8;
/// Emergency-lane messages handled per tick, ahead of the routine budget.
/// Covers a full urgent lane plus its latched stop.
pub const MAX_URGENT_PER_TICK: usize = 8;

type Note = heapless::String<96>;

fn note(args: fmt::Arguments<'_>) -> Note {
    let mut s = Note::new();
    let _ = s.write_fmt(args);
    s
}

// ───────────────────────────────────────────────────────────────
// AppService
// ───────────────────────────────────────────────────────────────

pub struct AppService<M: MessagingPort> {
    config: SystemConfig,
    link: TransportClient<M>,
    registry: ActuatorRegistry,
    safety: SafetyController,
    /// Budget for actuator and configuration commands.
    limiter: burster::TokenBucket<fn() -> Duration>,
    started_ms: u64,
    last_status_ms: u64,
    dropped_seen: u32,
}

impl<M: MessagingPort> AppService<M> {
    /// Build the service.  An empty configured client id is replaced by
    /// `device_id`.  `clock` feeds the command rate limiter.
    pub fn new(port: M, config: SystemConfig, device_id: &str, clock: fn() -> Duration) -> Self {
        let mut connection = config.connection.clone();
        if connection.client_id.is_empty() {
            let _ = connection.client_id.push_str(device_id);
        }
        let topics = Topics::new(&config.topic_prefix, &connection.client_id);
        info!("AppService: base topic {}", topics.base());

        Self {
            link: TransportClient::new(port, connection, &config.transport),
            registry: ActuatorRegistry::new(config.clone(), topics),
            safety: SafetyController::new(config.recovery.clone()),
            limiter: burster::TokenBucket::new_with_time_provider(
                u64::from(config.command_rate_per_sec),
                u64::from(config.command_burst),
                clock,
            ),
            config,
            started_ms: 0,
            last_status_ms: 0,
            dropped_seen: 0,
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Restore stored actuators, register subscriptions and make the first
    /// connection attempt.  A failed connect is retried by [`tick`](Self::tick).
    pub fn start(
        &mut self,
        pins: &mut impl PinPort,
        store: &impl ConfigPort,
        sink: &mut impl EventSink,
        now_ms: u64,
    ) {
        self.started_ms = now_ms;
        self.last_status_ms = now_ms;

        match store.load_actuators() {
            Ok(stored) => {
                for cfg in stored {
                    let gpio = cfg.gpio;
                    if let Err(rej) = self.registry.configure(cfg, false, pins, now_ms) {
                        sink.record(
                            Severity::Warning,
                            EventCode::ConfigRejected,
                            &note(format_args!("stored GPIO {gpio}: {rej}")),
                        );
                    }
                }
                info!("restored {} actuator(s) from storage", self.registry.len());
            }
            Err(StoreError::NotFound) => info!("no stored actuators (first boot)"),
            Err(e) => sink.record(
                Severity::Error,
                EventCode::StorageFailed,
                &note(format_args!("actuator restore: {e}")),
            ),
        }

        for topic in self.registry.topics().subscriptions() {
            if let Err(e) = self.link.subscribe(&topic, Qos::AtLeastOnce) {
                warn!("subscribe {topic}: {e}");
            }
        }

        match self.link.connect(now_ms) {
            Ok(Some(flushed)) => self.on_link_event(LinkEvent::Connected { flushed }, sink, now_ms),
            Ok(None) => info!("broker handshake started"),
            Err(e) => sink.record(
                Severity::Warning,
                EventCode::ReconnectFailed,
                &note(format_args!("initial connect: {e}")),
            ),
        }

        sink.record(
            Severity::Info,
            EventCode::Started,
            &note(format_args!("{} actuator(s), state {}", self.registry.len(), self.safety.state())),
        );
    }

    // ── Per-tick orchestration ────────────────────────────────────

    /// One control-loop iteration: link upkeep → inbound (emergency first)
    /// → drivers → resume sequence → heartbeat / periodic status.
    pub fn tick(
        &mut self,
        pins: &mut impl PinPort,
        store: &mut impl ConfigPort,
        sink: &mut impl EventSink,
        now_ms: u64,
    ) {
        if let Some(event) = self.link.poll(now_ms) {
            self.on_link_event(event, sink, now_ms);
        }

        let default_policy = self.config.default_protection;

        // Dedicated emergency lane first, so a stop never waits behind
        // routine traffic.
        for _ in 0..MAX_URGENT_PER_TICK {
            let Some(msg) = self.link.next_urgent() else { break };
            if let Some(cmd) = AppCommand::route(self.registry.topics(), &msg, &default_policy) {
                self.handle_command(cmd, pins, store, sink, now_ms);
            }
        }

        // Ports with a single queue still get emergencies handled first.
        let mut urgent: heapless::Vec<AppCommand, MAX_INBOUND_PER_TICK> = heapless::Vec::new();
        let mut routine: heapless::Vec<AppCommand, MAX_INBOUND_PER_TICK> = heapless::Vec::new();
        for _ in 0..MAX_INBOUND_PER_TICK {
            let Some(msg) = self.link.next_inbound() else { break };
            let Some(cmd) = AppCommand::route(self.registry.topics(), &msg, &default_policy) else {
                continue;
            };
            let lane = if cmd.is_emergency() { &mut urgent } else { &mut routine };
            // At most MAX_INBOUND_PER_TICK pushes in total.
            let _ = lane.push(cmd);
        }
        for cmd in urgent.into_iter().chain(routine) {
            self.handle_command(cmd, pins, store, sink, now_ms);
        }

        for (gpio, event) in self.registry.tick(pins, &mut self.link, now_ms) {
            if let DriverEvent::RuntimeCutoff { ran_ms } = event {
                sink.record(
                    Severity::Warning,
                    EventCode::RuntimeCutoff,
                    &note(format_args!("GPIO {gpio} stopped after {ran_ms} ms")),
                );
            }
        }

        for step in self.safety.tick(&mut self.registry, &*pins, &mut self.link, now_ms) {
            match step {
                ResumeStep::Resumed(gpio) => sink.record(
                    Severity::Info,
                    EventCode::ActuatorResumed,
                    &note(format_args!("GPIO {gpio}")),
                ),
                ResumeStep::Skipped(gpio) => sink.record(
                    Severity::Warning,
                    EventCode::ActuatorResumeSkipped,
                    &note(format_args!("GPIO {gpio} failed verification")),
                ),
                ResumeStep::Complete => {
                    sink.record(Severity::Info, EventCode::ResumeComplete, "state NORMAL");
                }
            }
        }

        self.send_heartbeat(now_ms);

        let interval_ms = u64::from(self.config.status_interval_secs) * 1_000;
        if self.link.is_connected() && now_ms.saturating_sub(self.last_status_ms) >= interval_ms {
            self.last_status_ms = now_ms;
            self.registry.publish_all_status(&mut self.link, now_ms);
        }

        let dropped = self.link.stats().dropped;
        if dropped > self.dropped_seen {
            sink.record(
                Severity::Warning,
                EventCode::MessageDropped,
                &note(format_args!("{} queued message(s) evicted", dropped - self.dropped_seen)),
            );
            self.dropped_seen = dropped;
        }
    }

    /// Feed one raw broker message through routing and handling, outside
    /// the normal drain.  Unknown topics are ignored.
    pub fn handle_message(
        &mut self,
        msg: &InboundMessage,
        pins: &mut impl PinPort,
        store: &mut impl ConfigPort,
        sink: &mut impl EventSink,
        now_ms: u64,
    ) {
        let default_policy = self.config.default_protection;
        if let Some(cmd) = AppCommand::route(self.registry.topics(), msg, &default_policy) {
            self.handle_command(cmd, pins, store, sink, now_ms);
        }
    }

    // ── Command handling ──────────────────────────────────────────

    pub fn handle_command(
        &mut self,
        cmd: AppCommand,
        pins: &mut impl PinPort,
        store: &mut impl ConfigPort,
        sink: &mut impl EventSink,
        now_ms: u64,
    ) {
        match cmd {
            AppCommand::Actuator { gpio, command } => {
                self.on_actuator_command(gpio, command, pins, sink, now_ms);
            }
            AppCommand::ActuatorEmergency { gpio, request } => {
                self.on_actuator_emergency(gpio, request, pins, sink, now_ms);
            }
            AppCommand::Emergency(request) => self.on_emergency(request, pins, sink, now_ms),
            AppCommand::Configure(items) => {
                if self.limiter.try_consume(1).is_err() {
                    warn!("config message rate limited");
                    self.publish_config_response(
                        0,
                        false,
                        vec![ConfigErrorEntry {
                            index: None,
                            gpio: None,
                            code: RejectionCode::ValidationFailed,
                            message: ActuatorError::RateLimited.as_str(),
                        }],
                        now_ms,
                    );
                    sink.record(Severity::Warning, EventCode::ConfigRejected, "rate limited");
                    return;
                }
                self.apply_config(items, pins, store, sink, now_ms);
            }
        }
    }

    fn on_actuator_command(
        &mut self,
        gpio: u8,
        command: Result<protocol::ActuatorCommand, ActuatorError>,
        pins: &mut impl PinPort,
        sink: &mut impl EventSink,
        now_ms: u64,
    ) {
        let state = self.safety.state();
        let name = command.map_or("INVALID", protocol::ActuatorCommand::name);

        if self.limiter.try_consume(1).is_err() {
            self.registry
                .reject_command(gpio, name, ActuatorError::RateLimited, state, &mut self.link, now_ms);
            sink.record(
                Severity::Warning,
                EventCode::CommandRejected,
                &note(format_args!("GPIO {gpio} {name}: rate limited")),
            );
            return;
        }

        let command = match command {
            Ok(c) => c,
            Err(e) => {
                self.registry.reject_command(gpio, name, e, state, &mut self.link, now_ms);
                sink.record(
                    Severity::Warning,
                    EventCode::CommandRejected,
                    &note(format_args!("GPIO {gpio}: {e}")),
                );
                return;
            }
        };

        match self
            .registry
            .handle_command(gpio, command, state, pins, &mut self.link, now_ms)
        {
            Ok(CommandEffect::Applied) => sink.record(
                Severity::Info,
                EventCode::CommandApplied,
                &note(format_args!("GPIO {gpio} {name}")),
            ),
            Ok(CommandEffect::Refused(refusal)) => sink.record(
                Severity::Warning,
                EventCode::ProtectionRefused,
                &note(format_args!("GPIO {gpio} {name}: {refusal}")),
            ),
            Err(ActuatorError::HardwareFault) => {
                sink.record(
                    Severity::Error,
                    EventCode::HardwareFault,
                    &note(format_args!("GPIO {gpio} output write failed")),
                );
                // Fail safe: latch the actuator until someone looks at it.
                let _ = self.registry.emergency_stop_actuator(
                    gpio,
                    "output write failed",
                    pins,
                    &mut self.link,
                    now_ms,
                );
            }
            Err(e) => sink.record(
                Severity::Warning,
                EventCode::CommandRejected,
                &note(format_args!("GPIO {gpio} {name}: {e}")),
            ),
        }
    }

    fn on_actuator_emergency(
        &mut self,
        gpio: u8,
        request: Result<EmergencyRequest, ActuatorError>,
        pins: &mut impl PinPort,
        sink: &mut impl EventSink,
        now_ms: u64,
    ) {
        let state = self.safety.state();
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                self.registry.reject_command(gpio, "EMERGENCY", e, state, &mut self.link, now_ms);
                return;
            }
        };

        match request.action {
            EmergencyAction::Stop => {
                let reason = reason_or(&request, "remote stop");
                let result = self
                    .registry
                    .emergency_stop_actuator(gpio, reason, pins, &mut self.link, now_ms);
                let (ok, message) = match result {
                    Ok(()) => (true, "stopped"),
                    Err(e) => (false, e.as_str()),
                };
                self.registry
                    .publish_response(gpio, "STOP", None, ok, message, state, &mut self.link, now_ms);
                if ok {
                    sink.record(
                        Severity::Warning,
                        EventCode::EmergencyTriggered,
                        &note(format_args!("GPIO {gpio}: {reason}")),
                    );
                }
            }
            EmergencyAction::Clear => {
                let result =
                    self.safety
                        .clear_actuator(gpio, &mut self.registry, &*pins, &mut self.link, now_ms);
                match result {
                    Ok(()) => {
                        self.registry
                            .publish_response(gpio, "CLEAR", None, true, "cleared", state, &mut self.link, now_ms);
                        sink.record(
                            Severity::Info,
                            EventCode::EmergencyCleared,
                            &note(format_args!("GPIO {gpio}")),
                        );
                    }
                    Err(e) => {
                        let msg = note(format_args!("{e}"));
                        self.registry
                            .publish_response(gpio, "CLEAR", None, false, &msg, state, &mut self.link, now_ms);
                        sink.record(Severity::Warning, EventCode::EmergencyClearRejected, &msg);
                    }
                }
            }
            EmergencyAction::Resume => {
                self.registry.reject_command(
                    gpio,
                    "RESUME",
                    ActuatorError::InvalidCommand,
                    state,
                    &mut self.link,
                    now_ms,
                );
            }
        }
    }

    fn on_emergency(
        &mut self,
        request: Result<EmergencyRequest, ActuatorError>,
        pins: &mut impl PinPort,
        sink: &mut impl EventSink,
        now_ms: u64,
    ) {
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                warn!("emergency message rejected: {e}");
                self.safety
                    .publish_state(&self.registry, &mut self.link, Some(e.as_str()), now_ms);
                sink.record(Severity::Warning, EventCode::CommandRejected, "malformed emergency message");
                return;
            }
        };

        match request.action {
            EmergencyAction::Stop => {
                let reason = reason_or(&request, "remote stop");
                let stopped = self.safety.emergency_stop_all(
                    reason,
                    StopSource::Remote,
                    &mut self.registry,
                    pins,
                    &mut self.link,
                    now_ms,
                );
                sink.record(
                    Severity::Critical,
                    EventCode::EmergencyTriggered,
                    &note(format_args!("{reason} ({stopped} stopped)")),
                );
            }
            EmergencyAction::Clear => {
                let result = self
                    .registry
                    .clear_emergency_stop(&mut self.safety, &mut self.link, now_ms);
                self.record_clear(result, sink, now_ms);
            }
            EmergencyAction::Resume => {
                let result = self
                    .registry
                    .resume_operation(&mut self.safety, &mut self.link, now_ms);
                self.record_clear(result, sink, now_ms);
            }
        }
    }

    fn record_clear(&mut self, result: Result<(), SafetyError>, sink: &mut impl EventSink, now_ms: u64) {
        match result {
            Ok(()) => sink.record(
                Severity::Info,
                EventCode::EmergencyCleared,
                &note(format_args!("state {}", self.safety.state())),
            ),
            Err(e) => {
                let msg = note(format_args!("{e}"));
                // Verification failures already published their own state.
                if !matches!(e, SafetyError::VerificationFailed(_)) {
                    self.safety
                        .publish_state(&self.registry, &mut self.link, Some(&msg), now_ms);
                }
                sink.record(Severity::Warning, EventCode::EmergencyClearRejected, &msg);
            }
        }
    }

    /// Explicit local trigger (e.g. an overcurrent input).  Enters ACTIVE
    /// exactly like a remote stop.
    pub fn signal_hardware_fault(
        &mut self,
        reason: &str,
        pins: &mut impl PinPort,
        sink: &mut impl EventSink,
        now_ms: u64,
    ) {
        let stopped = self.safety.emergency_stop_all(
            reason,
            StopSource::LocalFault,
            &mut self.registry,
            pins,
            &mut self.link,
            now_ms,
        );
        sink.record(
            Severity::Critical,
            EventCode::HardwareFault,
            &note(format_args!("{reason} ({stopped} stopped)")),
        );
    }

    // ── Configuration ─────────────────────────────────────────────

    fn apply_config(
        &mut self,
        items: Result<Vec<ConfigItem>, ConfigRejection>,
        pins: &mut impl PinPort,
        store: &mut impl ConfigPort,
        sink: &mut impl EventSink,
        now_ms: u64,
    ) {
        let items = match items {
            Ok(items) => items,
            Err(rej) => {
                sink.record(
                    Severity::Warning,
                    EventCode::ConfigRejected,
                    &note(format_args!("{rej}")),
                );
                self.publish_config_response(
                    0,
                    false,
                    vec![ConfigErrorEntry {
                        index: None,
                        gpio: None,
                        code: rej.code,
                        message: rej.detail,
                    }],
                    now_ms,
                );
                return;
            }
        };

        let emergency_active = self.safety.state() != EmergencyState::Normal;
        let mut applied = 0;
        let mut errors = Vec::new();

        for item in items {
            let outcome = item
                .result
                .and_then(|cfg| self.registry.configure(cfg, emergency_active, pins, now_ms));
            match outcome {
                Ok(outcome) => {
                    applied += 1;
                    if let Some(gpio) = item.gpio {
                        sink.record(
                            Severity::Info,
                            EventCode::ConfigApplied,
                            &note(format_args!("GPIO {gpio} {outcome:?}")),
                        );
                        if outcome != ConfigureOutcome::Removed {
                            self.registry.publish_status(gpio, &mut self.link, now_ms);
                        }
                    }
                }
                Err(rej) => {
                    sink.record(
                        Severity::Warning,
                        EventCode::ConfigRejected,
                        &note(format_args!("item {} (GPIO {:?}): {rej}", item.index, item.gpio)),
                    );
                    errors.push(ConfigErrorEntry {
                        index: Some(item.index),
                        gpio: item.gpio,
                        code: rej.code,
                        message: rej.detail,
                    });
                }
            }
        }

        let mut persisted = false;
        if applied > 0 {
            match store.save_actuators(&self.registry.configs()) {
                Ok(()) => persisted = true,
                Err(e) => {
                    sink.record(
                        Severity::Error,
                        EventCode::StorageFailed,
                        &note(format_args!("actuator save: {e}")),
                    );
                    errors.push(ConfigErrorEntry {
                        index: None,
                        gpio: None,
                        code: RejectionCode::StorageWriteFailed,
                        message: "configuration applied but not persisted",
                    });
                }
            }
        }

        self.publish_config_response(applied, persisted, errors, now_ms);
    }

    fn publish_config_response(
        &mut self,
        applied: usize,
        persisted: bool,
        errors: Vec<ConfigErrorEntry>,
        now_ms: u64,
    ) {
        let payload = protocol::encode(&ConfigResponseMsg {
            success: errors.is_empty(),
            applied,
            persisted,
            errors,
        });
        let topic = self.registry.topics().config_response();
        registry::send(&mut self.link, &topic, &payload, Qos::AtLeastOnce, 1, now_ms);
    }

    // ── Link upkeep ───────────────────────────────────────────────

    fn on_link_event(&mut self, event: LinkEvent, sink: &mut impl EventSink, now_ms: u64) {
        match event {
            LinkEvent::Connected { flushed } => {
                sink.record(
                    Severity::Info,
                    EventCode::Connected,
                    &note(format_args!("{} ({flushed} queued delivered)", self.link.config().url())),
                );
                self.safety.publish_state(&self.registry, &mut self.link, None, now_ms);
                self.registry.publish_all_status(&mut self.link, now_ms);
            }
            LinkEvent::Lost => sink.record(Severity::Warning, EventCode::ConnectionLost, "broker session dropped"),
            LinkEvent::RetryScheduled { delay_ms } => sink.record(
                Severity::Warning,
                EventCode::ReconnectFailed,
                &note(format_args!("retry in {delay_ms} ms")),
            ),
            LinkEvent::RetriesExhausted => sink.record(
                Severity::Error,
                EventCode::RetriesExhausted,
                "reconnect attempts exhausted; retrying at capped delay",
            ),
        }
    }

    fn send_heartbeat(&mut self, now_ms: u64) {
        if !self.link.heartbeat_due(now_ms) {
            return;
        }
        let stats = self.link.stats();
        let payload = protocol::encode(&HeartbeatMsg {
            uptime_ms: now_ms.saturating_sub(self.started_ms),
            emergency_state: self.safety.state(),
            actuators: self.registry.len(),
            queued: stats.queued,
            dropped: stats.dropped,
            breaker: stats.breaker,
            reconnect_attempts: stats.reconnect_attempts,
        });
        let topic = self.registry.topics().heartbeat();
        self.link.heartbeat(&topic, &payload, now_ms);
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn emergency_state(&self) -> EmergencyState {
        self.safety.state()
    }

    pub fn registry(&self) -> &ActuatorRegistry {
        &self.registry
    }

    pub fn safety(&self) -> &SafetyController {
        &self.safety
    }

    pub fn link(&self) -> &TransportClient<M> {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut TransportClient<M> {
        &mut self.link
    }

    pub fn topics(&self) -> &Topics {
        self.registry.topics()
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn uptime_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.started_ms)
    }
}

fn reason_or<'a>(request: &'a EmergencyRequest, fallback: &'a str) -> &'a str {
    if request.reason.is_empty() {
        fallback
    } else {
        &request.reason
    }
}
