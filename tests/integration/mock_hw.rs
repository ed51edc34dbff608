//! Mock adapters for integration tests.
//!
//! Every port the service consumes has a recording double here so tests can
//! assert on the full pin and broker history without real GPIO or sockets.

use std::cell::Cell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use aquanode::app::events::{EventCode, Severity};
use aquanode::app::ports::{
    ConfigPort, ConnectProgress, EventSink, InboundMessage, MessagingPort, PinOwner, PinPort, Qos,
    StoreError, MAX_ACTUATORS,
};
use aquanode::app::service::AppService;
use aquanode::config::{ConnectionConfig, SystemConfig};
use aquanode::drivers::actuator::ActuatorConfig;
use aquanode::error::{PinError, TransportError};
use aquanode::pins;

pub const DEVICE: &str = "AQ-TEST01";

// ── Clock ─────────────────────────────────────────────────────

thread_local! {
    static NOW_MS: Cell<u64> = const { Cell::new(0) };
}

/// Time provider for the command rate limiter.  Per test thread.
pub fn test_clock() -> Duration {
    NOW_MS.with(|n| Duration::from_millis(n.get()))
}

pub fn set_clock(ms: u64) {
    NOW_MS.with(|n| n.set(ms));
}

// ── MockPins ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PinWrite {
    Digital(u8, bool),
    Pwm(u8, u32),
}

#[derive(Default)]
pub struct MockPins {
    pub owners: HashMap<u8, PinOwner>,
    pub levels: HashMap<u8, bool>,
    pub duties: HashMap<u8, u32>,
    /// Writes to these pins fail.
    pub failing: HashSet<u8>,
    pub writes: Vec<PinWrite>,
}

#[allow(dead_code)]
impl MockPins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self, pin: u8) -> bool {
        self.levels.get(&pin).copied().unwrap_or(false)
    }

    pub fn duty(&self, pin: u8) -> u32 {
        self.duties.get(&pin).copied().unwrap_or(0)
    }

    /// Claim a pin for something other than an actuator.
    pub fn claim_for_sensor(&mut self, pin: u8) {
        self.owners.insert(pin, PinOwner::Sensor);
    }
}

impl PinPort for MockPins {
    fn reserve_pin(&mut self, pin: u8, owner: PinOwner) -> Result<(), PinError> {
        if !pins::is_assignable(pin) {
            return Err(PinError::InvalidPin(pin));
        }
        match self.owners.get(&pin) {
            Some(&o) if o == owner => Ok(()),
            Some(&o) => Err(PinError::AlreadyClaimed { pin, owner: o }),
            None => {
                self.owners.insert(pin, owner);
                Ok(())
            }
        }
    }

    fn release_pin(&mut self, pin: u8) {
        self.owners.remove(&pin);
        self.levels.remove(&pin);
        self.duties.remove(&pin);
    }

    fn owner_of(&self, pin: u8) -> Option<PinOwner> {
        self.owners.get(&pin).copied()
    }

    fn write_digital(&mut self, pin: u8, high: bool) -> Result<(), PinError> {
        if !self.owners.contains_key(&pin) {
            return Err(PinError::NotReserved(pin));
        }
        if self.failing.contains(&pin) {
            return Err(PinError::WriteFailed(pin));
        }
        self.levels.insert(pin, high);
        self.writes.push(PinWrite::Digital(pin, high));
        Ok(())
    }

    fn write_pwm(&mut self, pin: u8, duty: u32, _resolution_bits: u8) -> Result<(), PinError> {
        if !self.owners.contains_key(&pin) {
            return Err(PinError::NotReserved(pin));
        }
        if self.failing.contains(&pin) {
            return Err(PinError::WriteFailed(pin));
        }
        self.duties.insert(pin, duty);
        self.writes.push(PinWrite::Pwm(pin, duty));
        Ok(())
    }
}

// ── MockBroker ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
}

impl Published {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap()
    }
}

#[derive(Default)]
pub struct MockBroker {
    pub online: bool,
    pub reject_connects: bool,
    pub fail_publishes: bool,
    pub connects: u32,
    pub published: Vec<Published>,
    pub subscriptions: Vec<String>,
    pub inbound: VecDeque<InboundMessage>,
}

#[allow(dead_code)]
impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published on topics ending with `suffix`, as JSON.
    pub fn on(&self, suffix: &str) -> Vec<serde_json::Value> {
        self.published
            .iter()
            .filter(|p| p.topic.ends_with(suffix))
            .map(Published::json)
            .collect()
    }

    pub fn last_on(&self, suffix: &str) -> Option<serde_json::Value> {
        self.on(suffix).pop()
    }

    pub fn clear(&mut self) {
        self.published.clear();
    }
}

impl MessagingPort for MockBroker {
    fn connect(&mut self, _config: &ConnectionConfig) -> Result<ConnectProgress, TransportError> {
        self.connects += 1;
        if self.reject_connects {
            return Err(TransportError::ConnectFailed);
        }
        self.online = true;
        Ok(ConnectProgress::Up)
    }

    fn disconnect(&mut self) {
        self.online = false;
    }

    fn is_connected(&self) -> bool {
        self.online
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: Qos) -> Result<(), TransportError> {
        if !self.online {
            return Err(TransportError::NotConnected);
        }
        if self.fail_publishes {
            return Err(TransportError::PublishFailed);
        }
        self.published.push(Published {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
        });
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, _qos: Qos) -> Result<(), TransportError> {
        if !self.online {
            return Err(TransportError::NotConnected);
        }
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    fn poll(&mut self) -> Option<InboundMessage> {
        self.inbound.pop_front()
    }
}

// ── MockStore ─────────────────────────────────────────────────

#[derive(Default)]
pub struct MockStore {
    pub system: Option<SystemConfig>,
    pub actuators: Option<Vec<ActuatorConfig>>,
    pub fail_writes: bool,
    pub saves: u32,
}

#[allow(dead_code)]
impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigPort for MockStore {
    fn load(&self) -> Result<SystemConfig, StoreError> {
        self.system.clone().ok_or(StoreError::NotFound)
    }

    fn save(&mut self, config: &SystemConfig) -> Result<(), StoreError> {
        config.validate().map_err(StoreError::ValidationFailed)?;
        if self.fail_writes {
            return Err(StoreError::Io);
        }
        self.system = Some(config.clone());
        Ok(())
    }

    fn load_actuators(&self) -> Result<heapless::Vec<ActuatorConfig, MAX_ACTUATORS>, StoreError> {
        let list = self.actuators.as_ref().ok_or(StoreError::NotFound)?;
        Ok(list.iter().cloned().collect())
    }

    fn save_actuators(&mut self, actuators: &[ActuatorConfig]) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Io);
        }
        self.saves += 1;
        self.actuators = Some(actuators.to_vec());
        Ok(())
    }
}

// ── RecordingSink ─────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    pub events: Vec<(Severity, EventCode, String)>,
}

#[allow(dead_code)]
impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, code: EventCode) -> usize {
        self.events.iter().filter(|(_, c, _)| *c == code).count()
    }

    pub fn has(&self, code: EventCode) -> bool {
        self.count(code) > 0
    }
}

impl EventSink for RecordingSink {
    fn record(&mut self, severity: Severity, code: EventCode, message: &str) {
        self.events.push((severity, code, message.to_string()));
    }
}

// ── Rig ───────────────────────────────────────────────────────

/// Service plus every mock it talks to.
pub struct Rig {
    pub app: AppService<MockBroker>,
    pub pins: MockPins,
    pub store: MockStore,
    pub sink: RecordingSink,
    pub now: u64,
}

#[allow(dead_code)]
impl Rig {
    pub fn config() -> SystemConfig {
        let mut cfg = SystemConfig::default();
        cfg.connection.host.push_str("broker.local").unwrap();
        cfg
    }

    /// Started and connected, no actuators.
    pub fn new() -> Self {
        Self::with(Self::config(), MockStore::new())
    }

    pub fn with(config: SystemConfig, store: MockStore) -> Self {
        set_clock(0);
        let mut rig = Self {
            app: AppService::new(MockBroker::new(), config, DEVICE, test_clock),
            pins: MockPins::new(),
            store,
            sink: RecordingSink::new(),
            now: 1_000,
        };
        rig.app.start(&mut rig.pins, &rig.store, &mut rig.sink, rig.now);
        rig
    }

    pub fn broker(&self) -> &MockBroker {
        self.app.link().port()
    }

    pub fn broker_mut(&mut self) -> &mut MockBroker {
        self.app.link_mut().port_mut()
    }

    pub fn topic(&self, leaf: &str) -> String {
        format!("{}/{}", self.app.topics().base(), leaf)
    }

    /// Queue an inbound message; handled on the next tick.
    pub fn send(&mut self, leaf: &str, payload: &str) {
        let topic = self.topic(leaf);
        let msg = InboundMessage::new(&topic, payload.as_bytes()).unwrap();
        self.broker_mut().inbound.push_back(msg);
    }

    pub fn tick(&mut self) {
        self.app.tick(&mut self.pins, &mut self.store, &mut self.sink, self.now);
    }

    /// Advance both clocks and tick.
    pub fn advance(&mut self, ms: u64) {
        self.now += ms;
        set_clock(self.now);
        self.tick();
    }

    /// Send and process one message.
    pub fn deliver(&mut self, leaf: &str, payload: &str) {
        self.send(leaf, payload);
        self.tick();
    }

    pub fn configure(&mut self, json: &str) -> serde_json::Value {
        self.deliver("config", json);
        self.broker().last_on("config/response").unwrap()
    }
}
