//! Port traits: the hexagonal boundary between domain logic and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ AppService (domain)
//! ```
//!
//! Driven adapters (GPIO bank, MQTT link, NVS, event sinks) implement these
//! traits.  The [`AppService`](super::service::AppService) and everything
//! below it consume them via generics, so the domain core never touches
//! hardware or sockets directly.

use core::fmt;

use crate::config::{ConnectionConfig, SystemConfig};
use crate::drivers::actuator::ActuatorConfig;
use crate::error::{PinError, TransportError};

use super::events::{EventCode, Severity};

// ───────────────────────────────────────────────────────────────
// GPIO capability (driven adapter: domain → pins)
// ───────────────────────────────────────────────────────────────

/// Who holds a GPIO claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOwner {
    /// An actuator driver; `slot` is the actuator's primary GPIO.
    Actuator { slot: u8 },
    /// A sensor pipeline (outside this core).
    Sensor,
    /// Board functions (status LED, buses).
    System,
}

impl fmt::Display for PinOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Actuator { slot } => write!(f, "actuator@{slot}"),
            Self::Sensor => write!(f, "sensor"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Exclusive pin ownership plus the two output primitives actuators need.
///
/// A GPIO is claimed by at most one owner; reserving a pin that is already
/// held is an error, never a takeover.
pub trait PinPort {
    fn reserve_pin(&mut self, pin: u8, owner: PinOwner) -> Result<(), PinError>;

    /// Release a claim.  Releasing an unclaimed pin is a no-op.
    fn release_pin(&mut self, pin: u8);

    fn owner_of(&self, pin: u8) -> Option<PinOwner>;

    /// Drive a digital output (`true` = electrical HIGH).
    fn write_digital(&mut self, pin: u8, high: bool) -> Result<(), PinError>;

    /// Set a PWM duty in raw counts (`0..=(1 << resolution_bits) - 1`).
    fn write_pwm(&mut self, pin: u8, duty: u32, resolution_bits: u8) -> Result<(), PinError>;
}

// ───────────────────────────────────────────────────────────────
// Messaging port (driven adapter: domain ↔ broker)
// ───────────────────────────────────────────────────────────────

/// Delivery guarantee for a publish/subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Qos {
    /// Best-effort (QoS 0).
    AtMostOnce,
    /// Acknowledged delivery (QoS 1).
    AtLeastOnce,
}

/// Largest inbound topic the control loop accepts.
pub const MAX_INBOUND_TOPIC: usize = 96;
/// Largest inbound payload the control loop accepts.
pub const MAX_INBOUND_PAYLOAD: usize = 1536;

/// A message received from the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: heapless::String<MAX_INBOUND_TOPIC>,
    pub payload: heapless::Vec<u8, MAX_INBOUND_PAYLOAD>,
}

impl InboundMessage {
    /// Build from borrowed parts; `None` if either part is oversized.
    pub fn new(topic: &str, payload: &[u8]) -> Option<Self> {
        let mut t = heapless::String::new();
        t.push_str(topic).ok()?;
        let mut p = heapless::Vec::new();
        p.extend_from_slice(payload).ok()?;
        Some(Self { topic: t, payload: p })
    }
}

/// Where a session attempt stands when [`MessagingPort::connect`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    /// Session established before returning.
    Up,
    /// Handshake still running; [`MessagingPort::is_connected`] turns true
    /// once it completes.
    Pending,
}

/// Raw broker session.  Every call returns promptly: `connect` starts the
/// handshake without waiting for it and `poll` never waits for traffic.
pub trait MessagingPort {
    fn connect(&mut self, config: &ConnectionConfig) -> Result<ConnectProgress, TransportError>;

    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    fn publish(&mut self, topic: &str, payload: &[u8], qos: Qos) -> Result<(), TransportError>;

    fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), TransportError>;

    /// Next pending inbound message, if any.
    fn poll(&mut self) -> Option<InboundMessage>;

    /// Next message from the emergency lane.  Ports that keep a single
    /// inbound queue leave this empty and return everything from
    /// [`poll`](Self::poll).
    fn poll_urgent(&mut self) -> Option<InboundMessage> {
        None
    }
}

// ───────────────────────────────────────────────────────────────
// Event sink port (driven adapter: domain → logging / telemetry)
// ───────────────────────────────────────────────────────────────

/// Structured event recorder.  Adapters decide where records go (serial
/// log, ring buffer, remote syslog).
pub trait EventSink {
    fn record(&mut self, severity: Severity, code: EventCode, message: &str);
}

// ───────────────────────────────────────────────────────────────
// Configuration port (driven adapter: domain ↔ persistent config)
// ───────────────────────────────────────────────────────────────

/// Most actuators the registry (and the store) will hold.
pub const MAX_ACTUATORS: usize = 16;

/// Loads and persists system and actuator configuration.
///
/// Implementations MUST validate [`SystemConfig`] before persisting and
/// reject invalid ranges with [`StoreError::ValidationFailed`].
pub trait ConfigPort {
    /// Load the stored system configuration.  A missing record is
    /// [`StoreError::NotFound`]; callers fall back to defaults.
    fn load(&self) -> Result<SystemConfig, StoreError>;

    fn save(&mut self, config: &SystemConfig) -> Result<(), StoreError>;

    fn load_actuators(&self) -> Result<heapless::Vec<ActuatorConfig, MAX_ACTUATORS>, StoreError>;

    fn save_actuators(&mut self, actuators: &[ActuatorConfig]) -> Result<(), StoreError>;
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from [`ConfigPort`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// No record found in storage (first boot).
    NotFound,
    /// Stored record failed deserialization.
    Corrupted,
    /// A field failed range validation.
    ValidationFailed(&'static str),
    /// Underlying storage is full.
    Full,
    /// Generic I/O error from the storage backend.
    Io,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "record not found"),
            Self::Corrupted => write!(f, "record corrupted"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {}", msg),
            Self::Full => write!(f, "storage full"),
            Self::Io => write!(f, "I/O error"),
        }
    }
}
