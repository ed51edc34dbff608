//! Unified error types for the AquaNode firmware.
//!
//! Every subsystem has its own small `Copy` error enum; all of them convert
//! into the top-level [`Error`] so the control loop handles failures
//! uniformly.  Protection refusals are deliberately **not** errors; see
//! [`Refusal`](crate::drivers::protection::Refusal).

use core::fmt;

use serde::Serialize;

use crate::app::ports::{PinOwner, StoreError};
use crate::safety::EmergencyState;

// ---------------------------------------------------------------------------
// Top-level firmware error
// ---------------------------------------------------------------------------

/// Every fallible operation in the firmware funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Broker connection or delivery failed.
    Transport(TransportError),
    /// An actuator command could not be applied.
    Actuator(ActuatorError),
    /// A GPIO capability call failed.
    Pin(PinError),
    /// An emergency transition was refused.
    Safety(SafetyError),
    /// An actuator configuration item was rejected.
    Config(ConfigRejection),
    /// Persistent storage failed.
    Store(StoreError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Actuator(e) => write!(f, "actuator: {e}"),
            Self::Pin(e) => write!(f, "gpio: {e}"),
            Self::Safety(e) => write!(f, "safety: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Store(e) => write!(f, "store: {e}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Connection config has no broker host.
    EmptyEndpoint,
    /// The underlying connect call failed.
    ConnectFailed,
    /// The handshake did not finish within `connect_timeout_ms`.
    ConnectTimeout,
    /// Operation requires an established connection.
    NotConnected,
    /// The broker rejected or dropped a publish.
    PublishFailed,
    /// Subscribing to a topic failed.
    SubscribeFailed,
    /// Payload exceeds the offline-queue slot size.
    PayloadTooLarge,
    /// Topic exceeds the offline-queue topic size.
    TopicTooLong,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyEndpoint => write!(f, "broker endpoint is empty"),
            Self::ConnectFailed => write!(f, "connect failed"),
            Self::ConnectTimeout => write!(f, "connect timed out"),
            Self::NotConnected => write!(f, "not connected"),
            Self::PublishFailed => write!(f, "publish failed"),
            Self::SubscribeFailed => write!(f, "subscribe failed"),
            Self::PayloadTooLarge => write!(f, "payload too large"),
            Self::TopicTooLong => write!(f, "topic too long"),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

// ---------------------------------------------------------------------------
// Actuator errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorError {
    /// No actuator is configured on the addressed GPIO.
    NotFound,
    /// Normalised value outside 0.0..=1.0 (or not finite).
    OutOfRange,
    /// The command does not apply to this actuator kind.
    TypeMismatch,
    /// The actuator is latched in emergency stop.
    EmergencyStopped,
    /// The system-wide emergency state is not NORMAL.
    EmergencyActive,
    /// Writing the physical output failed.
    HardwareFault,
    /// Unknown or malformed command payload.
    InvalidCommand,
    /// Inbound command budget exhausted.
    RateLimited,
}

impl ActuatorError {
    /// Short machine-readable tag used in response messages.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "unknown actuator",
            Self::OutOfRange => "value out of range",
            Self::TypeMismatch => "command not supported by actuator type",
            Self::EmergencyStopped => "actuator emergency stopped",
            Self::EmergencyActive => "emergency stop active",
            Self::HardwareFault => "hardware fault",
            Self::InvalidCommand => "invalid command",
            Self::RateLimited => "rate limited",
        }
    }
}

impl fmt::Display for ActuatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ActuatorError> for Error {
    fn from(e: ActuatorError) -> Self {
        Self::Actuator(e)
    }
}

// ---------------------------------------------------------------------------
// GPIO capability errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinError {
    /// Pin number does not exist or is reserved by the board.
    InvalidPin(u8),
    /// Pin is already owned by someone else.
    AlreadyClaimed { pin: u8, owner: PinOwner },
    /// Write attempted on a pin nobody reserved.
    NotReserved(u8),
    /// The peripheral write call failed.
    WriteFailed(u8),
}

impl fmt::Display for PinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPin(p) => write!(f, "GPIO {p} is not assignable"),
            Self::AlreadyClaimed { pin, owner } => write!(f, "GPIO {pin} already claimed by {owner}"),
            Self::NotReserved(p) => write!(f, "GPIO {p} not reserved"),
            Self::WriteFailed(p) => write!(f, "GPIO {p} write failed"),
        }
    }
}

impl From<PinError> for Error {
    fn from(e: PinError) -> Self {
        Self::Pin(e)
    }
}

// ---------------------------------------------------------------------------
// Safety errors
// ---------------------------------------------------------------------------

/// Why [`verify_system_safety`](crate::safety::SafetyController::verify_system_safety) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationFailure {
    /// The broker link is down.
    TransportDown,
    /// The offline queue has no room for the recovery traffic.
    NoQueueHeadroom,
    /// The minimum stop duration has not elapsed yet.
    TooSoon { remaining_ms: u64 },
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportDown => write!(f, "transport disconnected"),
            Self::NoQueueHeadroom => write!(f, "offline queue full"),
            Self::TooSoon { remaining_ms } => write!(f, "stop too recent ({remaining_ms} ms remaining)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyError {
    /// The requested action is not valid from the current state.
    InvalidState(EmergencyState),
    /// System verification failed; the controller stayed in ACTIVE.
    VerificationFailed(VerificationFailure),
    /// Too many failed clears; wait for the lockout to expire.
    LockedOut { remaining_ms: u64 },
    /// Per-actuator verification failed.
    ActuatorUnsafe(u8),
}

impl fmt::Display for SafetyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState(s) => write!(f, "not allowed in state {s}"),
            Self::VerificationFailed(v) => write!(f, "verification failed: {v}"),
            Self::LockedOut { remaining_ms } => write!(f, "clear locked out for {remaining_ms} ms"),
            Self::ActuatorUnsafe(gpio) => write!(f, "actuator on GPIO {gpio} failed verification"),
        }
    }
}

impl From<SafetyError> for Error {
    fn from(e: SafetyError) -> Self {
        Self::Safety(e)
    }
}

// ---------------------------------------------------------------------------
// Configuration rejections
// ---------------------------------------------------------------------------

/// Structured rejection codes carried in configuration responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    ValidationFailed,
    GpioConflict,
    TypeMismatch,
    MissingField,
    OutOfRange,
    StorageWriteFailed,
    ParseError,
}

impl RejectionCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::GpioConflict => "GPIO_CONFLICT",
            Self::TypeMismatch => "TYPE_MISMATCH",
            Self::MissingField => "MISSING_FIELD",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::StorageWriteFailed => "STORAGE_WRITE_FAILED",
            Self::ParseError => "PARSE_ERROR",
        }
    }
}

impl fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected configuration item: code plus a short static explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigRejection {
    pub code: RejectionCode,
    pub detail: &'static str,
}

impl ConfigRejection {
    pub const fn new(code: RejectionCode, detail: &'static str) -> Self {
        Self { code, detail }
    }
}

impl fmt::Display for ConfigRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.detail)
    }
}

impl From<ConfigRejection> for Error {
    fn from(e: ConfigRejection) -> Self {
        Self::Config(e)
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
