//! MQTT topic layout and JSON message formats.
//!
//! ```text
//!   <prefix>/<client_id>/
//!     actuator/<gpio>/command     ◀── {"command":"ON|OFF|TOGGLE|SET","value":0.5}
//!     actuator/<gpio>/emergency   ◀── {"action":"stop|clear","reason":"..."}
//!     emergency                   ◀── {"action":"stop|clear|resume","reason":"..."}
//!     config                      ◀── [ActuatorConfig, ...]
//!     actuator/<gpio>/status      ──▶ runtime state
//!     actuator/<gpio>/response    ──▶ per-command result
//!     actuator/<gpio>/alert       ──▶ emergency / protection events
//!     config/response             ──▶ applied count + structured rejections
//!     emergency/state             ──▶ state machine transitions (QoS 1)
//!     heartbeat                   ──▶ liveness + link statistics (QoS 0)
//! ```
//!
//! Inbound parsing is strict: required fields must be present with the
//! right JSON type, and numeric ranges are checked rather than defaulted.

use core::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app::ports::MAX_ACTUATORS;
use crate::drivers::actuator::{ActuatorConfig, ActuatorKind, ActuatorRuntimeState};
use crate::drivers::protection::RuntimeProtectionPolicy;
use crate::error::{ActuatorError, ConfigRejection, RejectionCode};
use crate::safety::EmergencyState;
use crate::transport::BreakerState;

pub const MAX_TOPIC: usize = 96;
pub type TopicString = heapless::String<MAX_TOPIC>;

/// Most items accepted in one configuration message.
pub const MAX_CONFIG_ITEMS: usize = MAX_ACTUATORS * 2;

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Inbound topic, resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundTopic {
    ActuatorCommand(u8),
    ActuatorEmergency(u8),
    Emergency,
    Config,
}

#[derive(Debug, Clone)]
pub struct Topics {
    base: heapless::String<64>,
}

impl Topics {
    pub fn new(prefix: &str, client_id: &str) -> Self {
        let mut base = heapless::String::new();
        let _ = write!(base, "{prefix}/{client_id}");
        Self { base }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn join(&self, tail: core::fmt::Arguments<'_>) -> TopicString {
        let mut t = TopicString::new();
        let _ = write!(t, "{}/{}", self.base, tail);
        t
    }

    pub fn actuator(&self, gpio: u8, leaf: &str) -> TopicString {
        self.join(format_args!("actuator/{gpio}/{leaf}"))
    }

    pub fn status(&self, gpio: u8) -> TopicString {
        self.actuator(gpio, "status")
    }

    pub fn response(&self, gpio: u8) -> TopicString {
        self.actuator(gpio, "response")
    }

    pub fn alert(&self, gpio: u8) -> TopicString {
        self.actuator(gpio, "alert")
    }

    pub fn emergency(&self) -> TopicString {
        self.join(format_args!("emergency"))
    }

    pub fn emergency_state(&self) -> TopicString {
        self.join(format_args!("emergency/state"))
    }

    pub fn config(&self) -> TopicString {
        self.join(format_args!("config"))
    }

    pub fn config_response(&self) -> TopicString {
        self.join(format_args!("config/response"))
    }

    pub fn heartbeat(&self) -> TopicString {
        self.join(format_args!("heartbeat"))
    }

    /// Filters the device subscribes to.
    pub fn subscriptions(&self) -> [TopicString; 4] {
        [
            self.actuator_wildcard("command"),
            self.actuator_wildcard("emergency"),
            self.emergency(),
            self.config(),
        ]
    }

    fn actuator_wildcard(&self, leaf: &str) -> TopicString {
        self.join(format_args!("actuator/+/{leaf}"))
    }

    /// Resolve an inbound topic.  Anything outside this device's tree, or
    /// an outbound leaf echoed back, is `None`.
    pub fn parse(&self, topic: &str) -> Option<InboundTopic> {
        let rest = topic.strip_prefix(self.base.as_str())?.strip_prefix('/')?;
        let parts: heapless::Vec<&str, 4> = rest.split('/').take(4).collect();
        match parts.as_slice() {
            ["emergency"] => Some(InboundTopic::Emergency),
            ["config"] => Some(InboundTopic::Config),
            ["actuator", gpio, "command"] => gpio.parse().ok().map(InboundTopic::ActuatorCommand),
            ["actuator", gpio, "emergency"] => {
                gpio.parse().ok().map(InboundTopic::ActuatorEmergency)
            }
            _ => None,
        }
    }
}

/// Whether an inbound topic carries emergency traffic (broadcast or
/// per-actuator).  Needs no base topic, so the MQTT task can sort
/// messages before the control loop sees them.
pub fn is_emergency_topic(topic: &str) -> bool {
    topic.ends_with("/emergency")
}

// ---------------------------------------------------------------------------
// Actuator commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActuatorCommand {
    On,
    Off,
    Toggle,
    Set(f32),
}

impl ActuatorCommand {
    pub const fn name(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
            Self::Toggle => "TOGGLE",
            Self::Set(_) => "SET",
        }
    }
}

#[derive(Deserialize)]
struct CommandMsg {
    command: heapless::String<16>,
    value: Option<f32>,
}

/// Parse a command payload.
///
/// Accepts the JSON form and, for hand-typed messages, a bare
/// `ON`/`OFF`/`TOGGLE` string.  Command names are case-insensitive.
pub fn parse_command(payload: &[u8]) -> Result<ActuatorCommand, ActuatorError> {
    let (name, value) = match serde_json::from_slice::<CommandMsg>(payload) {
        Ok(msg) => (msg.command, msg.value),
        Err(_) => {
            let text = core::str::from_utf8(payload).map_err(|_| ActuatorError::InvalidCommand)?;
            let mut name = heapless::String::<16>::new();
            name.push_str(text.trim())
                .map_err(|_| ActuatorError::InvalidCommand)?;
            (name, None)
        }
    };

    let name = name.as_str();
    if name.eq_ignore_ascii_case("ON") {
        Ok(ActuatorCommand::On)
    } else if name.eq_ignore_ascii_case("OFF") {
        Ok(ActuatorCommand::Off)
    } else if name.eq_ignore_ascii_case("TOGGLE") {
        Ok(ActuatorCommand::Toggle)
    } else if name.eq_ignore_ascii_case("SET") {
        value.map(ActuatorCommand::Set).ok_or(ActuatorError::InvalidCommand)
    } else {
        Err(ActuatorError::InvalidCommand)
    }
}

// ---------------------------------------------------------------------------
// Emergency requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmergencyAction {
    Stop,
    Clear,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmergencyRequest {
    pub action: EmergencyAction,
    pub reason: heapless::String<64>,
}

#[derive(Deserialize)]
struct EmergencyMsg {
    action: heapless::String<16>,
    reason: Option<String>,
}

pub fn parse_emergency(payload: &[u8]) -> Result<EmergencyRequest, ActuatorError> {
    let msg: EmergencyMsg =
        serde_json::from_slice(payload).map_err(|_| ActuatorError::InvalidCommand)?;
    let action = match msg.action.as_str() {
        a if a.eq_ignore_ascii_case("stop") => EmergencyAction::Stop,
        a if a.eq_ignore_ascii_case("clear") => EmergencyAction::Clear,
        a if a.eq_ignore_ascii_case("resume") => EmergencyAction::Resume,
        _ => return Err(ActuatorError::InvalidCommand),
    };
    let mut reason = heapless::String::new();
    if let Some(r) = msg.reason {
        // Over-long reasons are cut at a char boundary.
        for c in r.chars() {
            if reason.push(c).is_err() {
                break;
            }
        }
    }
    Ok(EmergencyRequest { action, reason })
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// One item of a configuration message after validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigItem {
    pub index: usize,
    pub gpio: Option<u8>,
    pub result: Result<ActuatorConfig, ConfigRejection>,
}

#[derive(Deserialize)]
struct RawProtection {
    max_runtime_ms: Option<u64>,
    cooldown_ms: Option<u64>,
    #[serde(alias = "max_activations_per_hour")]
    max_activations_per_window: Option<u16>,
    window_ms: Option<u64>,
}

#[derive(Deserialize)]
struct RawActuatorConfig {
    gpio: Option<i64>,
    aux_gpio: Option<i64>,
    #[serde(rename = "type", alias = "actuator_type")]
    kind: Option<String>,
    name: Option<String>,
    zone: Option<String>,
    subzone: Option<String>,
    active: Option<bool>,
    critical: Option<bool>,
    inverted: Option<bool>,
    default_state: Option<Value>,
    protection: Option<RawProtection>,
    transition_ms: Option<i64>,
}

/// Parse a configuration payload: a JSON array of items, an object with an
/// `actuators` array, or a single item object.
///
/// A payload that is not JSON at all is rejected as a whole with
/// `PARSE_ERROR`; otherwise every item gets its own verdict.
pub fn parse_config(
    payload: &[u8],
    defaults: &RuntimeProtectionPolicy,
) -> Result<Vec<ConfigItem>, ConfigRejection> {
    let root: Value = serde_json::from_slice(payload)
        .map_err(|_| ConfigRejection::new(RejectionCode::ParseError, "payload is not valid JSON"))?;

    let items = match root {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("actuators") {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(ConfigRejection::new(
                    RejectionCode::TypeMismatch,
                    "actuators must be an array",
                ));
            }
            None => vec![Value::Object(map)],
        },
        _ => {
            return Err(ConfigRejection::new(
                RejectionCode::ParseError,
                "expected an array of actuator objects",
            ));
        }
    };

    if items.len() > MAX_CONFIG_ITEMS {
        return Err(ConfigRejection::new(
            RejectionCode::ValidationFailed,
            "too many items in one message",
        ));
    }

    Ok(items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let gpio = item
                .get("gpio")
                .and_then(Value::as_u64)
                .and_then(|g| u8::try_from(g).ok());
            let result = serde_json::from_value::<RawActuatorConfig>(item)
                .map_err(|e| classify(&e))
                .and_then(|raw| convert(raw, defaults));
            ConfigItem { index, gpio, result }
        })
        .collect())
}

fn classify(e: &serde_json::Error) -> ConfigRejection {
    if e.to_string().starts_with("missing field") {
        ConfigRejection::new(RejectionCode::MissingField, "required field missing")
    } else {
        ConfigRejection::new(RejectionCode::TypeMismatch, "field has the wrong JSON type")
    }
}

fn bounded<const N: usize>(s: Option<String>, what: &'static str) -> Result<heapless::String<N>, ConfigRejection> {
    let mut out = heapless::String::new();
    if let Some(s) = s {
        out.push_str(&s)
            .map_err(|_| ConfigRejection::new(RejectionCode::ValidationFailed, what))?;
    }
    Ok(out)
}

fn gpio_number(v: i64) -> Result<u8, ConfigRejection> {
    u8::try_from(v)
        .map_err(|_| ConfigRejection::new(RejectionCode::OutOfRange, "gpio out of range"))
}

fn convert(
    raw: RawActuatorConfig,
    defaults: &RuntimeProtectionPolicy,
) -> Result<ActuatorConfig, ConfigRejection> {
    use RejectionCode as C;

    let gpio = gpio_number(raw.gpio.ok_or(ConfigRejection::new(C::MissingField, "gpio is required"))?)?;
    let kind_name = raw
        .kind
        .ok_or(ConfigRejection::new(C::MissingField, "type is required"))?;
    let kind = match kind_name.to_ascii_lowercase().as_str() {
        "relay" => ActuatorKind::Relay,
        "pump" => ActuatorKind::Pump,
        "pwm" => ActuatorKind::Pwm,
        "valve" => ActuatorKind::Valve,
        _ => return Err(ConfigRejection::new(C::ValidationFailed, "unknown actuator type")),
    };
    let aux_gpio = raw.aux_gpio.map(gpio_number).transpose()?;

    let default_state = match raw.default_state {
        None | Some(Value::Null) => 0.0,
        Some(Value::Bool(b)) => f32::from(u8::from(b)),
        Some(Value::Number(n)) => n.as_f64().map_or(f32::NAN, |f| f as f32),
        Some(_) => {
            return Err(ConfigRejection::new(C::TypeMismatch, "default_state must be a number or bool"));
        }
    };

    let protection = raw.protection.map(|p| RuntimeProtectionPolicy {
        max_runtime_ms: p.max_runtime_ms.unwrap_or(defaults.max_runtime_ms),
        cooldown_ms: p.cooldown_ms.unwrap_or(defaults.cooldown_ms),
        max_activations_per_window: p
            .max_activations_per_window
            .unwrap_or(defaults.max_activations_per_window),
        window_ms: p.window_ms.unwrap_or(defaults.window_ms),
    });

    let transition_ms = raw
        .transition_ms
        .map(|t| {
            u32::try_from(t)
                .map_err(|_| ConfigRejection::new(C::OutOfRange, "transition_ms out of range"))
        })
        .transpose()?;

    let subzone = match raw.subzone {
        Some(s) if !s.is_empty() => Some(bounded(Some(s), "subzone too long")?),
        _ => None,
    };

    let config = ActuatorConfig {
        gpio,
        aux_gpio,
        kind,
        name: bounded(raw.name, "name too long")?,
        zone: bounded(raw.zone, "zone too long")?,
        subzone,
        active: raw.active.unwrap_or(true),
        critical: raw.critical.unwrap_or(false),
        inverted: raw.inverted.unwrap_or(false),
        default_state,
        protection,
        transition_ms,
    };
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Outbound messages
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusMsg<'a> {
    #[serde(flatten)]
    pub state: &'a ActuatorRuntimeState,
    pub name: &'a str,
    pub zone: &'a str,
    pub ts: u64,
}

#[derive(Serialize)]
pub struct ResponseMsg<'a> {
    pub gpio: u8,
    pub command: &'a str,
    pub value: Option<f32>,
    pub success: bool,
    pub message: &'a str,
    pub emergency_state: EmergencyState,
    pub ts: u64,
}

#[derive(Serialize)]
pub struct AlertMsg<'a> {
    pub gpio: u8,
    pub alert_type: &'a str,
    pub message: &'a str,
    pub ts: u64,
}

#[derive(Debug, Serialize)]
pub struct ConfigErrorEntry {
    pub index: Option<usize>,
    pub gpio: Option<u8>,
    pub code: RejectionCode,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ConfigResponseMsg {
    pub success: bool,
    pub applied: usize,
    pub persisted: bool,
    pub errors: Vec<ConfigErrorEntry>,
}

#[derive(Serialize)]
pub struct EmergencyStateMsg<'a> {
    pub state: EmergencyState,
    pub reason: &'a str,
    pub since_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a str>,
    pub ts: u64,
}

#[derive(Serialize)]
pub struct HeartbeatMsg {
    pub uptime_ms: u64,
    pub emergency_state: EmergencyState,
    pub actuators: usize,
    pub queued: usize,
    pub dropped: u32,
    pub breaker: BreakerState,
    pub reconnect_attempts: u32,
}

/// Serialise an outbound message.  These types cannot fail to encode;
/// an empty payload is returned if that ever changes.
pub fn encode<T: Serialize>(msg: &T) -> Vec<u8> {
    serde_json::to_vec(msg).unwrap_or_default()
}
