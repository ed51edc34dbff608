//! Inbound commands to the application service.
//!
//! Broker messages are routed by topic and parsed here, once, before
//! the [`AppService`](super::service::AppService) touches any state.
//! Parse failures travel inside the variant so the service can answer
//! them on the right response topic.

use crate::drivers::protection::RuntimeProtectionPolicy;
use crate::error::{ActuatorError, ConfigRejection};
use crate::protocol::{self, ActuatorCommand, ConfigItem, EmergencyRequest, InboundTopic, Topics};

use super::ports::InboundMessage;

#[derive(Debug, Clone)]
pub enum AppCommand {
    /// Control command for one actuator.
    Actuator {
        gpio: u8,
        command: Result<ActuatorCommand, ActuatorError>,
    },
    /// Stop or clear a single actuator.
    ActuatorEmergency {
        gpio: u8,
        request: Result<EmergencyRequest, ActuatorError>,
    },
    /// System-wide stop / clear / resume.
    Emergency(Result<EmergencyRequest, ActuatorError>),
    /// Actuator configuration batch.
    Configure(Result<Vec<ConfigItem>, ConfigRejection>),
}

impl AppCommand {
    /// `None` for topics outside this device's inbound set.
    pub fn route(
        topics: &Topics,
        msg: &InboundMessage,
        defaults: &RuntimeProtectionPolicy,
    ) -> Option<Self> {
        let payload = msg.payload.as_slice();
        Some(match topics.parse(&msg.topic)? {
            InboundTopic::ActuatorCommand(gpio) => Self::Actuator {
                gpio,
                command: protocol::parse_command(payload),
            },
            InboundTopic::ActuatorEmergency(gpio) => Self::ActuatorEmergency {
                gpio,
                request: protocol::parse_emergency(payload),
            },
            InboundTopic::Emergency => Self::Emergency(protocol::parse_emergency(payload)),
            InboundTopic::Config => Self::Configure(protocol::parse_config(payload, defaults)),
        })
    }

    /// Emergency traffic skips the rate limiter and is handled before
    /// anything else drained in the same iteration.
    pub fn is_emergency(&self) -> bool {
        matches!(self, Self::Emergency(_) | Self::ActuatorEmergency { .. })
    }
}
