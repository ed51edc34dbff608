//! MQTT adapter: the [`MessagingPort`] implementation.
//!
//! On the device the ESP-IDF MQTT client runs its own task and calls back
//! into us for every event.  Received messages cross to the control loop
//! over bounded `embassy-sync` lanes; the link flag is an atomic the
//! callback flips on connect/disconnect.  `connect` only starts the
//! client; the control loop sees the session come up through
//! `is_connected`.
//!
//! ```text
//! ┌──────────────┐  routine (8)          ┌──────────────┐
//! │  MQTT task   │──────────────────────▶│ Control loop │
//! │  (esp-mqtt)  │  urgent (4) + stop ──▶│ urgent first │
//! └──────────────┘                       └──────────────┘
//! ```
//!
//! Emergency topics never share the routine lane.  A full routine lane
//! drops the new message with a warning.  A full urgent lane still keeps
//! the latest `stop` in a one-slot latch, so a command burst cannot push
//! a stop out.
//!
//! On the host [`SimMqttLink`] stands in: it records publishes and lets
//! callers inject inbound traffic through the same channel type.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use log::warn;

use crate::app::ports::InboundMessage;
use crate::protocol::{is_emergency_topic, parse_emergency, EmergencyAction};

/// Routine messages buffered between the MQTT task and the control loop.
pub const INBOUND_DEPTH: usize = 8;
/// Emergency messages buffered apart from routine traffic.
pub const URGENT_DEPTH: usize = 4;

/// Inbound traffic from the MQTT task, split by priority.
pub struct InboundLanes<R: RawMutex> {
    routine: Channel<R, InboundMessage, INBOUND_DEPTH>,
    urgent: Channel<R, InboundMessage, URGENT_DEPTH>,
    /// Latest stop that found the urgent lane full.
    overflow_stop: Signal<R, InboundMessage>,
}

impl<R: RawMutex> Default for InboundLanes<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RawMutex> InboundLanes<R> {
    pub const fn new() -> Self {
        Self {
            routine: Channel::new(),
            urgent: Channel::new(),
            overflow_stop: Signal::new(),
        }
    }

    /// Hand one received message to the control loop.  Returns false when
    /// it was dropped: oversized, or its lane is full.
    pub fn deliver(&self, topic: &str, data: &[u8]) -> bool {
        let Some(msg) = InboundMessage::new(topic, data) else {
            warn!("mqtt: dropping oversized message on {topic} ({} bytes)", data.len());
            return false;
        };
        if !is_emergency_topic(topic) {
            if self.routine.try_send(msg).is_err() {
                warn!("mqtt: inbound channel full, dropping message on {topic}");
                return false;
            }
            return true;
        }
        match self.urgent.try_send(msg) {
            Ok(()) => true,
            Err(embassy_sync::channel::TrySendError::Full(msg)) => {
                let is_stop = parse_emergency(&msg.payload)
                    .is_ok_and(|req| req.action == EmergencyAction::Stop);
                if is_stop {
                    warn!("mqtt: urgent lane full, latching stop on {topic}");
                    self.overflow_stop.signal(msg);
                    true
                } else {
                    warn!("mqtt: urgent lane full, dropping message on {topic}");
                    false
                }
            }
        }
    }

    /// Next emergency message, lane first, then the latched stop.
    pub fn next_urgent(&self) -> Option<InboundMessage> {
        self.urgent
            .try_receive()
            .ok()
            .or_else(|| self.overflow_stop.try_take())
    }

    pub fn next_routine(&self) -> Option<InboundMessage> {
        self.routine.try_receive().ok()
    }
}

// ───────────────────────────────────────────────────────────────
// ESP-IDF backend
// ───────────────────────────────────────────────────────────────

#[cfg(target_os = "espidf")]
mod esp {
    use core::sync::atomic::{AtomicBool, Ordering};
    use core::time::Duration;

    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use esp_idf_svc::mqtt::client::{
        Details, EspMqttClient, EventPayload, MqttClientConfiguration, QoS,
    };
    use log::{info, warn};

    use super::InboundLanes;
    use crate::app::ports::{ConnectProgress, InboundMessage, MessagingPort, Qos};
    use crate::config::ConnectionConfig;
    use crate::error::TransportError;

    /// MQTT task → control loop.
    pub static INBOUND: InboundLanes<CriticalSectionRawMutex> = InboundLanes::new();

    /// Set by the MQTT task on CONNECTED, cleared on DISCONNECTED.
    static LINK_UP: AtomicBool = AtomicBool::new(false);

    fn qos(q: Qos) -> QoS {
        match q {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
        }
    }

    #[derive(Default)]
    pub struct EspMqttLink {
        client: Option<EspMqttClient<'static>>,
    }

    impl EspMqttLink {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl MessagingPort for EspMqttLink {
        fn connect(&mut self, config: &ConnectionConfig) -> Result<ConnectProgress, TransportError> {
            // Drop any previous session first; it stops its own task.
            self.client = None;
            LINK_UP.store(false, Ordering::Release);

            let url = config.url();
            let conf = MqttClientConfiguration {
                client_id: Some(config.client_id.as_str()),
                username: config.is_authenticated().then_some(config.username.as_str()),
                password: (!config.password.is_empty()).then_some(config.password.as_str()),
                keep_alive_interval: Some(Duration::from_secs(u64::from(config.keepalive_secs))),
                network_timeout: Duration::from_millis(u64::from(config.connect_timeout_ms)),
                ..Default::default()
            };

            let client = EspMqttClient::new_cb(url.as_str(), &conf, |event| match event.payload() {
                EventPayload::Connected(_) => {
                    LINK_UP.store(true, Ordering::Release);
                    info!("mqtt: session up");
                }
                EventPayload::Disconnected => LINK_UP.store(false, Ordering::Release),
                EventPayload::Received {
                    topic: Some(topic),
                    data,
                    details: Details::Complete,
                    ..
                } => {
                    let _ = INBOUND.deliver(topic, data);
                }
                _ => {}
            })
            .map_err(|e| {
                warn!("mqtt: client init for {url} failed: {e:?}");
                TransportError::ConnectFailed
            })?;
            self.client = Some(client);
            info!("mqtt: connecting to {url}");
            Ok(ConnectProgress::Pending)
        }

        fn disconnect(&mut self) {
            self.client = None;
            LINK_UP.store(false, Ordering::Release);
        }

        fn is_connected(&self) -> bool {
            self.client.is_some() && LINK_UP.load(Ordering::Acquire)
        }

        fn publish(&mut self, topic: &str, payload: &[u8], q: Qos) -> Result<(), TransportError> {
            let client = self.client.as_mut().ok_or(TransportError::NotConnected)?;
            client
                .publish(topic, qos(q), false, payload)
                .map(|_| ())
                .map_err(|_| TransportError::PublishFailed)
        }

        fn subscribe(&mut self, topic: &str, q: Qos) -> Result<(), TransportError> {
            let client = self.client.as_mut().ok_or(TransportError::NotConnected)?;
            client
                .subscribe(topic, qos(q))
                .map(|_| ())
                .map_err(|_| TransportError::SubscribeFailed)
        }

        fn poll(&mut self) -> Option<InboundMessage> {
            INBOUND.next_routine()
        }

        fn poll_urgent(&mut self) -> Option<InboundMessage> {
            INBOUND.next_urgent()
        }
    }
}

#[cfg(target_os = "espidf")]
pub use esp::{EspMqttLink, INBOUND};

// ───────────────────────────────────────────────────────────────
// Host simulation backend
// ───────────────────────────────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
mod sim {
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use log::info;

    use super::InboundLanes;
    use crate::app::ports::{ConnectProgress, InboundMessage, MessagingPort, Qos};
    use crate::config::ConnectionConfig;
    use crate::error::TransportError;

    /// A publish the simulated broker accepted.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SimPublish {
        pub topic: String,
        pub payload: Vec<u8>,
        pub qos: Qos,
    }

    /// In-process broker session for host runs and tests.
    pub struct SimMqttLink {
        inbound: InboundLanes<NoopRawMutex>,
        connected: bool,
        /// While set, connect attempts fail (simulated outage).
        pub reject_connects: bool,
        published: Vec<SimPublish>,
        subscriptions: Vec<String>,
    }

    impl Default for SimMqttLink {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SimMqttLink {
        pub fn new() -> Self {
            Self {
                inbound: InboundLanes::new(),
                connected: false,
                reject_connects: false,
                published: Vec::new(),
                subscriptions: Vec::new(),
            }
        }

        /// Queue an inbound message as if the broker delivered it.
        pub fn inject(&self, topic: &str, payload: &[u8]) -> bool {
            self.inbound.deliver(topic, payload)
        }

        /// Simulate the broker dropping the session.
        pub fn drop_session(&mut self) {
            self.connected = false;
        }

        pub fn published(&self) -> &[SimPublish] {
            &self.published
        }

        pub fn take_published(&mut self) -> Vec<SimPublish> {
            core::mem::take(&mut self.published)
        }

        pub fn subscriptions(&self) -> &[String] {
            &self.subscriptions
        }
    }

    impl MessagingPort for SimMqttLink {
        fn connect(&mut self, config: &ConnectionConfig) -> Result<ConnectProgress, TransportError> {
            if self.reject_connects {
                return Err(TransportError::ConnectFailed);
            }
            self.connected = true;
            self.subscriptions.clear();
            info!("mqtt(sim): connected as {} to {}", config.client_id, config.url());
            Ok(ConnectProgress::Up)
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn publish(&mut self, topic: &str, payload: &[u8], qos: Qos) -> Result<(), TransportError> {
            if !self.connected {
                return Err(TransportError::NotConnected);
            }
            self.published.push(SimPublish {
                topic: topic.into(),
                payload: payload.to_vec(),
                qos,
            });
            Ok(())
        }

        fn subscribe(&mut self, topic: &str, _qos: Qos) -> Result<(), TransportError> {
            if !self.connected {
                return Err(TransportError::NotConnected);
            }
            self.subscriptions.push(topic.into());
            Ok(())
        }

        fn poll(&mut self) -> Option<InboundMessage> {
            self.inbound.next_routine()
        }

        fn poll_urgent(&mut self) -> Option<InboundMessage> {
            self.inbound.next_urgent()
        }
    }
}

#[cfg(not(target_os = "espidf"))]
pub use sim::{SimMqttLink, SimPublish};
