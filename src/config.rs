//! System configuration parameters
//!
//! All tunable parameters for the AquaNode controller.
//! Values can be overridden via NVS (non-volatile storage); actuator
//! definitions are stored separately (see [`ConfigPort`](crate::app::ports::ConfigPort)).

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::{ConfigPort, StoreError};
use crate::drivers::protection::RuntimeProtectionPolicy;
use crate::transport::offline_queue::OFFLINE_QUEUE_MAX;

/// Broker connection parameters.  Immutable per connection attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Broker host name or IP.  Empty = not provisioned.
    pub host: heapless::String<64>,
    pub port: u16,
    /// MQTT client identity.  Empty = derive from the factory MAC.
    pub client_id: heapless::String<32>,
    /// Empty username = unauthenticated mode.
    pub username: heapless::String<32>,
    pub password: heapless::String<64>,
    pub keepalive_secs: u16,
    pub connect_timeout_ms: u32,
}

impl ConnectionConfig {
    pub fn is_authenticated(&self) -> bool {
        !self.username.is_empty()
    }

    /// `mqtt://host:port` broker URL.
    pub fn url(&self) -> heapless::String<96> {
        let mut url = heapless::String::new();
        let _ = core::fmt::Write::write_fmt(
            &mut url,
            format_args!("mqtt://{}:{}", self.host, self.port),
        );
        url
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: heapless::String::new(),
            port: 1883,
            client_id: heapless::String::new(),
            username: heapless::String::new(),
            password: heapless::String::new(),
            keepalive_secs: 30,
            connect_timeout_ms: 5000,
        }
    }
}

/// Circuit breaker, backoff, offline queue and heartbeat tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportTuning {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open.
    pub open_duration_ms: u64,
    /// How long a half-open trial may stay unanswered.
    pub trial_duration_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Exponent stops growing at this attempt.
    pub backoff_exponent_cap: u32,
    /// Attempt count after which retry exhaustion is reported.
    pub max_reconnect_attempts: u32,
    pub offline_queue_capacity: usize,
    /// Fixed pause between in-place publish retries.
    pub publish_retry_delay_ms: u32,
    pub heartbeat_interval_secs: u32,
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_ms: 30_000,
            trial_duration_ms: 10_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            backoff_exponent_cap: 7,
            max_reconnect_attempts: 10,
            offline_queue_capacity: OFFLINE_QUEUE_MAX,
            publish_retry_delay_ms: 5,
            heartbeat_interval_secs: 60,
        }
    }
}

/// Emergency recovery sequencing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Pause between re-enabling successive actuators during resume.
    pub inter_actuator_delay_ms: u64,
    /// Re-enable actuators flagged `critical` before the rest.
    pub critical_first: bool,
    /// Minimum time an emergency stop must last before it may be cleared.
    pub min_stop_duration_ms: u64,
    /// Lockout after `max_clear_retries` failed verifications.
    pub verification_timeout_ms: u64,
    pub max_clear_retries: u8,
    /// Start the resume sequence as soon as a clear passes verification.
    pub auto_resume: bool,
    /// Clearing requires a live broker connection.
    pub require_connectivity: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            inter_actuator_delay_ms: 2_000,
            critical_first: true,
            min_stop_duration_ms: 5_000,
            verification_timeout_ms: 60_000,
            max_clear_retries: 3,
            auto_resume: true,
            require_connectivity: true,
        }
    }
}

/// Core system configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub connection: ConnectionConfig,
    pub transport: TransportTuning,
    pub recovery: RecoveryConfig,

    // --- Actuators ---
    /// Protection applied to pumps that do not carry their own policy.
    pub default_protection: RuntimeProtectionPolicy,
    /// Full closed→open travel time of motorised valves.
    pub valve_transition_ms: u32,
    /// LEDC duty resolution for PWM actuators.
    pub pwm_resolution_bits: u8,

    // --- Timing ---
    /// Control loop interval (milliseconds)
    pub control_loop_interval_ms: u32,
    /// Full status report interval (seconds)
    pub status_interval_secs: u32,

    // --- Inbound ---
    /// Sustained actuator/config commands per second.
    pub command_rate_per_sec: u32,
    pub command_burst: u32,
    /// First topic segment, e.g. `aquanode/AQ-EFCAFE/...`.
    pub topic_prefix: heapless::String<24>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        let mut topic_prefix = heapless::String::new();
        let _ = topic_prefix.push_str("aquanode");
        Self {
            connection: ConnectionConfig::default(),
            transport: TransportTuning::default(),
            recovery: RecoveryConfig::default(),

            default_protection: RuntimeProtectionPolicy::default(),
            valve_transition_ms: 6_000,
            pwm_resolution_bits: crate::pins::PWM_RESOLUTION_BITS,

            control_loop_interval_ms: 20,  // 50 Hz
            status_interval_secs: 300,     // 1/5 min

            command_rate_per_sec: 10,
            command_burst: 10,
            topic_prefix,
        }
    }
}

impl SystemConfig {
    /// Boot-time load: the stored record, or defaults when there is none
    /// or it is unusable.  Backend failures are returned to the caller.
    pub fn load_or_default(store: &impl ConfigPort) -> crate::error::Result<Self> {
        match store.load() {
            Ok(cfg) => {
                info!("config loaded from storage");
                Ok(cfg)
            }
            Err(StoreError::NotFound) => {
                info!("no stored config, using defaults");
                Ok(Self::default())
            }
            Err(e @ (StoreError::Corrupted | StoreError::ValidationFailed(_))) => {
                warn!("stored config unusable ({e}), using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Range-check every field.  Invalid values are rejected, never clamped.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !(100..=30_000).contains(&self.connection.connect_timeout_ms) {
            return Err("connection.connect_timeout_ms must be 100..=30000");
        }
        let t = &self.transport;
        if t.failure_threshold == 0 {
            return Err("transport.failure_threshold must be > 0");
        }
        if t.open_duration_ms == 0 || t.trial_duration_ms == 0 {
            return Err("breaker durations must be > 0");
        }
        if t.backoff_base_ms == 0 || t.backoff_max_ms < t.backoff_base_ms {
            return Err("backoff_max_ms must be >= backoff_base_ms > 0");
        }
        if t.backoff_exponent_cap > 16 {
            return Err("backoff_exponent_cap must be <= 16");
        }
        if t.offline_queue_capacity == 0 || t.offline_queue_capacity > OFFLINE_QUEUE_MAX {
            return Err("offline_queue_capacity out of range");
        }
        if t.publish_retry_delay_ms > 20 {
            return Err("publish_retry_delay_ms must be <= 20");
        }
        if t.heartbeat_interval_secs == 0 {
            return Err("heartbeat_interval_secs must be > 0");
        }
        if self.recovery.max_clear_retries == 0 {
            return Err("recovery.max_clear_retries must be > 0");
        }
        self.default_protection.validate()?;
        if self.valve_transition_ms == 0 {
            return Err("valve_transition_ms must be > 0");
        }
        if !(1..=14).contains(&self.pwm_resolution_bits) {
            return Err("pwm_resolution_bits must be 1..=14");
        }
        if self.control_loop_interval_ms == 0 || self.control_loop_interval_ms > 100 {
            return Err("control_loop_interval_ms must be 1..=100");
        }
        if self.command_rate_per_sec == 0 || self.command_burst == 0 {
            return Err("command rate limit must be > 0");
        }
        if self.topic_prefix.is_empty() || self.topic_prefix.contains(['+', '#', '/']) {
            return Err("topic_prefix must be a single non-wildcard segment");
        }
        Ok(())
    }
}
