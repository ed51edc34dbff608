//! Application core: domain orchestration, zero direct I/O.
//!
//! Routes broker traffic to the actuator registry and the safety
//! controller, persists configuration and records structured events.
//! All interaction with hardware, the broker and flash happens through
//! **port traits** defined in [`ports`], keeping this layer fully testable
//! without real peripherals.

pub mod commands;
pub mod events;
pub mod ports;
pub mod service;
