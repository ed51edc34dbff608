//! AquaNode actuator controller library.
//!
//! Exposes the domain and adapter modules for the firmware binary and
//! for host-side integration testing.  All ESP-IDF-specific code is
//! guarded by `#[cfg(target_os = "espidf")]` within each module.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod config;
pub mod drivers;
pub mod error;
pub mod pins;
pub mod protocol;
pub mod registry;
pub mod safety;
pub mod transport;
