//! Actuator drivers, runtime protection, and peripheral helpers.

pub mod actuator;
pub mod binary;
pub mod hw_init;
pub mod protection;
pub mod pwm;
pub mod valve;
pub mod watchdog;
