//! Fuzz target: actuator command and emergency payload parsers
//!
//! Both parsers sit directly behind the broker subscription, so any byte
//! string can reach them.  Asserts that they never panic and that a
//! successful parse is always a well-formed command.
//!
//! cargo fuzz run fuzz_command_parse

#![no_main]

use aquanode::protocol::{parse_command, parse_emergency, ActuatorCommand};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(cmd) = parse_command(data) {
        // Bare command names must parse back to the same command.
        if !matches!(cmd, ActuatorCommand::Set(_)) {
            assert_eq!(parse_command(cmd.name().as_bytes()), Ok(cmd));
        }
    }

    if let Ok(req) = parse_emergency(data) {
        assert!(req.reason.len() <= 64, "reason exceeds its bound");
    }
});
