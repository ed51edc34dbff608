//! GPIO constraints for the AquaNode main board (ESP32-S3-WROOM-1).
//!
//! Actuator pins are assigned at runtime by configuration, so this module
//! only knows which pins exist and which ones the board already uses.
//! Every configuration item is checked against it before a driver is built.

/// Highest GPIO number on the ESP32-S3.
pub const MAX_GPIO: u8 = 48;

/// Pins the board wires to flash/PSRAM, USB, and strapping functions.
/// Claiming any of these would brick the module or the debug port.
pub const RESERVED_GPIOS: &[u8] = &[
    0,  // strapping: boot mode
    19, // USB D-
    20, // USB D+
    26, 27, 28, 29, 30, 31, 32, // SPI flash
    45, 46, // strapping: VDD_SPI / ROM log
];

/// Onboard status LED (claimed by the system at boot).
pub const STATUS_LED_GPIO: u8 = 48;

// ---------------------------------------------------------------------------
// PWM configuration
// ---------------------------------------------------------------------------

/// Number of LEDC channels on the ESP32-S3 (low-speed group).
pub const LEDC_CHANNELS: usize = 8;
/// Default LEDC resolution (bits).  8-bit gives 0 – 255 duty levels.
pub const PWM_RESOLUTION_BITS: u8 = 8;
/// LEDC base frequency for PWM loads (25 kHz, inaudible on pump motors).
pub const PWM_FREQ_HZ: u32 = 25_000;

/// Whether `gpio` exists and is free for actuator use.
pub fn is_assignable(gpio: u8) -> bool {
    gpio <= MAX_GPIO && !RESERVED_GPIOS.contains(&gpio) && gpio != STATUS_LED_GPIO
}
