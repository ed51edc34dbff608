//! Raw peripheral access for actuator outputs.
//!
//! Actuator pins are only known once configuration arrives, so instead of
//! a fixed boot-time pin table this module exposes per-pin primitives:
//! configure a GPIO as a push-pull output, attach it to an LEDC channel,
//! write levels and duties, and reset it on release.
//!
//! On ESP-IDF these are thin wrappers over the sys calls.  On the host
//! they are no-ops that always succeed.

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

#[cfg(target_os = "espidf")]
use log::info;

#[cfg(target_os = "espidf")]
use crate::pins;

// ── Error type ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwInitError {
    GpioConfigFailed(i32),
    LedcInitFailed(i32),
    WriteFailed(i32),
}

impl core::fmt::Display for HwInitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::GpioConfigFailed(rc) => write!(f, "GPIO config failed (rc={})", rc),
            Self::LedcInitFailed(rc)   => write!(f, "LEDC timer/channel config failed (rc={})", rc),
            Self::WriteFailed(rc)      => write!(f, "output write failed (rc={})", rc),
        }
    }
}

#[cfg(target_os = "espidf")]
fn check(ret: esp_err_t, err: fn(i32) -> HwInitError) -> Result<(), HwInitError> {
    if ret == ESP_OK as esp_err_t { Ok(()) } else { Err(err(ret)) }
}

// ── One-shot init ─────────────────────────────────────────────

/// Configure the shared LEDC timer used by every PWM actuator.
#[cfg(target_os = "espidf")]
pub fn init_peripherals(resolution_bits: u8) -> Result<(), HwInitError> {
    let timer = ledc_timer_config_t {
        speed_mode: ledc_mode_t_LEDC_LOW_SPEED_MODE,
        timer_num: ledc_timer_t_LEDC_TIMER_0,
        duty_resolution: resolution_bits as ledc_timer_bit_t,
        freq_hz: pins::PWM_FREQ_HZ,
        clk_cfg: soc_periph_ledc_clk_src_legacy_t_LEDC_AUTO_CLK,
        ..Default::default()
    };
    // SAFETY: called once from main() before the control loop starts.
    check(unsafe { ledc_timer_config(&timer) }, HwInitError::LedcInitFailed)?;
    info!(
        "hw_init: LEDC timer 0 at {} Hz, {}-bit",
        pins::PWM_FREQ_HZ, resolution_bits
    );
    Ok(())
}

#[cfg(not(target_os = "espidf"))]
pub fn init_peripherals(_resolution_bits: u8) -> Result<(), HwInitError> {
    log::info!("hw_init(sim): peripheral init skipped");
    Ok(())
}

// ── GPIO outputs ──────────────────────────────────────────────

/// Push-pull output, driven low.
#[cfg(target_os = "espidf")]
pub fn configure_output(pin: u8) -> Result<(), HwInitError> {
    let cfg = gpio_config_t {
        pin_bit_mask: 1u64 << pin,
        mode: gpio_mode_t_GPIO_MODE_OUTPUT,
        pull_up_en: gpio_pullup_t_GPIO_PULLUP_DISABLE,
        pull_down_en: gpio_pulldown_t_GPIO_PULLDOWN_DISABLE,
        intr_type: gpio_int_type_t_GPIO_INTR_DISABLE,
    };
    // SAFETY: pin was range-checked by the caller; main-loop only.
    check(unsafe { gpio_config(&cfg) }, HwInitError::GpioConfigFailed)?;
    check(unsafe { gpio_set_level(pin as i32, 0) }, HwInitError::WriteFailed)
}

#[cfg(not(target_os = "espidf"))]
pub fn configure_output(_pin: u8) -> Result<(), HwInitError> {
    Ok(())
}

/// Return a pin to its reset state (input, no pulls).
#[cfg(target_os = "espidf")]
pub fn reset_pin(pin: u8) {
    // SAFETY: resetting a pin we owned; main-loop only.
    unsafe {
        gpio_reset_pin(pin as i32);
    }
}

#[cfg(not(target_os = "espidf"))]
pub fn reset_pin(_pin: u8) {}

#[cfg(target_os = "espidf")]
pub fn gpio_write(pin: u8, high: bool) -> Result<(), HwInitError> {
    // SAFETY: pin was configured as output by configure_output().
    check(
        unsafe { gpio_set_level(pin as i32, u32::from(high)) },
        HwInitError::WriteFailed,
    )
}

#[cfg(not(target_os = "espidf"))]
pub fn gpio_write(_pin: u8, _high: bool) -> Result<(), HwInitError> {
    Ok(())
}

// ── LEDC PWM ─────────────────────────────────────────────────

/// Route `pin` to LEDC `channel` on timer 0, duty 0.
#[cfg(target_os = "espidf")]
pub fn ledc_attach(channel: u32, pin: u8) -> Result<(), HwInitError> {
    let cfg = ledc_channel_config_t {
        speed_mode: ledc_mode_t_LEDC_LOW_SPEED_MODE,
        channel,
        timer_sel: ledc_timer_t_LEDC_TIMER_0,
        gpio_num: pin as i32,
        duty: 0,
        hpoint: 0,
        ..Default::default()
    };
    // SAFETY: timer 0 was configured in init_peripherals(); main-loop only.
    check(unsafe { ledc_channel_config(&cfg) }, HwInitError::LedcInitFailed)
}

#[cfg(not(target_os = "espidf"))]
pub fn ledc_attach(_channel: u32, _pin: u8) -> Result<(), HwInitError> {
    Ok(())
}

/// Stop a channel and park its output low.
#[cfg(target_os = "espidf")]
pub fn ledc_detach(channel: u32) {
    // SAFETY: channel was attached by ledc_attach().
    unsafe {
        ledc_stop(ledc_mode_t_LEDC_LOW_SPEED_MODE, channel, 0);
    }
}

#[cfg(not(target_os = "espidf"))]
pub fn ledc_detach(_channel: u32) {}

#[cfg(target_os = "espidf")]
pub fn ledc_set(channel: u32, duty: u32) -> Result<(), HwInitError> {
    // SAFETY: channel configured by ledc_attach(); duty register writes
    // are race-free since only the main loop calls this.
    unsafe {
        check(
            ledc_set_duty(ledc_mode_t_LEDC_LOW_SPEED_MODE, channel, duty),
            HwInitError::WriteFailed,
        )?;
        check(
            ledc_update_duty(ledc_mode_t_LEDC_LOW_SPEED_MODE, channel),
            HwInitError::WriteFailed,
        )
    }
}

#[cfg(not(target_os = "espidf"))]
pub fn ledc_set(_channel: u32, _duty: u32) -> Result<(), HwInitError> {
    Ok(())
}
