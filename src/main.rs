//! AquaNode Firmware: Main Entry Point
//!
//! Hexagonal architecture with a single cooperative control loop.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  GpioBank        EspMqttLink      NvsAdapter    LogEventSink   │
//! │  (PinPort)       (MessagingPort)  (ConfigPort)  (EventSink)    │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │              AppService (domain)                       │    │
//! │  │  TransportClient · ActuatorRegistry · SafetyController │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! │                                                                │
//! │  Watchdog (fed every iteration)                                │
//! └────────────────────────────────────────────────────────────────┘
//! ```
#![deny(unused_must_use)]

use anyhow::{Context, Result, anyhow};
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::delay::FreeRtos;
use esp_idf_svc::hal::modem::Modem;
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use log::{error, info, warn};

use aquanode::adapters::device_id;
use aquanode::adapters::gpio::GpioBank;
use aquanode::adapters::log_sink::LogEventSink;
use aquanode::adapters::mqtt::EspMqttLink;
use aquanode::adapters::nvs::NvsAdapter;
use aquanode::adapters::time::{MonotonicClock, platform_now};
use aquanode::app::service::AppService;
use aquanode::config::SystemConfig;
use aquanode::drivers::{hw_init, watchdog::Watchdog};
use aquanode::error::Error;

// Station credentials are provisioned at build time; association itself
// belongs to the board bring-up, not the control core.
const WIFI_SSID: &str = match option_env!("AQUANODE_WIFI_SSID") {
    Some(s) => s,
    None => "",
};
const WIFI_PASS: &str = match option_env!("AQUANODE_WIFI_PASS") {
    Some(s) => s,
    None => "",
};

// ── Main ──────────────────────────────────────────────────────

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;

    info!("╔══════════════════════════════════════╗");
    info!("║  AquaNode v{}                        ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    // ── 2. Load config from NVS (or defaults) ─────────────────
    let mut nvs = NvsAdapter::new().map_err(Error::from).context("NVS init")?;
    let config = match SystemConfig::load_or_default(&nvs) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("NVS config load failed ({e}), using defaults");
            SystemConfig::default()
        }
    };

    // ── 3. Peripherals ────────────────────────────────────────
    hw_init::init_peripherals(config.pwm_resolution_bits)
        .map_err(|e| anyhow!("peripheral init: {e}"))?;
    let mut pins = GpioBank::new();
    let mut log_sink = LogEventSink::new();
    let clock = MonotonicClock::new();

    // ── 4. Device identity + network ──────────────────────────
    let mac = device_id::read_mac();
    let dev_id = device_id::device_id(&mac);
    info!("Device ID: {} (hostname: {})", dev_id, device_id::hostname(&mac));

    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    // Keep the driver alive for the lifetime of the loop.
    let _wifi = match bring_up_network(peripherals.modem, sysloop) {
        Ok(wifi) => Some(wifi),
        Err(e) => {
            // The transport keeps retrying with backoff; actuators run
            // under local protection meanwhile.
            error!("network bring-up failed: {e:#}");
            None
        }
    };

    // ── 5. App service ────────────────────────────────────────
    let loop_interval_ms = config.control_loop_interval_ms;
    let mut app = AppService::new(EspMqttLink::new(), config, &dev_id, platform_now);
    app.start(&mut pins, &nvs, &mut log_sink, clock.now_ms());

    let watchdog = Watchdog::default();
    info!("System ready. Entering control loop ({} ms).", loop_interval_ms);

    // ── 6. Control loop ───────────────────────────────────────
    loop {
        watchdog.feed();
        app.tick(&mut pins, &mut nvs, &mut log_sink, clock.now_ms());
        FreeRtos::delay_ms(loop_interval_ms);
    }
}

fn bring_up_network(
    modem: Modem,
    sysloop: EspSystemEventLoop,
) -> Result<BlockingWifi<EspWifi<'static>>> {
    if WIFI_SSID.is_empty() {
        return Err(anyhow!("no station credentials compiled in"));
    }
    let mut wifi = BlockingWifi::wrap(EspWifi::new(modem, sysloop.clone(), None)?, sysloop)?;
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: WIFI_SSID.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
        password: WIFI_PASS.try_into().map_err(|_| anyhow!("wifi password too long"))?,
        auth_method: if WIFI_PASS.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        },
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.connect().context("wifi connect")?;
    wifi.wait_netif_up().context("wifi netif")?;
    info!("wifi up on `{}`", WIFI_SSID);
    Ok(wifi)
}
