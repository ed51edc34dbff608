//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by writing structured events to the `log`
//! facade (ESP-IDF logger on the device, UART / USB-CDC in production).
//! Lines look like `LINK_DOWN | broker session dropped`, so they grep well
//! on a serial capture.

use log::{debug, error, info, warn};

use crate::app::events::{EventCode, Severity};
use crate::app::ports::EventSink;

/// Adapter that logs every event at the level matching its severity.
#[derive(Debug, Default)]
pub struct LogEventSink {
    recorded: u32,
}

impl LogEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded since boot.
    pub fn recorded(&self) -> u32 {
        self.recorded
    }
}

impl EventSink for LogEventSink {
    fn record(&mut self, severity: Severity, code: EventCode, message: &str) {
        self.recorded = self.recorded.wrapping_add(1);
        match severity {
            Severity::Debug => debug!("{code} | {message}"),
            Severity::Info => info!("{code} | {message}"),
            Severity::Warning => warn!("{code} | {message}"),
            Severity::Error => error!("{code} | {message}"),
            Severity::Critical => error!("{code} | CRITICAL | {message}"),
        }
    }
}
