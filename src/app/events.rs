//! Structured application events.
//!
//! The core records these through the [`EventSink`](super::ports::EventSink)
//! port.  Adapters on the other side decide what to do with them: log to
//! serial, keep a ring of recent faults, forward to a remote collector.

use core::fmt;

/// Event severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Closed set of event codes emitted by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCode {
    Started,
    Connected,
    ConnectionLost,
    ReconnectFailed,
    /// Reconnect attempts hit the configured ceiling.
    RetriesExhausted,
    MessageDropped,
    CommandApplied,
    CommandRejected,
    /// Duty-cycle or runtime protection refused an activation.
    ProtectionRefused,
    /// Runtime cap reached; the driver switched itself off.
    RuntimeCutoff,
    ConfigApplied,
    ConfigRejected,
    StorageFailed,
    EmergencyTriggered,
    EmergencyClearRejected,
    EmergencyCleared,
    ActuatorResumed,
    ActuatorResumeSkipped,
    ResumeComplete,
    HardwareFault,
}

impl EventCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "START",
            Self::Connected => "LINK_UP",
            Self::ConnectionLost => "LINK_DOWN",
            Self::ReconnectFailed => "LINK_RETRY",
            Self::RetriesExhausted => "LINK_FATAL",
            Self::MessageDropped => "MSG_DROP",
            Self::CommandApplied => "CMD_OK",
            Self::CommandRejected => "CMD_REJECT",
            Self::ProtectionRefused => "PROT_REFUSE",
            Self::RuntimeCutoff => "PROT_CUTOFF",
            Self::ConfigApplied => "CFG_OK",
            Self::ConfigRejected => "CFG_REJECT",
            Self::StorageFailed => "STORE_FAIL",
            Self::EmergencyTriggered => "ESTOP",
            Self::EmergencyClearRejected => "ESTOP_CLEAR_REJECT",
            Self::EmergencyCleared => "ESTOP_CLEAR",
            Self::ActuatorResumed => "RESUME_STEP",
            Self::ActuatorResumeSkipped => "RESUME_SKIP",
            Self::ResumeComplete => "RESUME_DONE",
            Self::HardwareFault => "HW_FAULT",
        }
    }
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
