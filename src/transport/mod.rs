//! Resilient broker transport.
//!
//! | Module            | Role                                         |
//! |-------------------|----------------------------------------------|
//! | `circuit_breaker` | CLOSED/OPEN/HALF_OPEN gate on connect storms |
//! | `offline_queue`   | Bounded drop-oldest FIFO while offline       |
//! | `backoff`         | Exponential reconnect schedule               |
//! | `client`          | Session lifecycle, publish, heartbeat        |

pub mod backoff;
pub mod circuit_breaker;
pub mod client;
pub mod offline_queue;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use client::{LinkEvent, PublishOutcome, TransportClient, TransportStats};
pub use offline_queue::{OfflineQueue, QueuedMessage};
