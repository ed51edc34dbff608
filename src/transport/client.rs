//! Resilient broker client.
//!
//! Wraps a [`MessagingPort`] with the circuit breaker, the offline queue
//! and the reconnect backoff.  Nothing here sleeps beyond the bounded
//! in-place publish retry; reconnects are deferred to later loop
//! iterations through the backoff timer.
//!
//! ```text
//!   publish ──▶ connected? ──yes──▶ port.publish ──ok──▶ Sent
//!                   │                   │ err (after retries)
//!                   no                  ▼
//!                   └────────────▶ OfflineQueue (+ breaker failure) ──▶ Queued
//!
//!   poll (every loop) ──▶ link lost? ──▶ reconnect: backoff timer ──▶ breaker ──▶ connect
//!          │                                                               │ pending
//!          └──── handshake done? ◀─────────────────────────────────────────┘
//!                  ├─ up: resubscribe, flush FIFO
//!                  └─ connect_timeout_ms passed: failure, backoff
//! ```

use std::time::Duration;

use log::{debug, info, warn};

use crate::app::ports::{ConnectProgress, InboundMessage, MessagingPort, Qos};
use crate::config::{ConnectionConfig, TransportTuning};
use crate::error::TransportError;

use super::backoff::Backoff;
use super::circuit_breaker::{BreakerState, CircuitBreaker};
use super::offline_queue::{OfflineQueue, QueuedMessage};

/// Upper bound on in-place publish retries, whatever the caller asks for.
pub const MAX_PUBLISH_RETRIES: u8 = 3;
/// Topics re-subscribed on every connect.
pub const MAX_SUBSCRIPTIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the broker session.
    Sent,
    /// Parked in the offline queue; `evicted` is set when the oldest
    /// queued message had to make room.
    Queued { evicted: bool },
}

/// Link transitions reported by [`TransportClient::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Connected; `flushed` queued messages were delivered.
    Connected { flushed: usize },
    /// The session dropped since the last poll.
    Lost,
    /// A reconnect attempt failed; the next one is `delay_ms` away.
    RetryScheduled { delay_ms: u64 },
    /// The attempt counter reached its ceiling.  Retries continue at the
    /// capped delay; this is reported once per outage.
    RetriesExhausted,
}

/// Snapshot for heartbeats and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportStats {
    pub connected: bool,
    pub queued: usize,
    pub dropped: u32,
    pub breaker: BreakerState,
    pub reconnect_attempts: u32,
}

#[derive(Debug, Clone)]
struct Subscription {
    topic: heapless::String<96>,
    qos: Qos,
}

pub struct TransportClient<M: MessagingPort> {
    port: M,
    config: ConnectionConfig,
    breaker: CircuitBreaker,
    queue: OfflineQueue,
    backoff: Backoff,
    retry_delay_ms: u32,
    heartbeat_interval_ms: u64,
    /// Earliest time the next reconnect attempt may run.
    next_attempt_ms: u64,
    /// Start of a handshake the port is still completing.
    pending_since_ms: Option<u64>,
    connect_timeout_ms: u64,
    last_heartbeat_ms: u64,
    was_connected: bool,
    subscriptions: heapless::Vec<Subscription, MAX_SUBSCRIPTIONS>,
}

impl<M: MessagingPort> TransportClient<M> {
    pub fn new(port: M, config: ConnectionConfig, tuning: &TransportTuning) -> Self {
        let connect_timeout_ms = u64::from(config.connect_timeout_ms);
        Self {
            port,
            config,
            breaker: CircuitBreaker::from_tuning(tuning),
            queue: OfflineQueue::new(tuning.offline_queue_capacity),
            backoff: Backoff::from_tuning(tuning),
            retry_delay_ms: tuning.publish_retry_delay_ms,
            heartbeat_interval_ms: tuning.heartbeat_interval_secs as u64 * 1_000,
            next_attempt_ms: 0,
            pending_since_ms: None,
            connect_timeout_ms,
            last_heartbeat_ms: 0,
            was_connected: false,
            subscriptions: heapless::Vec::new(),
        }
    }

    // ── Connection lifecycle ──────────────────────────────────────

    /// Start a session now, bypassing the backoff timer.  Never waits for
    /// the handshake.
    ///
    /// `Ok(Some(flushed))` when the port came up before returning: the
    /// breaker closes, every registered topic is re-subscribed and the
    /// offline queue is flushed in FIFO order, stopping at the first
    /// failed send.  `Ok(None)` while the handshake is still running;
    /// [`poll`](Self::poll) reports how it ends.
    pub fn connect(&mut self, now_ms: u64) -> Result<Option<usize>, TransportError> {
        if self.config.host.is_empty() {
            warn!("transport: no broker endpoint configured");
            return Err(TransportError::EmptyEndpoint);
        }

        match self.port.connect(&self.config) {
            Ok(ConnectProgress::Up) => Ok(Some(self.session_up(now_ms))),
            Ok(ConnectProgress::Pending) => {
                self.pending_since_ms = Some(now_ms);
                debug!("transport: handshake with {} started", self.config.url());
                Ok(None)
            }
            Err(e) => {
                self.attempt_failed(e, now_ms);
                Err(TransportError::ConnectFailed)
            }
        }
    }

    pub fn disconnect(&mut self) {
        self.port.disconnect();
        self.was_connected = false;
        self.pending_since_ms = None;
    }

    /// A handshake is in flight.
    pub fn is_connecting(&self) -> bool {
        self.pending_since_ms.is_some()
    }

    /// Reconnect if the session is down and both the backoff timer and
    /// the breaker allow it.  Denied attempts cost nothing.
    pub fn reconnect(&mut self, now_ms: u64) -> Option<LinkEvent> {
        if self.port.is_connected() || self.is_connecting() {
            return None;
        }
        if now_ms < self.next_attempt_ms {
            return None;
        }
        if !self.breaker.allow_request(now_ms) {
            debug!("transport: breaker {:?}, reconnect suppressed", self.breaker.state());
            return None;
        }

        match self.connect(now_ms) {
            Ok(Some(flushed)) => Some(LinkEvent::Connected { flushed }),
            Ok(None) | Err(TransportError::EmptyEndpoint) => None,
            Err(_) => Some(self.failure_event(now_ms)),
        }
    }

    /// Single non-blocking entry point, once per control-loop iteration.
    ///
    /// Completes or times out a pending handshake, detects a dropped
    /// session and drives reconnection.  Inbound traffic is drained
    /// separately through [`next_inbound`](Self::next_inbound).
    pub fn poll(&mut self, now_ms: u64) -> Option<LinkEvent> {
        if let Some(since) = self.pending_since_ms {
            if self.port.is_connected() {
                return Some(LinkEvent::Connected { flushed: self.session_up(now_ms) });
            }
            if now_ms.saturating_sub(since) < self.connect_timeout_ms {
                return None;
            }
            self.port.disconnect();
            self.attempt_failed(TransportError::ConnectTimeout, now_ms);
            return Some(self.failure_event(now_ms));
        }
        if self.port.is_connected() {
            return None;
        }
        if self.was_connected {
            self.was_connected = false;
            self.next_attempt_ms = now_ms;
            warn!("transport: connection lost");
            return Some(LinkEvent::Lost);
        }
        self.reconnect(now_ms)
    }

    /// Next inbound message, if the session has one pending.
    pub fn next_inbound(&mut self) -> Option<InboundMessage> {
        if !self.port.is_connected() {
            return None;
        }
        self.port.poll()
    }

    /// Next emergency message, ahead of anything [`next_inbound`](Self::next_inbound)
    /// would return.  Not gated on the session: a stop received just
    /// before the link dropped is still acted on.
    pub fn next_urgent(&mut self) -> Option<InboundMessage> {
        self.port.poll_urgent()
    }

    // ── Publishing ────────────────────────────────────────────────

    /// Send now, or park in the offline queue.
    ///
    /// `retries` extra attempts are made in place (capped at
    /// [`MAX_PUBLISH_RETRIES`], fixed short pause between them) before
    /// falling back to the queue.  The only error is a message too large
    /// to be queued.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        retries: u8,
        now_ms: u64,
    ) -> Result<PublishOutcome, TransportError> {
        if self.port.is_connected() {
            let attempts = retries.min(MAX_PUBLISH_RETRIES) + 1;
            for attempt in 0..attempts {
                match self.port.publish(topic, payload, qos) {
                    Ok(()) => return Ok(PublishOutcome::Sent),
                    Err(e) => {
                        debug!("transport: publish to {topic} failed ({e}), attempt {}", attempt + 1);
                        if attempt + 1 < attempts && self.retry_delay_ms > 0 {
                            std::thread::sleep(Duration::from_millis(self.retry_delay_ms as u64));
                        }
                    }
                }
            }
        }

        self.breaker.record_failure(now_ms);
        let msg = QueuedMessage::new(topic, payload, qos, now_ms)?;
        let evicted = self.queue.push(msg).is_some();
        Ok(PublishOutcome::Queued { evicted })
    }

    /// Register a topic; subscribed immediately when connected and again
    /// after every reconnect.
    pub fn subscribe(&mut self, topic: &str, qos: Qos) -> Result<(), TransportError> {
        if !self.subscriptions.iter().any(|s| s.topic == topic) {
            let mut t = heapless::String::new();
            t.push_str(topic).map_err(|_| TransportError::TopicTooLong)?;
            self.subscriptions
                .push(Subscription { topic: t, qos })
                .map_err(|_| TransportError::SubscribeFailed)?;
        }
        if self.port.is_connected() {
            self.port.subscribe(topic, qos)?;
        }
        Ok(())
    }

    // ── Heartbeat ─────────────────────────────────────────────────

    pub fn heartbeat_due(&self, now_ms: u64) -> bool {
        self.port.is_connected()
            && now_ms.saturating_sub(self.last_heartbeat_ms) >= self.heartbeat_interval_ms
    }

    /// Best-effort liveness message.  Never queued: a stale heartbeat
    /// carries no information.
    pub fn heartbeat(&mut self, topic: &str, payload: &[u8], now_ms: u64) -> bool {
        if !self.heartbeat_due(now_ms) {
            return false;
        }
        self.last_heartbeat_ms = now_ms;
        match self.port.publish(topic, payload, Qos::AtMostOnce) {
            Ok(()) => true,
            Err(e) => {
                debug!("transport: heartbeat not sent ({e})");
                false
            }
        }
    }

    // ── Accessors ─────────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.port.is_connected()
    }

    /// Reconnect attempts have hit the ceiling during the current outage.
    pub fn is_fatal(&self) -> bool {
        self.backoff.is_exhausted()
    }

    pub fn queue_headroom(&self) -> usize {
        self.queue.headroom()
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            connected: self.port.is_connected(),
            queued: self.queue.len(),
            dropped: self.queue.dropped(),
            breaker: self.breaker.state(),
            reconnect_attempts: self.backoff.attempts(),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn port(&self) -> &M {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut M {
        &mut self.port
    }

    // ── Internal ──────────────────────────────────────────────────

    fn session_up(&mut self, now_ms: u64) -> usize {
        self.pending_since_ms = None;
        self.breaker.record_success(now_ms);
        self.backoff.reset();
        self.was_connected = true;
        self.last_heartbeat_ms = now_ms;
        info!("transport: connected to {}", self.config.url());

        self.resubscribe();
        self.flush_queue()
    }

    fn attempt_failed(&mut self, cause: TransportError, now_ms: u64) {
        self.pending_since_ms = None;
        self.breaker.record_failure(now_ms);
        let delay = self.backoff.on_failure();
        self.next_attempt_ms = now_ms.saturating_add(delay);
        warn!(
            "transport: connect to {} failed ({cause}); attempt {} retry in {} ms",
            self.config.url(),
            self.backoff.attempts(),
            delay
        );
    }

    fn failure_event(&mut self, now_ms: u64) -> LinkEvent {
        if self.backoff.take_exhausted() {
            LinkEvent::RetriesExhausted
        } else {
            LinkEvent::RetryScheduled {
                delay_ms: self.next_attempt_ms.saturating_sub(now_ms),
            }
        }
    }

    fn resubscribe(&mut self) {
        for sub in &self.subscriptions {
            if let Err(e) = self.port.subscribe(&sub.topic, sub.qos) {
                warn!("transport: subscribe {} failed ({e})", sub.topic);
            }
        }
    }

    fn flush_queue(&mut self) -> usize {
        let mut sent = 0;
        while let Some(msg) = self.queue.front() {
            if let Err(e) = self.port.publish(&msg.topic, &msg.payload, msg.qos) {
                warn!(
                    "transport: flush stopped after {sent} ({e}); {} still queued",
                    self.queue.len()
                );
                break;
            }
            self.queue.pop();
            sent += 1;
        }
        if sent > 0 {
            info!("transport: flushed {sent} queued message(s)");
        }
        sent
    }
}
