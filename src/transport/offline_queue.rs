//! Bounded FIFO of outbound messages held while the broker is unreachable.
//!
//! Backed by a fixed `heapless::Deque`, so it never allocates.  The
//! runtime capacity (from [`TransportTuning`](crate::config::TransportTuning))
//! may be smaller than the compiled maximum.
//!
//! Overflow policy is **drop-oldest**: the newest telemetry is worth more
//! than stale state.  Every eviction is counted in [`OfflineQueue::dropped`].

use log::warn;

use crate::app::ports::Qos;
use crate::error::TransportError;

/// Compiled upper bound on queued messages.
pub const OFFLINE_QUEUE_MAX: usize = 32;
/// Largest topic a queued message may carry.
pub const QUEUED_TOPIC_MAX: usize = 96;
/// Largest payload a queued message may carry.
pub const QUEUED_PAYLOAD_MAX: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub topic: heapless::String<QUEUED_TOPIC_MAX>,
    pub payload: heapless::Vec<u8, QUEUED_PAYLOAD_MAX>,
    pub qos: Qos,
    pub enqueued_ms: u64,
}

impl QueuedMessage {
    pub fn new(topic: &str, payload: &[u8], qos: Qos, now_ms: u64) -> Result<Self, TransportError> {
        let mut t = heapless::String::new();
        t.push_str(topic).map_err(|_| TransportError::TopicTooLong)?;
        let mut p = heapless::Vec::new();
        p.extend_from_slice(payload)
            .map_err(|_| TransportError::PayloadTooLarge)?;
        Ok(Self {
            topic: t,
            payload: p,
            qos,
            enqueued_ms: now_ms,
        })
    }
}

pub struct OfflineQueue {
    items: heapless::Deque<QueuedMessage, OFFLINE_QUEUE_MAX>,
    capacity: usize,
    dropped: u32,
}

impl OfflineQueue {
    /// `capacity` is clamped to `1..=OFFLINE_QUEUE_MAX`; config validation
    /// already rejects values outside that range.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: heapless::Deque::new(),
            capacity: capacity.clamp(1, OFFLINE_QUEUE_MAX),
            dropped: 0,
        }
    }

    /// Append a message.  Returns the evicted oldest message when full.
    pub fn push(&mut self, msg: QueuedMessage) -> Option<QueuedMessage> {
        let evicted = if self.items.len() >= self.capacity {
            self.dropped = self.dropped.saturating_add(1);
            let old = self.items.pop_front();
            if let Some(ref m) = old {
                warn!("offline queue full: dropped oldest message for {}", m.topic);
            }
            old
        } else {
            None
        };
        // Room is guaranteed by the eviction above.
        let _ = self.items.push_back(msg);
        evicted
    }

    /// Oldest message without removing it.
    pub fn front(&self) -> Option<&QueuedMessage> {
        self.items.front()
    }

    pub fn pop(&mut self) -> Option<QueuedMessage> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots before the next push evicts.
    pub fn headroom(&self) -> usize {
        self.capacity - self.items.len()
    }

    /// Total messages evicted since boot.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}
