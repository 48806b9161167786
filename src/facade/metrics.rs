//! Facade counters
//!
//! Monotonic counters incremented exactly once per successful dispatch.
//! Reads are wait-free; a snapshot is not linearizable across counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by the facade.
#[derive(Debug, Default)]
pub(crate) struct MessagingMetrics {
    pub commands_sent: AtomicU64,
    pub queries_sent: AtomicU64,
    pub events_published: AtomicU64,
    pub messages_queued: AtomicU64,
    pub outbox_messages: AtomicU64,
    pub inbox_messages: AtomicU64,
}

impl MessagingMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            queries_sent: self.queries_sent.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            messages_queued: self.messages_queued.load(Ordering::Relaxed),
            outbox_messages: self.outbox_messages.load(Ordering::Relaxed),
            inbox_messages: self.inbox_messages.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the facade counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Commands dispatched successfully
    pub commands_sent: u64,
    /// Queries executed successfully
    pub queries_sent: u64,
    /// Events published successfully
    pub events_published: u64,
    /// Messages enqueued successfully
    pub messages_queued: u64,
    /// Messages published to the outbox successfully
    pub outbox_messages: u64,
    /// Incoming messages processed successfully
    pub inbox_messages: u64,
}
