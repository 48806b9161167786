//! Delayed message delivery
//!
//! Two scheduler implementations share one contract: an in-memory
//! scheduler with a deadline-driven dispatcher ([`InMemoryScheduler`])
//! and a storage-backed scheduler with a polling dispatcher
//! ([`StorageScheduler`]). Both hand due messages to an injected
//! [`MessageDeliveryHandler`] in `(deliver_at asc, priority desc)` order.

pub mod in_memory;
pub mod polling;
pub mod storage;

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{MessagingError, MessagingResult};
use crate::message::{Message, Metadata};

pub use in_memory::InMemoryScheduler;
pub use polling::{StorageScheduler, StorageSchedulerConfig};
pub use storage::{InMemoryScheduledMessageStorage, ScheduledMessageStorage};

/// How far in the past a deliver-at instant may lie before it is rejected
pub const PAST_DELIVERY_TOLERANCE: Duration = Duration::from_secs(1);

/// Unique identifier for a scheduled message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(#[serde(with = "uuid::serde::compact")] pub Uuid);

impl ScheduleId {
    /// Generate a new schedule ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-schedule options
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Logical destination (queue name, topic, ...)
    pub destination: Option<String>,
    /// Higher dispatches first among equal deadlines
    pub priority: i32,
    /// Ordered metadata bag
    pub metadata: Metadata,
}

/// A message with its delivery deadline. Immutable once scheduled;
/// status lives in the containing [`ScheduledMessageEntry`].
#[derive(Debug, Clone)]
pub struct ScheduledMessage {
    /// Schedule identity
    pub schedule_id: ScheduleId,
    /// The message to deliver
    pub message: Arc<dyn Message>,
    /// When to deliver
    pub deliver_at: DateTime<Utc>,
    /// When scheduling happened
    pub scheduled_at: DateTime<Utc>,
    /// Per-schedule options
    pub options: ScheduleOptions,
}

/// Entry lifecycle. `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    /// Waiting for its deadline
    Pending,
    /// Handed to the delivery handler successfully
    Delivered,
    /// Cancelled before dispatch
    Cancelled,
    /// Delivery failed; retained for diagnosis
    Failed,
}

/// Storage-owned wrapper around a scheduled message.
#[derive(Debug, Clone)]
pub struct ScheduledMessageEntry {
    /// The immutable schedule payload
    pub message: ScheduledMessage,
    /// Current lifecycle state
    pub status: ScheduleStatus,
    /// Set when the entry reaches `Delivered`
    pub delivered_at: Option<DateTime<Utc>>,
    /// Set when the entry reaches `Failed`
    pub error_message: Option<String>,
    /// Instant of the last status change
    pub last_updated: DateTime<Utc>,
}

impl ScheduledMessageEntry {
    /// Create a pending entry.
    pub fn pending(message: ScheduledMessage, now: DateTime<Utc>) -> Self {
        Self {
            message,
            status: ScheduleStatus::Pending,
            delivered_at: None,
            error_message: None,
            last_updated: now,
        }
    }

    /// Schedule identity
    pub fn schedule_id(&self) -> ScheduleId {
        self.message.schedule_id
    }
}

/// Dispatch order: earliest deadline first, then highest priority, then
/// schedule id for a stable tiebreak.
pub(crate) fn due_order(a: &ScheduledMessageEntry, b: &ScheduledMessageEntry) -> CmpOrdering {
    a.message
        .deliver_at
        .cmp(&b.message.deliver_at)
        .then_with(|| b.message.options.priority.cmp(&a.message.options.priority))
        .then_with(|| a.message.schedule_id.0.cmp(&b.message.schedule_id.0))
}

/// Outcome of a schedule call
#[derive(Debug, Clone)]
pub struct ScheduleResult {
    /// Whether the message was scheduled
    pub success: bool,
    /// Schedule identity (meaningful when `success`)
    pub schedule_id: ScheduleId,
    /// The deadline that was recorded
    pub scheduled_for: DateTime<Utc>,
    /// Failure cause when not successful
    pub error_message: Option<String>,
}

/// Conjunctive filters over scheduled entries; pagination applies after
/// filtering, ordering is stable.
#[derive(Debug, Clone, Default)]
pub struct ScheduledMessageQuery {
    /// Match this status
    pub status: Option<ScheduleStatus>,
    /// Match this destination
    pub destination: Option<String>,
    /// Match this message type name
    pub message_type: Option<String>,
    /// Deadline strictly after this instant
    pub deliver_after: Option<DateTime<Utc>>,
    /// Deadline strictly before this instant
    pub deliver_before: Option<DateTime<Utc>>,
    /// Skip this many matches
    pub offset: Option<usize>,
    /// Return at most this many matches
    pub limit: Option<usize>,
}

impl ScheduledMessageQuery {
    pub(crate) fn matches(&self, entry: &ScheduledMessageEntry) -> bool {
        if let Some(status) = self.status {
            if entry.status != status {
                return false;
            }
        }
        if let Some(destination) = &self.destination {
            if entry.message.options.destination.as_deref() != Some(destination.as_str()) {
                return false;
            }
        }
        if let Some(message_type) = &self.message_type {
            if entry.message.message.message_type() != message_type {
                return false;
            }
        }
        if let Some(after) = self.deliver_after {
            if entry.message.deliver_at <= after {
                return false;
            }
        }
        if let Some(before) = self.deliver_before {
            if entry.message.deliver_at >= before {
                return false;
            }
        }
        true
    }

    pub(crate) fn paginate(&self, mut entries: Vec<ScheduledMessageEntry>) -> Vec<ScheduledMessageEntry> {
        let offset = self.offset.unwrap_or(0);
        if offset >= entries.len() {
            return Vec::new();
        }
        entries.drain(..offset);
        if let Some(limit) = self.limit {
            entries.truncate(limit);
        }
        entries
    }
}

/// Receives due messages from a scheduler.
#[async_trait]
pub trait MessageDeliveryHandler: Send + Sync {
    /// Deliver one due message.
    async fn deliver(
        &self,
        message: &ScheduledMessage,
        cancel: &CancellationToken,
    ) -> MessagingResult<()>;

    /// Observe a delivery failure; the entry is marked `Failed` regardless.
    async fn handle_delivery_failure(
        &self,
        _schedule_id: ScheduleId,
        _error: &MessagingError,
        _cancel: &CancellationToken,
    ) {
    }
}

/// Shared scheduler contract.
#[async_trait]
pub trait MessageScheduler: Send + Sync {
    /// Schedule delivery after `delay`.
    async fn schedule_in(
        &self,
        message: Arc<dyn Message>,
        delay: Duration,
        options: Option<ScheduleOptions>,
    ) -> MessagingResult<ScheduleResult>;

    /// Schedule delivery at `deliver_at`; instants more than
    /// [`PAST_DELIVERY_TOLERANCE`] in the past are rejected.
    async fn schedule_at(
        &self,
        message: Arc<dyn Message>,
        deliver_at: DateTime<Utc>,
        options: Option<ScheduleOptions>,
    ) -> MessagingResult<ScheduleResult>;

    /// Move a pending entry to `Cancelled`; false if it was not pending.
    async fn cancel(&self, schedule_id: ScheduleId) -> bool;

    /// Look up one entry.
    async fn get_scheduled(&self, schedule_id: ScheduleId) -> Option<ScheduledMessageEntry>;

    /// Pending entries matching `query`, in dispatch order.
    async fn get_pending(
        &self,
        query: Option<ScheduledMessageQuery>,
    ) -> Vec<ScheduledMessageEntry>;

    /// Number of pending entries.
    async fn get_pending_count(&self) -> u64;
}

pub(crate) fn validate_deliver_at(
    deliver_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> MessagingResult<()> {
    let tolerance =
        chrono::Duration::from_std(PAST_DELIVERY_TOLERANCE).unwrap_or_else(|_| chrono::Duration::zero());
    if deliver_at < now - tolerance {
        return Err(MessagingError::invalid_input(
            "deliver_at",
            format!("delivery time {deliver_at} is in the past"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::GenericMessage;

    fn entry(
        deliver_at: DateTime<Utc>,
        priority: i32,
        destination: Option<&str>,
    ) -> ScheduledMessageEntry {
        let message = ScheduledMessage {
            schedule_id: ScheduleId::new(),
            message: Arc::new(GenericMessage::new(serde_json::Value::Null, deliver_at)),
            deliver_at,
            scheduled_at: deliver_at,
            options: ScheduleOptions {
                destination: destination.map(str::to_string),
                priority,
                metadata: Metadata::new(),
            },
        };
        ScheduledMessageEntry::pending(message, deliver_at)
    }

    #[test]
    fn test_due_order_prefers_earlier_then_higher_priority() {
        let base = Utc::now();
        let early = entry(base, 0, None);
        let late = entry(base + chrono::Duration::seconds(10), 5, None);
        assert_eq!(due_order(&early, &late), CmpOrdering::Less);

        let low = entry(base, 1, None);
        let high = entry(base, 9, None);
        assert_eq!(due_order(&high, &low), CmpOrdering::Less);
    }

    #[test]
    fn test_query_filters_are_conjunctive() {
        let base = Utc::now();
        let candidate = entry(base, 0, Some("orders"));
        let matching = ScheduledMessageQuery {
            status: Some(ScheduleStatus::Pending),
            destination: Some("orders".to_string()),
            ..ScheduledMessageQuery::default()
        };
        assert!(matching.matches(&candidate));

        let wrong_destination = ScheduledMessageQuery {
            status: Some(ScheduleStatus::Pending),
            destination: Some("payments".to_string()),
            ..ScheduledMessageQuery::default()
        };
        assert!(!wrong_destination.matches(&candidate));
    }

    #[test]
    fn test_pagination_applies_after_filtering() {
        let base = Utc::now();
        let entries: Vec<_> = (0..5)
            .map(|i| entry(base + chrono::Duration::seconds(i), 0, None))
            .collect();
        let query = ScheduledMessageQuery {
            offset: Some(1),
            limit: Some(2),
            ..ScheduledMessageQuery::default()
        };
        let page = query.paginate(entries.clone());
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].schedule_id(), entries[1].schedule_id());

        let oversized_offset = ScheduledMessageQuery {
            offset: Some(10),
            ..ScheduledMessageQuery::default()
        };
        assert!(oversized_offset.paginate(entries).is_empty());
    }

    #[test]
    fn test_past_delivery_tolerance() {
        let now = Utc::now();
        assert!(validate_deliver_at(now - chrono::Duration::milliseconds(500), now).is_ok());
        assert!(validate_deliver_at(now - chrono::Duration::seconds(5), now).is_err());
        assert!(validate_deliver_at(now + chrono::Duration::seconds(5), now).is_ok());
    }
}
