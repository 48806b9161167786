//! Scheduled-message storage contract and in-memory implementation
//!
//! The storage owns every persisted entry and is the single authority on
//! status transitions: `Pending` moves to exactly one of `Delivered`,
//! `Cancelled`, or `Failed`, and all three are terminal.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::{MessagingError, MessagingResult};
use crate::scheduling::{
    due_order, ScheduleId, ScheduleStatus, ScheduledMessage, ScheduledMessageEntry,
    ScheduledMessageQuery,
};
use crate::timebase::Timebase;

/// Persistence seam for the storage-backed scheduler.
#[async_trait]
pub trait ScheduledMessageStorage: Send + Sync {
    /// Persist a new entry; duplicate schedule ids are an error.
    async fn add(&self, message: ScheduledMessage) -> MessagingResult<ScheduledMessageEntry>;

    /// Pending entries due at or before `up_to`, in dispatch order,
    /// at most `limit`.
    async fn get_due(
        &self,
        up_to: DateTime<Utc>,
        limit: usize,
    ) -> MessagingResult<Vec<ScheduledMessageEntry>>;

    /// Look up one entry.
    async fn get(&self, schedule_id: ScheduleId) -> MessagingResult<Option<ScheduledMessageEntry>>;

    /// `Pending -> Cancelled`; false if the entry was not pending.
    async fn cancel(&self, schedule_id: ScheduleId) -> MessagingResult<bool>;

    /// `Pending -> Delivered`; false if the entry was not pending.
    async fn mark_delivered(&self, schedule_id: ScheduleId) -> MessagingResult<bool>;

    /// `Pending -> Failed`; false if the entry was not pending.
    async fn mark_failed(&self, schedule_id: ScheduleId, error: &str) -> MessagingResult<bool>;

    /// Number of pending entries.
    async fn pending_count(&self) -> MessagingResult<u64>;

    /// Entries matching `query`, filtered then paginated, stable order.
    async fn query(
        &self,
        query: &ScheduledMessageQuery,
    ) -> MessagingResult<Vec<ScheduledMessageEntry>>;

    /// Remove `Delivered`/`Cancelled` entries last updated before
    /// `older_than`; `Failed` entries are retained for diagnosis.
    async fn cleanup(&self, older_than: DateTime<Utc>) -> MessagingResult<usize>;
}

/// Thread-safe in-memory storage.
///
/// Status transitions happen under per-entry map locks, so concurrent
/// cancel/mark calls on one entry serialize and exactly one wins.
pub struct InMemoryScheduledMessageStorage {
    entries: DashMap<ScheduleId, ScheduledMessageEntry>,
    clock: Arc<dyn Timebase>,
}

impl InMemoryScheduledMessageStorage {
    /// Create an empty store.
    pub fn new(clock: Arc<dyn Timebase>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    fn transition(
        &self,
        schedule_id: ScheduleId,
        to: ScheduleStatus,
        error: Option<&str>,
    ) -> bool {
        let now = self.clock.now_utc();
        match self.entries.get_mut(&schedule_id) {
            Some(mut entry) if entry.status == ScheduleStatus::Pending => {
                entry.status = to;
                entry.last_updated = now;
                if to == ScheduleStatus::Delivered {
                    entry.delivered_at = Some(now);
                }
                if let Some(error) = error {
                    entry.error_message = Some(error.to_string());
                }
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ScheduledMessageStorage for InMemoryScheduledMessageStorage {
    async fn add(&self, message: ScheduledMessage) -> MessagingResult<ScheduledMessageEntry> {
        let schedule_id = message.schedule_id;
        let entry = ScheduledMessageEntry::pending(message, self.clock.now_utc());
        match self.entries.entry(schedule_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(MessagingError::Duplicate {
                kind: "schedule",
                id: schedule_id.to_string(),
                hint: "",
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                Ok(entry)
            }
        }
    }

    async fn get_due(
        &self,
        up_to: DateTime<Utc>,
        limit: usize,
    ) -> MessagingResult<Vec<ScheduledMessageEntry>> {
        let mut due: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| {
                entry.status == ScheduleStatus::Pending && entry.message.deliver_at <= up_to
            })
            .map(|entry| entry.value().clone())
            .collect();
        due.sort_by(due_order);
        due.truncate(limit);
        Ok(due)
    }

    async fn get(&self, schedule_id: ScheduleId) -> MessagingResult<Option<ScheduledMessageEntry>> {
        Ok(self.entries.get(&schedule_id).map(|entry| entry.value().clone()))
    }

    async fn cancel(&self, schedule_id: ScheduleId) -> MessagingResult<bool> {
        Ok(self.transition(schedule_id, ScheduleStatus::Cancelled, None))
    }

    async fn mark_delivered(&self, schedule_id: ScheduleId) -> MessagingResult<bool> {
        Ok(self.transition(schedule_id, ScheduleStatus::Delivered, None))
    }

    async fn mark_failed(&self, schedule_id: ScheduleId, error: &str) -> MessagingResult<bool> {
        Ok(self.transition(schedule_id, ScheduleStatus::Failed, Some(error)))
    }

    async fn pending_count(&self) -> MessagingResult<u64> {
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.status == ScheduleStatus::Pending)
            .count() as u64)
    }

    async fn query(
        &self,
        query: &ScheduledMessageQuery,
    ) -> MessagingResult<Vec<ScheduledMessageEntry>> {
        let mut matches: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| query.matches(entry))
            .map(|entry| entry.value().clone())
            .collect();
        matches.sort_by(due_order);
        Ok(query.paginate(matches))
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> MessagingResult<usize> {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            let reapable = matches!(
                entry.status,
                ScheduleStatus::Delivered | ScheduleStatus::Cancelled
            );
            !(reapable && entry.last_updated < older_than)
        });
        Ok(before - self.entries.len())
    }
}
