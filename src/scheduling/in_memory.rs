//! In-memory scheduler
//!
//! Keeps entries in a concurrent map plus a deadline-ordered heap. A
//! dedicated dispatcher task sleeps on the injected clock until the
//! earliest deadline, claims the entry, and hands it to the delivery
//! handler; claiming makes dispatch and cancellation mutually exclusive.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{MessagingError, MessagingResult};
use crate::message::Message;
use crate::scheduling::{
    due_order, validate_deliver_at, MessageDeliveryHandler, MessageScheduler, ScheduleId,
    ScheduleOptions, ScheduleResult, ScheduleStatus, ScheduledMessage, ScheduledMessageEntry,
    ScheduledMessageQuery,
};
use crate::timebase::Timebase;

struct Slot {
    entry: ScheduledMessageEntry,
    // Set by the dispatcher just before delivery; a claimed entry can no
    // longer be cancelled even though its status is still Pending.
    claimed: bool,
}

struct HeapItem {
    deliver_at: DateTime<Utc>,
    priority: i32,
    seq: u64,
    schedule_id: ScheduleId,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    // Reversed: BinaryHeap is a max-heap, the next due item must pop first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deliver_at
            .cmp(&self.deliver_at)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Scheduler backed by process memory.
pub struct InMemoryScheduler {
    slots: Arc<DashMap<ScheduleId, Slot>>,
    heap: Arc<Mutex<BinaryHeap<HeapItem>>>,
    notify: Arc<Notify>,
    clock: Arc<dyn Timebase>,
    shutdown_token: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
    seq: std::sync::atomic::AtomicU64,
}

impl InMemoryScheduler {
    /// Create a scheduler and start its dispatcher.
    pub fn new(handler: Arc<dyn MessageDeliveryHandler>, clock: Arc<dyn Timebase>) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            slots: Arc::new(DashMap::new()),
            heap: Arc::new(Mutex::new(BinaryHeap::new())),
            notify: Arc::new(Notify::new()),
            clock,
            shutdown_token: CancellationToken::new(),
            dispatcher: Mutex::new(None),
            disposed: AtomicBool::new(false),
            seq: std::sync::atomic::AtomicU64::new(0),
        });
        let handle = tokio::spawn(scheduler.clone().run_dispatcher(handler));
        *scheduler.dispatcher.lock() = Some(handle);
        scheduler
    }

    /// Stop the dispatcher and wait for any in-flight delivery.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_token.cancel();
        let handle = { self.dispatcher.lock().take() };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run_dispatcher(self: Arc<Self>, handler: Arc<dyn MessageDeliveryHandler>) {
        loop {
            let next_due = { self.heap.lock().peek().map(|item| item.deliver_at) };
            match next_due {
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = self.shutdown_token.cancelled() => break,
                    }
                }
                Some(deliver_at) => {
                    let now = self.clock.now_utc();
                    if deliver_at > now {
                        tokio::select! {
                            _ = self.clock.sleep_until(deliver_at) => {}
                            _ = self.notify.notified() => {}
                            _ = self.shutdown_token.cancelled() => break,
                        }
                        continue;
                    }
                    let item = { self.heap.lock().pop() };
                    let Some(item) = item else { continue };
                    if self.claim(item.schedule_id) {
                        self.dispatch(item.schedule_id, handler.as_ref()).await;
                    }
                }
            }
        }
    }

    fn claim(&self, schedule_id: ScheduleId) -> bool {
        match self.slots.get_mut(&schedule_id) {
            Some(mut slot) if slot.entry.status == ScheduleStatus::Pending && !slot.claimed => {
                slot.claimed = true;
                true
            }
            _ => false,
        }
    }

    async fn dispatch(&self, schedule_id: ScheduleId, handler: &dyn MessageDeliveryHandler) {
        let message = match self.slots.get(&schedule_id) {
            Some(slot) => slot.entry.message.clone(),
            None => return,
        };
        debug!(%schedule_id, "dispatching due message");
        match handler.deliver(&message, &self.shutdown_token).await {
            Ok(()) => self.finish(schedule_id, ScheduleStatus::Delivered, None),
            Err(error) => {
                warn!(%schedule_id, %error, "delivery handler failed");
                handler
                    .handle_delivery_failure(schedule_id, &error, &self.shutdown_token)
                    .await;
                self.finish(schedule_id, ScheduleStatus::Failed, Some(error.to_string()));
            }
        }
    }

    fn finish(&self, schedule_id: ScheduleId, status: ScheduleStatus, error: Option<String>) {
        if let Some(mut slot) = self.slots.get_mut(&schedule_id) {
            let now = self.clock.now_utc();
            slot.entry.status = status;
            slot.entry.last_updated = now;
            if status == ScheduleStatus::Delivered {
                slot.entry.delivered_at = Some(now);
            }
            if let Some(error) = error {
                slot.entry.error_message = Some(error);
            }
        }
    }

    fn insert(
        &self,
        message: Arc<dyn Message>,
        deliver_at: DateTime<Utc>,
        options: Option<ScheduleOptions>,
    ) -> MessagingResult<ScheduleResult> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(MessagingError::Disposed {
                component: "InMemoryScheduler",
            });
        }
        let now = self.clock.now_utc();
        let options = options.unwrap_or_default();
        let scheduled = ScheduledMessage {
            schedule_id: ScheduleId::new(),
            message,
            deliver_at,
            scheduled_at: now,
            options,
        };
        let schedule_id = scheduled.schedule_id;
        let priority = scheduled.options.priority;
        self.slots.insert(
            schedule_id,
            Slot {
                entry: ScheduledMessageEntry::pending(scheduled, now),
                claimed: false,
            },
        );
        self.heap.lock().push(HeapItem {
            deliver_at,
            priority,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            schedule_id,
        });
        self.notify.notify_one();
        Ok(ScheduleResult {
            success: true,
            schedule_id,
            scheduled_for: deliver_at,
            error_message: None,
        })
    }
}

#[async_trait]
impl MessageScheduler for InMemoryScheduler {
    async fn schedule_in(
        &self,
        message: Arc<dyn Message>,
        delay: Duration,
        options: Option<ScheduleOptions>,
    ) -> MessagingResult<ScheduleResult> {
        let deliver_at = self.clock.now_utc()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.insert(message, deliver_at, options)
    }

    async fn schedule_at(
        &self,
        message: Arc<dyn Message>,
        deliver_at: DateTime<Utc>,
        options: Option<ScheduleOptions>,
    ) -> MessagingResult<ScheduleResult> {
        validate_deliver_at(deliver_at, self.clock.now_utc())?;
        self.insert(message, deliver_at, options)
    }

    async fn cancel(&self, schedule_id: ScheduleId) -> bool {
        match self.slots.get_mut(&schedule_id) {
            Some(mut slot) if slot.entry.status == ScheduleStatus::Pending && !slot.claimed => {
                slot.entry.status = ScheduleStatus::Cancelled;
                slot.entry.last_updated = self.clock.now_utc();
                true
            }
            _ => false,
        }
    }

    async fn get_scheduled(&self, schedule_id: ScheduleId) -> Option<ScheduledMessageEntry> {
        self.slots.get(&schedule_id).map(|slot| slot.entry.clone())
    }

    async fn get_pending(
        &self,
        query: Option<ScheduledMessageQuery>,
    ) -> Vec<ScheduledMessageEntry> {
        let query = query.unwrap_or(ScheduledMessageQuery {
            status: Some(ScheduleStatus::Pending),
            ..ScheduledMessageQuery::default()
        });
        let mut matches: Vec<_> = self
            .slots
            .iter()
            .filter(|slot| slot.entry.status == ScheduleStatus::Pending)
            .filter(|slot| query.matches(&slot.entry))
            .map(|slot| slot.entry.clone())
            .collect();
        matches.sort_by(due_order);
        query.paginate(matches)
    }

    async fn get_pending_count(&self) -> u64 {
        self.slots
            .iter()
            .filter(|slot| slot.entry.status == ScheduleStatus::Pending)
            .count() as u64
    }
}
