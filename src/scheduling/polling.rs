//! Storage-backed scheduler
//!
//! Delegates persistence to a [`ScheduledMessageStorage`] and dispatches
//! with a polling loop: every interval it asks the storage for due
//! entries and hands each to the delivery handler under a concurrency
//! bound. Storage failures on the schedule path surface in the result;
//! failures on query/cancel paths collapse to neutral values.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{MessagingError, MessagingResult};
use crate::message::Message;
use crate::scheduling::{
    validate_deliver_at, MessageDeliveryHandler, MessageScheduler, ScheduleId, ScheduleOptions,
    ScheduleResult, ScheduleStatus, ScheduledMessage, ScheduledMessageEntry,
    ScheduledMessageQuery, ScheduledMessageStorage,
};
use crate::timebase::Timebase;

/// Polling dispatcher configuration
#[derive(Debug, Clone)]
pub struct StorageSchedulerConfig {
    /// Interval between storage polls
    pub polling_interval: Duration,
    /// Maximum due entries fetched per poll
    pub batch_size: usize,
    /// Maximum concurrent deliveries
    pub max_concurrency: usize,
    /// Periodically reap old delivered/cancelled entries
    pub auto_cleanup: bool,
    /// Interval between cleanup sweeps
    pub cleanup_interval: Duration,
    /// Age past which terminal entries are reaped
    pub retain_for: Duration,
}

impl Default for StorageSchedulerConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(1),
            batch_size: 100,
            max_concurrency: 4,
            auto_cleanup: false,
            cleanup_interval: Duration::from_secs(300),
            retain_for: Duration::from_secs(24 * 3600),
        }
    }
}

impl StorageSchedulerConfig {
    /// Validate configuration
    pub fn validate(&self) -> MessagingResult<()> {
        if self.polling_interval.is_zero() {
            return Err(MessagingError::invalid_input(
                "polling_interval",
                "must be positive",
            ));
        }
        if self.batch_size == 0 {
            return Err(MessagingError::invalid_input(
                "batch_size",
                "must be at least 1",
            ));
        }
        if self.max_concurrency == 0 {
            return Err(MessagingError::invalid_input(
                "max_concurrency",
                "must be at least 1",
            ));
        }
        if self.auto_cleanup && self.cleanup_interval.is_zero() {
            return Err(MessagingError::invalid_input(
                "cleanup_interval",
                "must be positive when auto_cleanup is enabled",
            ));
        }
        Ok(())
    }
}

/// Scheduler that persists entries through a storage collaborator.
pub struct StorageScheduler {
    storage: Arc<dyn ScheduledMessageStorage>,
    clock: Arc<dyn Timebase>,
    config: StorageSchedulerConfig,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<DashSet<ScheduleId>>,
    shutdown_token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl StorageScheduler {
    /// Create a scheduler and start its polling dispatcher (plus the
    /// cleanup sweep when `auto_cleanup` is set). Fails fast on invalid
    /// configuration.
    pub fn new(
        storage: Arc<dyn ScheduledMessageStorage>,
        handler: Arc<dyn MessageDeliveryHandler>,
        clock: Arc<dyn Timebase>,
        config: StorageSchedulerConfig,
    ) -> MessagingResult<Arc<Self>> {
        config.validate()?;
        let scheduler = Arc::new(Self {
            storage,
            clock,
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            in_flight: Arc::new(DashSet::new()),
            shutdown_token: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
            config,
        });
        let mut workers = Vec::new();
        workers.push(tokio::spawn(scheduler.clone().run_poll_loop(handler)));
        if scheduler.config.auto_cleanup {
            workers.push(tokio::spawn(scheduler.clone().run_cleanup_loop()));
        }
        *scheduler.workers.lock() = workers;
        Ok(scheduler)
    }

    /// Stop the dispatcher, then wait for in-flight deliveries.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_token.cancel();
        let workers = { std::mem::take(&mut *self.workers.lock()) };
        for worker in workers {
            let _ = worker.await;
        }
        // Draining every permit waits out deliveries still in flight.
        let _ = self
            .semaphore
            .acquire_many(self.config.max_concurrency as u32)
            .await;
    }

    async fn run_poll_loop(self: Arc<Self>, handler: Arc<dyn MessageDeliveryHandler>) {
        loop {
            self.poll_once(&handler).await;
            tokio::select! {
                _ = self.clock.sleep(self.config.polling_interval) => {}
                _ = self.shutdown_token.cancelled() => break,
            }
        }
    }

    async fn poll_once(&self, handler: &Arc<dyn MessageDeliveryHandler>) {
        let now = self.clock.now_utc();
        let due = match self.storage.get_due(now, self.config.batch_size).await {
            Ok(due) => due,
            Err(error) => {
                warn!(%error, "failed to fetch due messages");
                return;
            }
        };
        for entry in due {
            let schedule_id = entry.schedule_id();
            // An entry still being delivered from a previous poll is not
            // handed out again.
            if !self.in_flight.insert(schedule_id) {
                continue;
            }
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let storage = self.storage.clone();
            let handler = handler.clone();
            let in_flight = self.in_flight.clone();
            let cancel = self.shutdown_token.clone();
            tokio::spawn(async move {
                let _permit = permit;
                Self::deliver_entry(storage, handler, entry, &cancel).await;
                in_flight.remove(&schedule_id);
            });
        }
    }

    async fn deliver_entry(
        storage: Arc<dyn ScheduledMessageStorage>,
        handler: Arc<dyn MessageDeliveryHandler>,
        entry: ScheduledMessageEntry,
        cancel: &CancellationToken,
    ) {
        let schedule_id = entry.schedule_id();
        debug!(%schedule_id, "dispatching due message");
        match handler.deliver(&entry.message, cancel).await {
            Ok(()) => {
                if let Err(error) = storage.mark_delivered(schedule_id).await {
                    warn!(%schedule_id, %error, "failed to mark entry delivered");
                }
            }
            Err(error) => {
                warn!(%schedule_id, %error, "delivery handler failed");
                handler
                    .handle_delivery_failure(schedule_id, &error, cancel)
                    .await;
                if let Err(mark_error) = storage
                    .mark_failed(schedule_id, &error.to_string())
                    .await
                {
                    warn!(%schedule_id, %mark_error, "failed to mark entry failed");
                }
            }
        }
    }

    async fn run_cleanup_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.clock.sleep(self.config.cleanup_interval) => {}
                _ = self.shutdown_token.cancelled() => break,
            }
            let older_than = self.clock.now_utc()
                - chrono::Duration::from_std(self.config.retain_for)
                    .unwrap_or_else(|_| chrono::Duration::zero());
            match self.storage.cleanup(older_than).await {
                Ok(removed) if removed > 0 => {
                    debug!(removed, "cleaned up terminal scheduled messages");
                }
                Ok(_) => {}
                Err(error) => warn!(%error, "cleanup sweep failed"),
            }
        }
    }

    fn build_schedule(
        &self,
        message: Arc<dyn Message>,
        deliver_at: DateTime<Utc>,
        options: Option<ScheduleOptions>,
    ) -> ScheduledMessage {
        ScheduledMessage {
            schedule_id: ScheduleId::new(),
            message,
            deliver_at,
            scheduled_at: self.clock.now_utc(),
            options: options.unwrap_or_default(),
        }
    }

    async fn store(&self, scheduled: ScheduledMessage) -> MessagingResult<ScheduleResult> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(MessagingError::Disposed {
                component: "StorageScheduler",
            });
        }
        let schedule_id = scheduled.schedule_id;
        let deliver_at = scheduled.deliver_at;
        match self.storage.add(scheduled).await {
            Ok(_) => Ok(ScheduleResult {
                success: true,
                schedule_id,
                scheduled_for: deliver_at,
                error_message: None,
            }),
            // Storage failures on the schedule path are surfaced in the
            // result, not thrown.
            Err(error) => Ok(ScheduleResult {
                success: false,
                schedule_id,
                scheduled_for: deliver_at,
                error_message: Some(error.to_string()),
            }),
        }
    }
}

#[async_trait]
impl MessageScheduler for StorageScheduler {
    async fn schedule_in(
        &self,
        message: Arc<dyn Message>,
        delay: Duration,
        options: Option<ScheduleOptions>,
    ) -> MessagingResult<ScheduleResult> {
        let deliver_at = self.clock.now_utc()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let scheduled = self.build_schedule(message, deliver_at, options);
        self.store(scheduled).await
    }

    async fn schedule_at(
        &self,
        message: Arc<dyn Message>,
        deliver_at: DateTime<Utc>,
        options: Option<ScheduleOptions>,
    ) -> MessagingResult<ScheduleResult> {
        validate_deliver_at(deliver_at, self.clock.now_utc())?;
        let scheduled = self.build_schedule(message, deliver_at, options);
        self.store(scheduled).await
    }

    async fn cancel(&self, schedule_id: ScheduleId) -> bool {
        self.storage.cancel(schedule_id).await.unwrap_or(false)
    }

    async fn get_scheduled(&self, schedule_id: ScheduleId) -> Option<ScheduledMessageEntry> {
        self.storage.get(schedule_id).await.ok().flatten()
    }

    async fn get_pending(
        &self,
        query: Option<ScheduledMessageQuery>,
    ) -> Vec<ScheduledMessageEntry> {
        let query = query.unwrap_or(ScheduledMessageQuery {
            status: Some(ScheduleStatus::Pending),
            ..ScheduledMessageQuery::default()
        });
        self.storage.query(&query).await.unwrap_or_default()
    }

    async fn get_pending_count(&self) -> u64 {
        self.storage.pending_count().await.unwrap_or(0)
    }
}
