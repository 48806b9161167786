//! Batching decorator
//!
//! Accumulates concurrent calls into batches. Each caller gets a future
//! that resolves with its own message's result; a background flusher
//! drains the queue when the batch fills, when the oldest entry ages past
//! the batch timeout, or on shutdown.
//!
//! Accumulations below the minimum batch size are processed as individual
//! calls; a batch invocation that fails as a unit can fall back to
//! individual processing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{MessagingError, MessagingResult};
use crate::message::Message;
use crate::pipeline::{MessageProcessor, ProcessingContext, ProcessingResult};
use crate::timebase::Timebase;

/// Batching configuration
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// When false the decorator is a pass-through
    pub enabled: bool,
    /// Accumulations below this size flush as individual calls
    pub min_batch_size: usize,
    /// A batch flushes as soon as it reaches this size
    pub max_batch_size: usize,
    /// A batch flushes once the oldest entry is this old
    pub batch_timeout: Duration,
    /// Parallelism bound for individual-call flushing
    pub max_degree_of_parallelism: usize,
    /// Keep processing the rest of a batch after one message fails
    pub continue_on_failure: bool,
    /// Re-process messages individually when a batch call fails as a unit
    pub fallback_to_individual: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            min_batch_size: 1,
            max_batch_size: 10,
            batch_timeout: Duration::from_millis(100),
            max_degree_of_parallelism: 4,
            continue_on_failure: true,
            fallback_to_individual: true,
        }
    }
}

impl BatchOptions {
    /// Validate configuration
    pub fn validate(&self) -> MessagingResult<()> {
        if self.max_batch_size == 0 {
            return Err(MessagingError::invalid_input(
                "max_batch_size",
                "must be at least 1",
            ));
        }
        if self.min_batch_size == 0 || self.min_batch_size > self.max_batch_size {
            return Err(MessagingError::invalid_input(
                "min_batch_size",
                "must be between 1 and max_batch_size",
            ));
        }
        if self.batch_timeout.is_zero() {
            return Err(MessagingError::invalid_input(
                "batch_timeout",
                "must be positive",
            ));
        }
        if self.max_degree_of_parallelism == 0 {
            return Err(MessagingError::invalid_input(
                "max_degree_of_parallelism",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

struct PendingEntry {
    message: Arc<dyn Message>,
    context: ProcessingContext,
    cancel: CancellationToken,
    reply: oneshot::Sender<MessagingResult<ProcessingResult>>,
    enqueued_at: DateTime<Utc>,
}

/// Decorator that accumulates calls into batches.
pub struct BatchingDecorator {
    inner: Arc<dyn MessageProcessor>,
    options: BatchOptions,
    clock: Arc<dyn Timebase>,
    queue: Mutex<VecDeque<PendingEntry>>,
    notify: Notify,
    shutdown_token: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl BatchingDecorator {
    /// Wrap `inner`; fails fast on invalid options.
    ///
    /// Spawns the background flusher when batching is enabled.
    pub fn new(
        inner: Arc<dyn MessageProcessor>,
        options: BatchOptions,
        clock: Arc<dyn Timebase>,
    ) -> MessagingResult<Arc<Self>> {
        options.validate()?;
        let decorator = Arc::new(Self {
            inner,
            options,
            clock,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            shutdown_token: CancellationToken::new(),
            flusher: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });
        if decorator.options.enabled {
            let handle = tokio::spawn(decorator.clone().run_flusher());
            *decorator.flusher.lock() = Some(handle);
        }
        info!(
            min_batch_size = decorator.options.min_batch_size,
            max_batch_size = decorator.options.max_batch_size,
            batch_timeout_ms = decorator.options.batch_timeout.as_millis() as u64,
            "BatchingDecorator initialized"
        );
        Ok(decorator)
    }

    /// Flush in-flight batches and stop the flusher.
    ///
    /// Idempotent; pending callers resolve before this returns.
    pub async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_token.cancel();
        let handle = { self.flusher.lock().take() };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run_flusher(self: Arc<Self>) {
        loop {
            // Wait for the first entry of the next batch.
            let first_at = loop {
                let front = self.queue.lock().front().map(|entry| entry.enqueued_at);
                if let Some(at) = front {
                    break Some(at);
                }
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = self.shutdown_token.cancelled() => break None,
                }
            };
            let Some(first_at) = first_at else { break };

            // Fill until max size, the oldest entry ages out, or shutdown.
            let deadline = first_at
                + chrono::Duration::from_std(self.options.batch_timeout)
                    .unwrap_or_else(|_| chrono::Duration::zero());
            let mut shutting_down = false;
            loop {
                if self.queue.lock().len() >= self.options.max_batch_size {
                    break;
                }
                let now = self.clock.now_utc();
                if now >= deadline {
                    break;
                }
                let remaining = (deadline - now).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = self.clock.sleep(remaining) => {}
                    _ = self.notify.notified() => {}
                    _ = self.shutdown_token.cancelled() => {
                        shutting_down = true;
                        break;
                    }
                }
            }

            let batch = self.drain(self.options.max_batch_size);
            if !batch.is_empty() {
                self.flush(batch).await;
            }
            if shutting_down {
                break;
            }
        }

        // Drain everything left so no caller hangs on shutdown.
        loop {
            let batch = self.drain(self.options.max_batch_size);
            if batch.is_empty() {
                break;
            }
            self.flush(batch).await;
        }
    }

    fn drain(&self, limit: usize) -> Vec<PendingEntry> {
        let mut queue = self.queue.lock();
        let take = queue.len().min(limit);
        queue.drain(..take).collect()
    }

    async fn flush(&self, entries: Vec<PendingEntry>) {
        let mut live = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.cancel.is_cancelled() {
                let _ = entry.reply.send(Err(MessagingError::Cancelled));
            } else {
                live.push(entry);
            }
        }
        if live.is_empty() {
            return;
        }

        if live.len() >= self.options.min_batch_size {
            self.flush_as_batch(live).await;
        } else {
            debug!(
                size = live.len(),
                min = self.options.min_batch_size,
                "accumulation below minimum batch size, processing individually"
            );
            self.flush_individually(live).await;
        }
    }

    async fn flush_as_batch(&self, live: Vec<PendingEntry>) {
        let messages: Vec<Arc<dyn Message>> =
            live.iter().map(|entry| entry.message.clone()).collect();
        let context = ProcessingContext::new("BatchingDecorator")
            .with_metadata("batch_size", live.len() as u64);
        // Caller tokens only govern the callers' own futures; the batch
        // itself runs to completion once started.
        let batch_cancel = CancellationToken::new();

        match self
            .inner
            .process_batch(&messages, &context, &batch_cancel)
            .await
        {
            Ok(results) if results.len() == live.len() => {
                for (entry, result) in live.into_iter().zip(results) {
                    let _ = entry.reply.send(Ok(result));
                }
            }
            Ok(results) => {
                warn!(
                    expected = live.len(),
                    got = results.len(),
                    "batch produced a result-count mismatch"
                );
                for entry in live {
                    let _ = entry.reply.send(Err(MessagingError::internal(
                        "batch produced a result-count mismatch",
                    )));
                }
            }
            Err(error) if self.options.fallback_to_individual => {
                warn!(%error, "batch invocation failed, falling back to individual processing");
                self.flush_individually(live).await;
            }
            Err(error) => {
                let reason = error.to_string();
                for entry in live {
                    let _ = entry.reply.send(Err(MessagingError::internal(format!(
                        "batch processing failed: {reason}"
                    ))));
                }
            }
        }
    }

    async fn flush_individually(&self, live: Vec<PendingEntry>) {
        if self.options.continue_on_failure {
            let semaphore = Arc::new(Semaphore::new(self.options.max_degree_of_parallelism));
            let tasks = live.into_iter().map(|entry| {
                let inner = self.inner.clone();
                let semaphore = semaphore.clone();
                async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        let _ = entry.reply.send(Err(MessagingError::Cancelled));
                        return;
                    };
                    if entry.cancel.is_cancelled() {
                        let _ = entry.reply.send(Err(MessagingError::Cancelled));
                        return;
                    }
                    let result = inner
                        .process(entry.message.clone(), &entry.context, &entry.cancel)
                        .await;
                    let _ = entry.reply.send(result);
                }
            });
            futures::future::join_all(tasks).await;
        } else {
            let mut aborted = false;
            for entry in live {
                if aborted {
                    let _ = entry.reply.send(Ok(ProcessingResult::failure_with_message(
                        MessagingError::internal("batch aborted after an earlier failure"),
                        "skipped after an earlier failure in the batch",
                    )));
                    continue;
                }
                if entry.cancel.is_cancelled() {
                    let _ = entry.reply.send(Err(MessagingError::Cancelled));
                    continue;
                }
                let result = self
                    .inner
                    .process(entry.message.clone(), &entry.context, &entry.cancel)
                    .await;
                let failed = match &result {
                    Ok(outcome) => !outcome.is_success(),
                    Err(_) => true,
                };
                let _ = entry.reply.send(result);
                if failed {
                    aborted = true;
                }
            }
        }
    }
}

#[async_trait]
impl MessageProcessor for BatchingDecorator {
    async fn process(
        &self,
        message: Arc<dyn Message>,
        context: &ProcessingContext,
        cancel: &CancellationToken,
    ) -> MessagingResult<ProcessingResult> {
        if !self.options.enabled {
            return self.inner.process(message, context, cancel).await;
        }
        if self.disposed.load(Ordering::SeqCst) {
            return Err(MessagingError::Disposed {
                component: "BatchingDecorator",
            });
        }

        let (reply, response) = oneshot::channel();
        {
            let mut queue = self.queue.lock();
            queue.push_back(PendingEntry {
                message,
                context: context.clone(),
                cancel: cancel.clone(),
                reply,
                enqueued_at: self.clock.now_utc(),
            });
        }
        self.notify.notify_one();

        tokio::select! {
            outcome = response => match outcome {
                Ok(result) => result,
                Err(_) => Err(MessagingError::internal("batch flusher dropped the reply")),
            },
            _ = cancel.cancelled() => Err(MessagingError::Cancelled),
        }
    }
}
