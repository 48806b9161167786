//! Facade: the single object the embedding application holds
//!
//! Routes commands, queries, events, and plain messages to their
//! processors, counts successful dispatches, and reports component
//! health. Optional queue/outbox/inbox processors fail with a
//! configuration hint when invoked while absent.

pub mod health;
pub mod metrics;

use std::any::Any;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{MessagingError, MessagingResult};
use crate::message::{Command, Event, Message, Query, Responding};
use crate::timebase::Timebase;

pub use health::{ComponentHealth, HealthReport};
pub use metrics::MetricsSnapshot;

use metrics::MessagingMetrics;

/// Dispatches commands; returns a response payload for response-bearing
/// commands, `None` for fire-and-forget ones.
#[async_trait]
pub trait CommandProcessor: Send + Sync {
    /// Dispatch one command.
    async fn dispatch(
        &self,
        command: Box<dyn Message>,
        cancel: &CancellationToken,
    ) -> MessagingResult<Option<Box<dyn Any + Send>>>;
}

/// Executes queries; always produces a response payload.
#[async_trait]
pub trait QueryProcessor: Send + Sync {
    /// Execute one query.
    async fn execute(
        &self,
        query: Box<dyn Message>,
        cancel: &CancellationToken,
    ) -> MessagingResult<Box<dyn Any + Send>>;
}

/// Fans events out to subscribers.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish one event.
    async fn publish(
        &self,
        event: Box<dyn Message>,
        cancel: &CancellationToken,
    ) -> MessagingResult<()>;
}

/// Optional queue-backed processing.
#[async_trait]
pub trait QueueProcessor: Send + Sync {
    /// Enqueue a message onto the named queue.
    async fn enqueue(
        &self,
        message: Box<dyn Message>,
        queue: &str,
        cancel: &CancellationToken,
    ) -> MessagingResult<()>;

    /// Start consuming.
    async fn start(&self, cancel: &CancellationToken) -> MessagingResult<()>;

    /// Stop consuming.
    async fn stop(&self, cancel: &CancellationToken) -> MessagingResult<()>;
}

/// Optional transactional outbox.
#[async_trait]
pub trait OutboxProcessor: Send + Sync {
    /// Stage a message in the outbox.
    async fn publish_to_outbox(
        &self,
        message: Box<dyn Message>,
        cancel: &CancellationToken,
    ) -> MessagingResult<()>;
}

/// Optional inbox deduplication/processing.
#[async_trait]
pub trait InboxProcessor: Send + Sync {
    /// Process one incoming message.
    async fn process_incoming(
        &self,
        message: Box<dyn Message>,
        cancel: &CancellationToken,
    ) -> MessagingResult<()>;
}

/// The messaging runtime's single entry point.
pub struct HeroMessaging {
    command_processor: Arc<dyn CommandProcessor>,
    query_processor: Arc<dyn QueryProcessor>,
    event_bus: Arc<dyn EventBus>,
    clock: Arc<dyn Timebase>,
    queue_processor: Option<Arc<dyn QueueProcessor>>,
    outbox_processor: Option<Arc<dyn OutboxProcessor>>,
    inbox_processor: Option<Arc<dyn InboxProcessor>>,
    metrics: MessagingMetrics,
}

impl HeroMessaging {
    /// Start configuring a facade.
    pub fn builder() -> HeroMessagingBuilder {
        HeroMessagingBuilder::default()
    }

    /// Send a fire-and-forget command.
    pub async fn send<C: Command>(
        &self,
        command: C,
        cancel: &CancellationToken,
    ) -> MessagingResult<()> {
        self.command_processor
            .dispatch(Box::new(command), cancel)
            .await?;
        self.metrics.commands_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Send a command and await its typed response.
    pub async fn send_returning<C>(
        &self,
        command: C,
        cancel: &CancellationToken,
    ) -> MessagingResult<C::Response>
    where
        C: Command + Responding,
    {
        let response = self
            .command_processor
            .dispatch(Box::new(command), cancel)
            .await?
            .ok_or_else(|| {
                MessagingError::internal("command processor returned no response payload")
            })?;
        let response = response.downcast::<C::Response>().map_err(|_| {
            MessagingError::internal("command response payload has an unexpected type")
        })?;
        self.metrics.commands_sent.fetch_add(1, Ordering::Relaxed);
        Ok(*response)
    }

    /// Execute a query and await its typed response.
    pub async fn query<Q: Query>(
        &self,
        query: Q,
        cancel: &CancellationToken,
    ) -> MessagingResult<Q::Response> {
        let response = self
            .query_processor
            .execute(Box::new(query), cancel)
            .await?;
        let response = response.downcast::<Q::Response>().map_err(|_| {
            MessagingError::internal("query response payload has an unexpected type")
        })?;
        self.metrics.queries_sent.fetch_add(1, Ordering::Relaxed);
        Ok(*response)
    }

    /// Publish an event to subscribers.
    pub async fn publish<E: Event>(
        &self,
        event: E,
        cancel: &CancellationToken,
    ) -> MessagingResult<()> {
        self.event_bus.publish(Box::new(event), cancel).await?;
        self.metrics.events_published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Send a batch of commands; one boolean per element, never
    /// short-circuiting. Empty input yields an empty result.
    pub async fn send_batch<C: Command>(
        &self,
        commands: Vec<C>,
        cancel: &CancellationToken,
    ) -> Vec<bool> {
        let mut outcomes = Vec::with_capacity(commands.len());
        for command in commands {
            match self.send(command, cancel).await {
                Ok(()) => outcomes.push(true),
                Err(error) => {
                    warn!(%error, "batched command failed");
                    outcomes.push(false);
                }
            }
        }
        outcomes
    }

    /// Send a batch of response-bearing commands; each slot carries its
    /// own typed outcome.
    pub async fn send_batch_returning<C>(
        &self,
        commands: Vec<C>,
        cancel: &CancellationToken,
    ) -> Vec<MessagingResult<C::Response>>
    where
        C: Command + Responding,
    {
        let mut outcomes = Vec::with_capacity(commands.len());
        for command in commands {
            outcomes.push(self.send_returning(command, cancel).await);
        }
        outcomes
    }

    /// Publish a batch of events; one boolean per element.
    pub async fn publish_batch<E: Event>(
        &self,
        events: Vec<E>,
        cancel: &CancellationToken,
    ) -> Vec<bool> {
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            match self.publish(event, cancel).await {
                Ok(()) => outcomes.push(true),
                Err(error) => {
                    warn!(%error, "batched event failed");
                    outcomes.push(false);
                }
            }
        }
        outcomes
    }

    /// Enqueue a message onto the named queue.
    pub async fn enqueue<M: Message>(
        &self,
        message: M,
        queue: &str,
        cancel: &CancellationToken,
    ) -> MessagingResult<()> {
        let processor = self.queue_processor()?;
        processor.enqueue(Box::new(message), queue, cancel).await?;
        self.metrics.messages_queued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Start queue consumption.
    pub async fn start_queue(&self, cancel: &CancellationToken) -> MessagingResult<()> {
        self.queue_processor()?.start(cancel).await
    }

    /// Stop queue consumption.
    pub async fn stop_queue(&self, cancel: &CancellationToken) -> MessagingResult<()> {
        self.queue_processor()?.stop(cancel).await
    }

    /// Stage a message in the transactional outbox.
    pub async fn publish_to_outbox<M: Message>(
        &self,
        message: M,
        cancel: &CancellationToken,
    ) -> MessagingResult<()> {
        let processor =
            self.outbox_processor
                .as_deref()
                .ok_or(MessagingError::FeatureNotEnabled {
                    feature: "Outbox",
                    hint: "Enable it with HeroMessagingBuilder::with_outbox()",
                })?;
        processor.publish_to_outbox(Box::new(message), cancel).await?;
        self.metrics.outbox_messages.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Process one incoming message through the inbox.
    pub async fn process_incoming<M: Message>(
        &self,
        message: M,
        cancel: &CancellationToken,
    ) -> MessagingResult<()> {
        let processor =
            self.inbox_processor
                .as_deref()
                .ok_or(MessagingError::FeatureNotEnabled {
                    feature: "Inbox",
                    hint: "Enable it with HeroMessagingBuilder::with_inbox()",
                })?;
        processor.process_incoming(Box::new(message), cancel).await?;
        self.metrics.inbox_messages.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Snapshot the dispatch counters.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Report per-component health.
    pub fn get_health(&self) -> HealthReport {
        let now = self.clock.now_utc();
        let mut components = std::collections::BTreeMap::new();
        components.insert(
            "commands".to_string(),
            ComponentHealth::operational(now),
        );
        components.insert("queries".to_string(), ComponentHealth::operational(now));
        components.insert("events".to_string(), ComponentHealth::operational(now));
        components.insert(
            "queue".to_string(),
            match &self.queue_processor {
                Some(_) => ComponentHealth::operational(now),
                None => ComponentHealth::not_configured(now),
            },
        );
        components.insert(
            "outbox".to_string(),
            match &self.outbox_processor {
                Some(_) => ComponentHealth::operational(now),
                None => ComponentHealth::not_configured(now),
            },
        );
        components.insert(
            "inbox".to_string(),
            match &self.inbox_processor {
                Some(_) => ComponentHealth::operational(now),
                None => ComponentHealth::not_configured(now),
            },
        );

        // Absent optional processors report unhealthy individually but do
        // not degrade overall health.
        let is_healthy = components
            .values()
            .filter(|component| component.status == "Operational")
            .all(|component| component.is_healthy);
        HealthReport {
            is_healthy,
            components,
        }
    }

    fn queue_processor(&self) -> MessagingResult<&dyn QueueProcessor> {
        self.queue_processor
            .as_deref()
            .ok_or(MessagingError::FeatureNotEnabled {
                feature: "Queue",
                hint: "Enable it with HeroMessagingBuilder::with_queues()",
            })
    }
}

/// Configures and validates a [`HeroMessaging`] facade.
///
/// Command processor, query processor, event bus, and clock are
/// required; queue, outbox, and inbox processors are optional.
#[derive(Default)]
pub struct HeroMessagingBuilder {
    command_processor: Option<Arc<dyn CommandProcessor>>,
    query_processor: Option<Arc<dyn QueryProcessor>>,
    event_bus: Option<Arc<dyn EventBus>>,
    clock: Option<Arc<dyn Timebase>>,
    queue_processor: Option<Arc<dyn QueueProcessor>>,
    outbox_processor: Option<Arc<dyn OutboxProcessor>>,
    inbox_processor: Option<Arc<dyn InboxProcessor>>,
}

impl HeroMessagingBuilder {
    /// Set the command processor (required).
    pub fn with_command_processor(mut self, processor: Arc<dyn CommandProcessor>) -> Self {
        self.command_processor = Some(processor);
        self
    }

    /// Set the query processor (required).
    pub fn with_query_processor(mut self, processor: Arc<dyn QueryProcessor>) -> Self {
        self.query_processor = Some(processor);
        self
    }

    /// Set the event bus (required).
    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Set the time abstraction (required).
    pub fn with_clock(mut self, clock: Arc<dyn Timebase>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Enable queue functionality.
    pub fn with_queues(mut self, processor: Arc<dyn QueueProcessor>) -> Self {
        self.queue_processor = Some(processor);
        self
    }

    /// Enable the transactional outbox.
    pub fn with_outbox(mut self, processor: Arc<dyn OutboxProcessor>) -> Self {
        self.outbox_processor = Some(processor);
        self
    }

    /// Enable inbox processing.
    pub fn with_inbox(mut self, processor: Arc<dyn InboxProcessor>) -> Self {
        self.inbox_processor = Some(processor);
        self
    }

    /// Validate required collaborators and build the facade.
    pub fn build(self) -> MessagingResult<HeroMessaging> {
        let command_processor = self.command_processor.ok_or_else(|| {
            MessagingError::invalid_input("command_processor", "a command processor is required")
        })?;
        let query_processor = self.query_processor.ok_or_else(|| {
            MessagingError::invalid_input("query_processor", "a query processor is required")
        })?;
        let event_bus = self.event_bus.ok_or_else(|| {
            MessagingError::invalid_input("event_bus", "an event bus is required")
        })?;
        let clock = self.clock.ok_or_else(|| {
            MessagingError::invalid_input("clock", "a time abstraction is required")
        })?;
        debug!(
            queues = self.queue_processor.is_some(),
            outbox = self.outbox_processor.is_some(),
            inbox = self.inbox_processor.is_some(),
            "facade configured"
        );
        Ok(HeroMessaging {
            command_processor,
            query_processor,
            event_bus,
            clock,
            queue_processor: self.queue_processor,
            outbox_processor: self.outbox_processor,
            inbox_processor: self.inbox_processor,
            metrics: MessagingMetrics::default(),
        })
    }
}
