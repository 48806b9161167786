//! In-process messaging runtime
//!
//! This crate mediates commands, queries, events, and raw messages
//! between application code and pluggable collaborators:
//! - Composable processing pipeline (validation, rate limiting, retry,
//!   batching) around an inner processor
//! - Delayed message delivery with in-memory and storage-backed
//!   schedulers
//! - Builder-driven saga orchestration with optimistic concurrency,
//!   LIFO compensation, and timeout sweeping
//! - Token-bucket rate limiting
//! - A facade with dispatch counters and component health
//!
//! Time never comes from the OS clock directly: every component takes a
//! [`Timebase`], so tests drive delays and deadlines deterministically.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod error;
pub mod facade;
pub mod message;
pub mod pipeline;
pub mod rate_limit;
pub mod saga;
pub mod scheduling;
pub mod timebase;

pub use error::{CompensationActionError, MessagingError, MessagingResult};
pub use facade::{
    CommandProcessor, ComponentHealth, EventBus, HealthReport, HeroMessaging,
    HeroMessagingBuilder, InboxProcessor, MetricsSnapshot, OutboxProcessor, QueryProcessor,
    QueueProcessor,
};
pub use message::{Command, Event, GenericMessage, Message, MessageId, Metadata, Query, Responding};
pub use pipeline::{
    BatchOptions, BatchingDecorator, ExponentialBackoffPolicy, JsonSizer, MessageProcessor,
    MessageSizeValidator, MessageSizer, MessageValidator, Pipeline, PipelineBuilder,
    ProcessingContext, ProcessingResult, RateLimitingDecorator, RequiredFieldsValidator,
    RetryDecorator, RetryPolicy, RetryPolicyConfig, ValidationDecorator, ValidationReport,
};
pub use rate_limit::{
    RateLimitDecision, RateLimiterConfig, RateLimiterStats, ThrottleBehavior,
    TokenBucketRateLimiter,
};
pub use saga::{
    CompensationContext, InMemorySagaRepository, Saga, SagaOrchestrator, SagaRepository,
    SagaTimeoutSweeper, Services, StateContext, StateMachineBuilder, StateMachineDefinition,
    SweeperConfig,
};
pub use scheduling::{
    InMemoryScheduledMessageStorage, InMemoryScheduler, MessageDeliveryHandler, MessageScheduler,
    ScheduleId, ScheduleOptions, ScheduleResult, ScheduleStatus, ScheduledMessage,
    ScheduledMessageEntry, ScheduledMessageQuery, ScheduledMessageStorage, StorageScheduler,
    StorageSchedulerConfig,
};
pub use timebase::{SimClock, SysClock, Timebase};
