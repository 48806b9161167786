//! Message processing pipeline
//!
//! A pipeline is an inner [`MessageProcessor`] wrapped by composable
//! decorators, each adding one cross-cutting concern:
//! - validation ([`ValidationDecorator`])
//! - rate limiting ([`RateLimitingDecorator`])
//! - retry ([`RetryDecorator`])
//! - batching ([`BatchingDecorator`])
//!
//! Decorators compose outside-in; [`PipelineBuilder`] assembles the
//! standard ordering.

pub mod batch;
pub mod rate_limiting;
pub mod retry;
pub mod validation;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{MessagingError, MessagingResult};
use crate::message::{Message, Metadata};
use crate::rate_limit::TokenBucketRateLimiter;
use crate::timebase::Timebase;

pub use batch::{BatchOptions, BatchingDecorator};
pub use rate_limiting::RateLimitingDecorator;
pub use retry::{ExponentialBackoffPolicy, RetryDecorator, RetryPolicy, RetryPolicyConfig};
pub use validation::{
    JsonSizer, MessageSizeValidator, MessageSizer, MessageValidator, RequiredFieldsValidator,
    ValidationDecorator, ValidationReport,
};

/// Per-call processing context.
///
/// Constructed per call and only mutated by the pipeline itself; derived
/// copies are cheap clones.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    component: String,
    retry_count: u32,
    metadata: Metadata,
}

impl ProcessingContext {
    /// Create a context for the named component.
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            retry_count: 0,
            metadata: Metadata::new(),
        }
    }

    /// Component name
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Attempt counter, zero on the first attempt
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Metadata bag
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Derived context with one more metadata entry.
    pub fn with_metadata(
        &self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        let mut derived = self.clone();
        derived.metadata.insert(key.into(), value.into());
        derived
    }

    /// Derived context with the given attempt counter.
    pub fn with_retry_count(&self, retry_count: u32) -> Self {
        let mut derived = self.clone();
        derived.retry_count = retry_count;
        derived
    }
}

/// Outcome of processing one message. Immutable once constructed.
#[derive(Debug)]
pub enum ProcessingResult {
    /// The message was processed
    Success {
        /// Optional human-readable note
        message: Option<String>,
        /// Optional structured payload
        data: Option<serde_json::Value>,
    },
    /// The message was not processed
    Failure {
        /// The failure itself, inspectable by outer decorators
        error: MessagingError,
        /// Optional human-readable note
        message: Option<String>,
    },
}

impl ProcessingResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success {
            message: None,
            data: None,
        }
    }

    /// Success with a note
    pub fn success_with_message(message: impl Into<String>) -> Self {
        Self::Success {
            message: Some(message.into()),
            data: None,
        }
    }

    /// Success with a structured payload
    pub fn success_with_data(data: serde_json::Value) -> Self {
        Self::Success {
            message: None,
            data: Some(data),
        }
    }

    /// Plain failure
    pub fn failure(error: MessagingError) -> Self {
        Self::Failure {
            error,
            message: None,
        }
    }

    /// Failure with a note
    pub fn failure_with_message(error: MessagingError, message: impl Into<String>) -> Self {
        Self::Failure {
            error,
            message: Some(message.into()),
        }
    }

    /// Whether this is a success
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The failure, when present
    pub fn error(&self) -> Option<&MessagingError> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error, .. } => Some(error),
        }
    }
}

/// One stage of the processing pipeline.
///
/// `process` returning `Err` models a thrown collaborator failure;
/// `Ok(ProcessingResult::Failure)` models a handled one. The retry
/// decorator treats the two differently (see [`RetryDecorator`]).
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// Process a single message.
    async fn process(
        &self,
        message: Arc<dyn Message>,
        context: &ProcessingContext,
        cancel: &CancellationToken,
    ) -> MessagingResult<ProcessingResult>;

    /// Process a batch as a unit, yielding one result per message.
    ///
    /// The default forwards each message through [`process`]; a failure
    /// returned as `Err` aborts the batch as a unit (the batching
    /// decorator's fallback path handles that case).
    ///
    /// [`process`]: MessageProcessor::process
    async fn process_batch(
        &self,
        messages: &[Arc<dyn Message>],
        context: &ProcessingContext,
        cancel: &CancellationToken,
    ) -> MessagingResult<Vec<ProcessingResult>> {
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            results.push(self.process(message.clone(), context, cancel).await?);
        }
        Ok(results)
    }
}

/// Assembled pipeline: the outermost processor plus the handles that need
/// explicit disposal.
pub struct Pipeline {
    processor: Arc<dyn MessageProcessor>,
    batch: Option<Arc<BatchingDecorator>>,
}

impl Pipeline {
    /// Outermost processor
    pub fn processor(&self) -> Arc<dyn MessageProcessor> {
        self.processor.clone()
    }

    /// Flush in-flight batches and stop background work.
    pub async fn shutdown(&self) {
        if let Some(batch) = &self.batch {
            batch.shutdown().await;
        }
    }
}

/// Composes decorators outside-in around an inner processor in the
/// standard order: validation, rate limiting, retry, batching.
pub struct PipelineBuilder {
    inner: Arc<dyn MessageProcessor>,
    clock: Arc<dyn Timebase>,
    validators: Vec<Arc<dyn MessageValidator>>,
    limiter: Option<Arc<TokenBucketRateLimiter>>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    batch_options: Option<BatchOptions>,
}

impl PipelineBuilder {
    /// Start from the innermost processor.
    pub fn new(inner: Arc<dyn MessageProcessor>, clock: Arc<dyn Timebase>) -> Self {
        Self {
            inner,
            clock,
            validators: Vec::new(),
            limiter: None,
            retry_policy: None,
            batch_options: None,
        }
    }

    /// Add a validator (runs in declaration order).
    pub fn with_validator(mut self, validator: Arc<dyn MessageValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    /// Throttle calls through the given limiter.
    pub fn with_rate_limiter(mut self, limiter: Arc<TokenBucketRateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Retry failed calls under the given policy.
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Accumulate calls into batches.
    pub fn with_batching(mut self, options: BatchOptions) -> Self {
        self.batch_options = Some(options);
        self
    }

    /// Assemble the pipeline; fails fast on invalid options.
    pub fn build(self) -> MessagingResult<Pipeline> {
        let mut processor = self.inner;
        let mut batch = None;

        if let Some(options) = self.batch_options {
            let decorator = BatchingDecorator::new(processor, options, self.clock.clone())?;
            batch = Some(decorator.clone());
            processor = decorator;
        }
        if let Some(policy) = self.retry_policy {
            processor = Arc::new(RetryDecorator::new(processor, policy, self.clock.clone()));
        }
        if let Some(limiter) = self.limiter {
            processor = Arc::new(RateLimitingDecorator::new(processor, limiter));
        }
        if !self.validators.is_empty() {
            processor = Arc::new(ValidationDecorator::new(processor, self.validators));
        }

        Ok(Pipeline { processor, batch })
    }
}
