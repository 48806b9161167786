//! Retry decorator
//!
//! Re-invokes the inner processor under a pluggable policy. Handled
//! failures (`Ok(Failure)`) are returned as failures once retries are
//! exhausted; thrown failures (`Err`) propagate unchanged so callers can
//! distinguish the two.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{MessagingError, MessagingResult};
use crate::message::Message;
use crate::pipeline::{MessageProcessor, ProcessingContext, ProcessingResult};
use crate::timebase::Timebase;

/// Decides whether and when a failed call is retried.
pub trait RetryPolicy: Send + Sync {
    /// Maximum retries after the initial attempt
    fn max_retries(&self) -> u32;

    /// Whether `error` on attempt `attempt` (zero-based) warrants a retry
    fn should_retry(&self, error: &MessagingError, attempt: u32) -> bool;

    /// Delay before the retry following attempt `attempt`
    fn retry_delay(&self, attempt: u32) -> Duration;
}

/// Configuration for [`ExponentialBackoffPolicy`]
#[derive(Debug, Clone)]
pub struct RetryPolicyConfig {
    /// Maximum retries after the initial attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any delay (before jitter)
    pub max_delay: Duration,
    /// Uniform jitter fraction applied as `[-jitter, +jitter]`
    pub jitter_factor: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicyConfig {
    /// Validate configuration
    pub fn validate(&self) -> MessagingResult<()> {
        if self.base_delay.is_zero() {
            return Err(MessagingError::invalid_input(
                "base_delay",
                "must be positive",
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(MessagingError::invalid_input(
                "max_delay",
                "must be at least base_delay",
            ));
        }
        if !(0.0..1.0).contains(&self.jitter_factor) {
            return Err(MessagingError::invalid_input(
                "jitter_factor",
                "must be in [0, 1)",
            ));
        }
        Ok(())
    }
}

/// Default policy: exponential backoff with uniform jitter.
///
/// Transient failures (timeouts, throttling, cancelled-style errors) are
/// retryable; fatal host errors are not.
pub struct ExponentialBackoffPolicy {
    config: RetryPolicyConfig,
}

impl ExponentialBackoffPolicy {
    /// Create a policy; fails fast on invalid configuration.
    pub fn new(config: RetryPolicyConfig) -> MessagingResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self {
            config: RetryPolicyConfig::default(),
        }
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    fn should_retry(&self, error: &MessagingError, _attempt: u32) -> bool {
        if error.is_fatal() {
            return false;
        }
        error.is_transient() || error.is_cancelled()
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .config
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.config.max_delay);
        let jitter = if self.config.jitter_factor > 0.0 {
            // Uniform in [-jitter_factor, +jitter_factor].
            (fastrand::f64() * 2.0 - 1.0) * self.config.jitter_factor
        } else {
            0.0
        };
        exponential.mul_f64(1.0 + jitter)
    }
}

/// Decorator that retries failed inner calls.
pub struct RetryDecorator {
    inner: Arc<dyn MessageProcessor>,
    policy: Arc<dyn RetryPolicy>,
    clock: Arc<dyn Timebase>,
}

impl RetryDecorator {
    /// Wrap `inner` under the given policy.
    pub fn new(
        inner: Arc<dyn MessageProcessor>,
        policy: Arc<dyn RetryPolicy>,
        clock: Arc<dyn Timebase>,
    ) -> Self {
        Self {
            inner,
            policy,
            clock,
        }
    }

    async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> MessagingResult<()> {
        let delay = self.policy.retry_delay(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
        tokio::select! {
            _ = self.clock.sleep(delay) => Ok(()),
            _ = cancel.cancelled() => Err(MessagingError::Cancelled),
        }
    }
}

#[async_trait]
impl MessageProcessor for RetryDecorator {
    async fn process(
        &self,
        message: Arc<dyn Message>,
        context: &ProcessingContext,
        cancel: &CancellationToken,
    ) -> MessagingResult<ProcessingResult> {
        let max_retries = self.policy.max_retries();
        let mut attempt = 0;
        loop {
            let attempt_context = context.with_retry_count(attempt);
            match self
                .inner
                .process(message.clone(), &attempt_context, cancel)
                .await
            {
                Ok(result @ ProcessingResult::Success { .. }) => return Ok(result),
                Ok(ProcessingResult::Failure { error, message: note }) => {
                    if attempt < max_retries && self.policy.should_retry(&error, attempt) {
                        self.backoff(attempt, cancel).await?;
                        attempt += 1;
                        continue;
                    }
                    if attempt >= max_retries {
                        warn!(
                            message_id = %message.message_id(),
                            attempts = attempt + 1,
                            "retries exhausted"
                        );
                    }
                    return Ok(ProcessingResult::Failure {
                        error,
                        message: note,
                    });
                }
                Err(error) => {
                    if attempt < max_retries && self.policy.should_retry(&error, attempt) {
                        self.backoff(attempt, cancel).await?;
                        attempt += 1;
                        continue;
                    }
                    // Exhausted or non-retryable thrown failures propagate.
                    return Err(error);
                }
            }
        }
    }
}
