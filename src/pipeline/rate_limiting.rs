//! Rate-limiting decorator
//!
//! Consults the token-bucket limiter before forwarding. The token is
//! consumed whether or not the inner call succeeds; an inner failure does
//! not refund it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{MessagingError, MessagingResult};
use crate::message::Message;
use crate::pipeline::{MessageProcessor, ProcessingContext, ProcessingResult};
use crate::rate_limit::TokenBucketRateLimiter;

/// Decorator that throttles calls through a [`TokenBucketRateLimiter`].
///
/// When the limiter has scoping enabled, the scope key is the message's
/// type name, giving each message type its own bucket.
pub struct RateLimitingDecorator {
    inner: Arc<dyn MessageProcessor>,
    limiter: Arc<TokenBucketRateLimiter>,
    permits_per_call: u32,
}

impl RateLimitingDecorator {
    /// Wrap `inner`, drawing one permit per call.
    pub fn new(inner: Arc<dyn MessageProcessor>, limiter: Arc<TokenBucketRateLimiter>) -> Self {
        Self {
            inner,
            limiter,
            permits_per_call: 1,
        }
    }

    /// Override the permits drawn per call.
    pub fn with_permits_per_call(mut self, permits: u32) -> Self {
        self.permits_per_call = permits;
        self
    }
}

#[async_trait]
impl MessageProcessor for RateLimitingDecorator {
    async fn process(
        &self,
        message: Arc<dyn Message>,
        context: &ProcessingContext,
        cancel: &CancellationToken,
    ) -> MessagingResult<ProcessingResult> {
        let key = if self.limiter.scoping_enabled() {
            Some(message.message_type())
        } else {
            None
        };

        let decision = self
            .limiter
            .acquire(self.permits_per_call, key, cancel)
            .await?;

        if !decision.allowed {
            let reason = decision
                .reason
                .unwrap_or_else(|| "Rate limit exceeded".to_string());
            debug!(
                message_id = %message.message_id(),
                message_type = message.message_type(),
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "message throttled"
            );
            return Ok(ProcessingResult::failure_with_message(
                MessagingError::Throttled {
                    reason: reason.clone(),
                    retry_after: decision.retry_after,
                },
                format!("rate limit refused {}: {}", message.message_type(), reason),
            ));
        }

        // Token stays consumed regardless of the inner outcome.
        self.inner.process(message, context, cancel).await
    }
}
