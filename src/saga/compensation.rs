//! Compensation: named undo steps executed in LIFO order
//!
//! Actions registered during forward progress are drained on rollback.
//! The stack is empty after every `compensate` call, whether it
//! succeeded, failed, or was cancelled; failures are always delivered as
//! one aggregate wrapping an entry per failed action.

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CompensationActionError, MessagingError, MessagingResult};

/// Boxed compensation body, invoked with the rollback's cancellation token.
pub type CompensationRun =
    Box<dyn Fn(CancellationToken) -> BoxFuture<'static, MessagingResult<()>> + Send + Sync>;

struct CompensationAction {
    name: String,
    run: CompensationRun,
}

/// LIFO stack of named compensation actions.
#[derive(Default)]
pub struct CompensationContext {
    actions: Vec<CompensationAction>,
}

impl CompensationContext {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a synchronous action.
    pub fn add_compensation<F>(&mut self, name: impl Into<String>, action: F)
    where
        F: Fn() -> MessagingResult<()> + Send + Sync + 'static,
    {
        self.push(name, Box::new(move |_cancel| {
            let outcome = action();
            Box::pin(async move { outcome })
        }));
    }

    /// Push an async action.
    pub fn add_compensation_async<F>(&mut self, name: impl Into<String>, action: F)
    where
        F: Fn() -> BoxFuture<'static, MessagingResult<()>> + Send + Sync + 'static,
    {
        self.push(name, Box::new(move |_cancel| action()));
    }

    /// Push an async action that observes the rollback's cancellation.
    pub fn add_compensation_with_cancellation<F>(&mut self, name: impl Into<String>, action: F)
    where
        F: Fn(CancellationToken) -> BoxFuture<'static, MessagingResult<()>> + Send + Sync + 'static,
    {
        self.push(name, Box::new(action));
    }

    fn push(&mut self, name: impl Into<String>, run: CompensationRun) {
        let name = name.into();
        debug!(action = %name, "registered compensation action");
        self.actions.push(CompensationAction { name, run });
    }

    /// Whether any actions remain.
    pub fn has_actions(&self) -> bool {
        !self.actions.is_empty()
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether the stack is empty.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Pop and run every action in LIFO order.
    ///
    /// With `stop_on_first_error` the first failure aborts further pops;
    /// otherwise every action runs and all failures are collected. Either
    /// way the stack is empty when this returns, and failures surface as
    /// one [`MessagingError::CompensationFailed`] aggregate.
    pub async fn compensate(
        &mut self,
        stop_on_first_error: bool,
        cancel: &CancellationToken,
    ) -> MessagingResult<()> {
        let mut failures = Vec::new();

        while let Some(action) = self.actions.pop() {
            if cancel.is_cancelled() {
                self.actions.clear();
                return Err(MessagingError::Cancelled);
            }
            match (action.run)(cancel.clone()).await {
                Ok(()) => debug!(action = %action.name, "compensation action succeeded"),
                Err(error) => {
                    warn!(action = %action.name, %error, "compensation action failed");
                    failures.push(CompensationActionError {
                        action_name: action.name,
                        source: Box::new(error),
                    });
                    if stop_on_first_error {
                        self.actions.clear();
                        break;
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(MessagingError::CompensationFailed { failures })
        }
    }
}
