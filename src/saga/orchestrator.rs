//! Saga executor
//!
//! Routes an event to its saga instance: extract the correlation id,
//! load or create the instance, match a transition from the current
//! state, run its action, then persist through the repository. Action
//! failures propagate to the caller and nothing is persisted for them.

use std::any::{Any, TypeId};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{MessagingError, MessagingResult};
use crate::message::Message;
use crate::saga::compensation::CompensationContext;
use crate::saga::context::{Services, StateContext};
use crate::saga::definition::StateMachineDefinition;
use crate::saga::repository::SagaRepository;
use crate::saga::{Saga, INITIAL_STATE};
use crate::timebase::Timebase;

/// Executes a state machine definition against repository-backed sagas.
pub struct SagaOrchestrator<TSaga: Saga> {
    definition: Arc<StateMachineDefinition<TSaga>>,
    repository: Arc<dyn SagaRepository<TSaga>>,
    services: Arc<Services>,
    clock: Arc<dyn Timebase>,
}

impl<TSaga: Saga + Default> SagaOrchestrator<TSaga> {
    /// Create an orchestrator with an empty service bag.
    pub fn new(
        definition: Arc<StateMachineDefinition<TSaga>>,
        repository: Arc<dyn SagaRepository<TSaga>>,
        clock: Arc<dyn Timebase>,
    ) -> Self {
        Self {
            definition,
            repository,
            services: Arc::new(Services::new()),
            clock,
        }
    }

    /// Replace the service bag available to actions.
    pub fn with_services(mut self, services: Arc<Services>) -> Self {
        self.services = services;
        self
    }

    /// Dispatch one event.
    ///
    /// Events without a 128-bit correlation id are dropped (logged at
    /// warning, repository untouched). Events that match no transition
    /// from the saga's current state exit without mutation.
    pub async fn process<E: Message>(
        &self,
        event: &E,
        cancel: &CancellationToken,
    ) -> MessagingResult<()> {
        if cancel.is_cancelled() {
            return Err(MessagingError::Cancelled);
        }

        let Some(correlation_id) = event.correlation_uuid() else {
            warn!(
                event_type = event.message_type(),
                message_id = %event.message_id(),
                "dropping saga event without a correlation id"
            );
            return Ok(());
        };

        let existing = self.repository.find(correlation_id).await?;
        let is_new = existing.is_none();
        let mut saga = match existing {
            Some(saga) => saga,
            None => {
                let now = self.clock.now_utc();
                let mut saga = TSaga::default();
                saga.set_correlation_id(correlation_id);
                saga.set_current_state(INITIAL_STATE.to_string());
                saga.set_version(0);
                saga.set_created_at(now);
                saga.set_updated_at(now);
                saga
            }
        };

        if saga.is_completed() {
            debug!(%correlation_id, "ignoring event for completed saga");
            return Ok(());
        }

        let current_state = saga.current_state().to_string();
        let event_any: &(dyn Any + Send + Sync) = event;
        let transition = self
            .definition
            .transitions_from(&current_state)
            .iter()
            .find(|transition| {
                transition.matches(TypeId::of::<E>())
                    && transition
                        .guard
                        .as_ref()
                        .map(|guard| guard(&saga, event_any))
                        .unwrap_or(true)
            });
        let Some(transition) = transition else {
            debug!(
                %correlation_id,
                state = %current_state,
                event_type = event.message_type(),
                "no transition matches event, exiting without mutation"
            );
            return Ok(());
        };

        if let Some(action) = &transition.action {
            let mut compensation = CompensationContext::new();
            let mut ctx = StateContext::new(
                &mut saga,
                event_any,
                self.services.as_ref(),
                &mut compensation,
            );
            // Action failures propagate; the saga is not persisted.
            action.run(&mut ctx).await?;
        }

        if let Some(target) = &transition.target_state {
            saga.set_current_state(target.name().to_string());
        }
        if transition.finalize || self.definition.is_final_state(saga.current_state()) {
            saga.set_completed(true);
        }

        if is_new {
            self.repository.save(&mut saga).await?;
        } else {
            self.repository.update(&mut saga).await?;
        }
        debug!(
            %correlation_id,
            state = saga.current_state(),
            version = saga.version(),
            completed = saga.is_completed(),
            "saga transition applied"
        );
        Ok(())
    }
}
