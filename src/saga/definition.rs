//! State machine definition: transitions, actions, and final states
//!
//! Built by [`StateMachineBuilder`](crate::saga::StateMachineBuilder);
//! consumed by the orchestrator. Transition matching is a direct lookup
//! keyed by `(from-state name, event type id)`, in declaration order.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::MessagingResult;
use crate::message::Message;
use crate::saga::compensation::CompensationContext;
use crate::saga::context::StateContext;
use crate::saga::state::State;
use crate::saga::Saga;

/// Guard predicate evaluated against the saga and the untyped event.
pub type TransitionGuard<TSaga> =
    Arc<dyn Fn(&TSaga, &(dyn Any + Send + Sync)) -> bool + Send + Sync>;

/// One executable step attached to a transition.
#[async_trait]
pub trait SagaAction<TSaga: Saga>: Send + Sync {
    /// Run against the current dispatch context.
    async fn run(&self, ctx: &mut StateContext<'_, TSaga>) -> MessagingResult<()>;
}

/// Adapter for plain `(saga, event, compensation)` closures.
pub(crate) struct FnAction<TSaga, E, F> {
    action: F,
    _marker: PhantomData<fn(&mut TSaga, &E)>,
}

impl<TSaga, E, F> FnAction<TSaga, E, F> {
    pub(crate) fn new(action: F) -> Self {
        Self {
            action,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<TSaga, E, F> SagaAction<TSaga> for FnAction<TSaga, E, F>
where
    TSaga: Saga,
    E: Message,
    F: Fn(&mut TSaga, &E, &mut CompensationContext) -> MessagingResult<()> + Send + Sync,
{
    async fn run(&self, ctx: &mut StateContext<'_, TSaga>) -> MessagingResult<()> {
        let event = ctx.event_as::<E>()?;
        (self.action)(&mut *ctx.instance, event, &mut *ctx.compensation)
    }
}

/// Adapter for async closures over the full context.
pub(crate) struct AsyncFnAction<TSaga, F> {
    action: F,
    _marker: PhantomData<fn(&mut TSaga)>,
}

impl<TSaga, F> AsyncFnAction<TSaga, F> {
    pub(crate) fn new(action: F) -> Self {
        Self {
            action,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<TSaga, F> SagaAction<TSaga> for AsyncFnAction<TSaga, F>
where
    TSaga: Saga,
    F: for<'a, 'b> Fn(&'a mut StateContext<'b, TSaga>) -> BoxFuture<'a, MessagingResult<()>>
        + Send
        + Sync,
{
    async fn run(&self, ctx: &mut StateContext<'_, TSaga>) -> MessagingResult<()> {
        (self.action)(ctx).await
    }
}

/// Action that registers a named compensation when the transition runs.
pub(crate) struct CompensateAction {
    pub(crate) name: String,
    pub(crate) run:
        Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, MessagingResult<()>> + Send + Sync>,
}

#[async_trait]
impl<TSaga: Saga> SagaAction<TSaga> for CompensateAction {
    async fn run(&self, ctx: &mut StateContext<'_, TSaga>) -> MessagingResult<()> {
        let run = self.run.clone();
        ctx.compensation
            .add_compensation_with_cancellation(self.name.clone(), move |token| run(token));
        Ok(())
    }
}

/// Sequential composition of actions.
pub(crate) struct CompositeAction<TSaga> {
    pub(crate) actions: Vec<Arc<dyn SagaAction<TSaga>>>,
}

#[async_trait]
impl<TSaga: Saga> SagaAction<TSaga> for CompositeAction<TSaga> {
    async fn run(&self, ctx: &mut StateContext<'_, TSaga>) -> MessagingResult<()> {
        for action in &self.actions {
            action.run(ctx).await?;
        }
        Ok(())
    }
}

/// Conditional branch: exactly one arm executes.
pub(crate) struct BranchAction<TSaga> {
    pub(crate) predicate: TransitionGuard<TSaga>,
    pub(crate) then_actions: Vec<Arc<dyn SagaAction<TSaga>>>,
    pub(crate) then_target: Option<State>,
    pub(crate) else_actions: Vec<Arc<dyn SagaAction<TSaga>>>,
    pub(crate) else_target: Option<State>,
}

#[async_trait]
impl<TSaga: Saga> SagaAction<TSaga> for BranchAction<TSaga> {
    async fn run(&self, ctx: &mut StateContext<'_, TSaga>) -> MessagingResult<()> {
        let take_then = (self.predicate)(&*ctx.instance, ctx.event_any());
        let (actions, target) = if take_then {
            (&self.then_actions, &self.then_target)
        } else {
            (&self.else_actions, &self.else_target)
        };
        for action in actions {
            action.run(ctx).await?;
        }
        if let Some(target) = target {
            ctx.instance.set_current_state(target.name().to_string());
        }
        Ok(())
    }
}

/// One `(state, event) -> action + next-state` edge.
pub struct Transition<TSaga> {
    pub(crate) from_state: State,
    pub(crate) event_name: String,
    pub(crate) event_type: TypeId,
    pub(crate) guard: Option<TransitionGuard<TSaga>>,
    pub(crate) action: Option<Arc<dyn SagaAction<TSaga>>>,
    pub(crate) target_state: Option<State>,
    pub(crate) finalize: bool,
}

impl<TSaga> std::fmt::Debug for Transition<TSaga> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition")
            .field("from_state", &self.from_state)
            .field("event_name", &self.event_name)
            .field("target_state", &self.target_state)
            .field("finalize", &self.finalize)
            .finish()
    }
}

impl<TSaga> Transition<TSaga> {
    /// State this transition leaves
    pub fn from_state(&self) -> &State {
        &self.from_state
    }

    /// Display name of the matched event
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// State assigned when the transition completes, when present
    pub fn target_state(&self) -> Option<&State> {
        self.target_state.as_ref()
    }

    /// Whether executing this transition finalizes the saga
    pub fn is_finalizing(&self) -> bool {
        self.finalize
    }

    pub(crate) fn matches(&self, event_type: TypeId) -> bool {
        self.event_type == event_type
    }
}

/// Complete state machine for one saga type.
pub struct StateMachineDefinition<TSaga> {
    pub(crate) initial_state: State,
    pub(crate) transitions: HashMap<String, Vec<Transition<TSaga>>>,
    pub(crate) final_states: HashSet<State>,
}

impl<TSaga> std::fmt::Debug for StateMachineDefinition<TSaga> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineDefinition")
            .field("initial_state", &self.initial_state)
            .field("transitions", &self.transitions)
            .field("final_states", &self.final_states)
            .finish()
    }
}

impl<TSaga> StateMachineDefinition<TSaga> {
    /// The synthetic initial state
    pub fn initial_state(&self) -> &State {
        &self.initial_state
    }

    /// Transitions out of `state`, in declaration order.
    pub fn transitions_from(&self, state: &str) -> &[Transition<TSaga>] {
        self.transitions
            .get(state)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether entering `state` finalizes the saga.
    pub fn is_final_state(&self, state: &str) -> bool {
        self.final_states.iter().any(|s| s.name() == state)
    }

    /// Number of configured transitions across all states.
    pub fn transition_count(&self) -> usize {
        self.transitions.values().map(Vec::len).sum()
    }
}
