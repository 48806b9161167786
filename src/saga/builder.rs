//! Fluent state-machine builder
//!
//! Stage types enforce correct chains at compile time: transitions start
//! with `when`, conditional arms open with `branch` and close with
//! `end_branch`, and `otherwise` is only reachable inside a branch.
//!
//! ```ignore
//! let definition = StateMachineBuilder::new()
//!     .initially()
//!     .when(&order_started)
//!     .then(|saga: &mut OrderSaga, event: &OrderStarted, _comp| {
//!         saga.order_id = event.order_id;
//!         Ok(())
//!     })
//!     .transition_to(State::new("ProcessingPayment"))
//!     .done()
//!     .during(State::new("ProcessingPayment"))
//!     .when(&payment_completed)
//!     .transition_to(State::new("Completed"))
//!     .finalize()
//!     .done()
//!     .build()?;
//! ```

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::{MessagingError, MessagingResult};
use crate::message::Message;
use crate::saga::compensation::CompensationContext;
use crate::saga::definition::{
    BranchAction, CompensateAction, CompositeAction, FnAction, SagaAction,
    StateMachineDefinition, Transition, TransitionGuard,
};
use crate::saga::state::{Event, State};
use crate::saga::{Saga, INITIAL_STATE};

/// Root builder; collects transitions per state.
pub struct StateMachineBuilder<TSaga> {
    transitions: HashMap<String, Vec<Transition<TSaga>>>,
    final_states: HashSet<State>,
}

impl<TSaga: Saga> StateMachineBuilder<TSaga> {
    /// Start an empty definition.
    pub fn new() -> Self {
        Self {
            transitions: HashMap::new(),
            final_states: HashSet::new(),
        }
    }

    /// Configure transitions out of the synthetic initial state.
    pub fn initially(self) -> StateBuilder<TSaga> {
        StateBuilder {
            root: self,
            state: State::new(INITIAL_STATE),
        }
    }

    /// Configure transitions out of `state`.
    pub fn during(self, state: State) -> StateBuilder<TSaga> {
        StateBuilder { root: self, state }
    }

    /// Configure transitions out of the named state; repeated calls for
    /// the same name merge.
    pub fn in_state(self, name: impl Into<String>) -> StateBuilder<TSaga> {
        StateBuilder {
            root: self,
            state: State::new(name),
        }
    }

    /// Finish the definition.
    ///
    /// Fails when no transition out of the initial state was configured.
    pub fn build(self) -> MessagingResult<StateMachineDefinition<TSaga>> {
        let has_initial = self
            .transitions
            .get(INITIAL_STATE)
            .map(|transitions| !transitions.is_empty())
            .unwrap_or(false);
        if !has_initial {
            return Err(MessagingError::invalid_input(
                "definition",
                "no transitions out of the initial state; configure them with initially()",
            ));
        }
        Ok(StateMachineDefinition {
            initial_state: State::new(INITIAL_STATE),
            transitions: self.transitions,
            final_states: self.final_states,
        })
    }

    fn commit(&mut self, transition: Transition<TSaga>) {
        if transition.finalize {
            if let Some(target) = &transition.target_state {
                self.final_states.insert(target.clone());
            }
        }
        self.transitions
            .entry(transition.from_state.name().to_string())
            .or_default()
            .push(transition);
    }
}

impl<TSaga: Saga> Default for StateMachineBuilder<TSaga> {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder stage scoped to one source state.
pub struct StateBuilder<TSaga> {
    root: StateMachineBuilder<TSaga>,
    state: State,
}

impl<TSaga: Saga> StateBuilder<TSaga> {
    /// Start a transition matched to `event`.
    pub fn when<E: Message>(self, event: &Event<E>) -> TransitionBuilder<TSaga, E> {
        TransitionBuilder {
            root: self.root,
            from_state: self.state,
            event_name: event.name().to_string(),
            event_type: event.event_type(),
            guard: None,
            actions: Vec::new(),
            target_state: None,
            finalize: false,
            _marker: std::marker::PhantomData,
        }
    }

    /// Return to the root builder without adding a transition.
    pub fn done(self) -> StateMachineBuilder<TSaga> {
        self.root
    }
}

/// Builder stage for one transition.
pub struct TransitionBuilder<TSaga, E> {
    root: StateMachineBuilder<TSaga>,
    from_state: State,
    event_name: String,
    event_type: TypeId,
    guard: Option<TransitionGuard<TSaga>>,
    actions: Vec<Arc<dyn SagaAction<TSaga>>>,
    target_state: Option<State>,
    finalize: bool,
    _marker: std::marker::PhantomData<fn() -> E>,
}

impl<TSaga: Saga, E: Message> TransitionBuilder<TSaga, E> {
    /// Only take this transition when `predicate` passes; a failing
    /// guard falls through to the next declared transition.
    pub fn guard<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&TSaga, &E) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(move |saga, event| {
            event
                .downcast_ref::<E>()
                .map(|event| predicate(saga, event))
                .unwrap_or(false)
        }));
        self
    }

    /// Attach a sequential action.
    pub fn then<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut TSaga, &E, &mut CompensationContext) -> MessagingResult<()>
            + Send
            + Sync
            + 'static,
    {
        let action: Arc<dyn SagaAction<TSaga>> = Arc::new(FnAction::<TSaga, E, F>::new(action));
        self.actions.push(action);
        self
    }

    /// Attach several pre-built actions, run in order.
    pub fn then_all(mut self, actions: impl IntoIterator<Item = Arc<dyn SagaAction<TSaga>>>) -> Self {
        self.actions.extend(actions);
        self
    }

    /// Copy event data onto the saga.
    pub fn then_copy<F>(self, copy: F) -> Self
    where
        F: Fn(&mut TSaga, &E) + Send + Sync + 'static,
    {
        self.then(move |saga, event, _compensation| {
            copy(saga, event);
            Ok(())
        })
    }

    /// Set one saga property from the event.
    pub fn then_set<V, S, G>(self, setter: S, selector: G) -> Self
    where
        V: Send + Sync + 'static,
        S: Fn(&mut TSaga, V) + Send + Sync + 'static,
        G: Fn(&E) -> V + Send + Sync + 'static,
    {
        self.then(move |saga, event, _compensation| {
            setter(saga, selector(event));
            Ok(())
        })
    }

    /// Register a synchronous compensation when this transition runs.
    pub fn compensate_with<F>(mut self, name: impl Into<String>, undo: F) -> Self
    where
        F: Fn() -> MessagingResult<()> + Send + Sync + 'static,
    {
        let undo = Arc::new(undo);
        self.actions.push(Arc::new(CompensateAction {
            name: name.into(),
            run: Arc::new(move |_token| {
                let undo = undo.clone();
                Box::pin(async move { undo() })
            }),
        }));
        self
    }

    /// Register a cancellation-aware async compensation when this
    /// transition runs.
    pub fn compensate_with_async<F>(mut self, name: impl Into<String>, undo: F) -> Self
    where
        F: Fn(CancellationToken) -> BoxFuture<'static, MessagingResult<()>>
            + Send
            + Sync
            + 'static,
    {
        self.actions.push(Arc::new(CompensateAction {
            name: name.into(),
            run: Arc::new(undo),
        }));
        self
    }

    /// Open a conditional branch; exactly one arm will execute.
    pub fn branch<F>(self, predicate: F) -> BranchBuilder<TSaga, E>
    where
        F: Fn(&TSaga, &E) -> bool + Send + Sync + 'static,
    {
        BranchBuilder {
            transition: self,
            predicate: Arc::new(move |saga, event| {
                event
                    .downcast_ref::<E>()
                    .map(|event| predicate(saga, event))
                    .unwrap_or(false)
            }),
            then_actions: Vec::new(),
            then_target: None,
        }
    }

    /// Assign the target state when the transition completes.
    pub fn transition_to(mut self, state: State) -> Self {
        self.target_state = Some(state);
        self
    }

    /// Executing this transition completes the saga; its target state
    /// (when set) becomes a final state.
    pub fn finalize(mut self) -> Self {
        self.finalize = true;
        self
    }

    /// Alias for [`finalize`](Self::finalize).
    pub fn mark_as_completed(self) -> Self {
        self.finalize()
    }

    /// Commit this transition and start another from the same state.
    pub fn when<E2: Message>(self, event: &Event<E2>) -> TransitionBuilder<TSaga, E2> {
        let TransitionBuilder {
            mut root,
            from_state,
            event_name,
            event_type,
            guard,
            actions,
            target_state,
            finalize,
            _marker,
        } = self;
        root.commit(Transition {
            from_state: from_state.clone(),
            event_name,
            event_type,
            guard,
            action: Self::fold_actions(actions),
            target_state,
            finalize,
        });
        StateBuilder {
            root,
            state: from_state,
        }
        .when(event)
    }

    /// Commit this transition and return to the root builder.
    pub fn done(self) -> StateMachineBuilder<TSaga> {
        let TransitionBuilder {
            mut root,
            from_state,
            event_name,
            event_type,
            guard,
            actions,
            target_state,
            finalize,
            _marker,
        } = self;
        root.commit(Transition {
            from_state,
            event_name,
            event_type,
            guard,
            action: Self::fold_actions(actions),
            target_state,
            finalize,
        });
        root
    }

    fn fold_actions(
        mut actions: Vec<Arc<dyn SagaAction<TSaga>>>,
    ) -> Option<Arc<dyn SagaAction<TSaga>>> {
        match actions.len() {
            0 => None,
            1 => actions.pop(),
            _ => Some(Arc::new(CompositeAction { actions })),
        }
    }
}

/// Then-arm of a conditional branch.
pub struct BranchBuilder<TSaga, E> {
    transition: TransitionBuilder<TSaga, E>,
    predicate: TransitionGuard<TSaga>,
    then_actions: Vec<Arc<dyn SagaAction<TSaga>>>,
    then_target: Option<State>,
}

impl<TSaga: Saga, E: Message> BranchBuilder<TSaga, E> {
    /// Attach an action to the then-arm.
    pub fn then<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut TSaga, &E, &mut CompensationContext) -> MessagingResult<()>
            + Send
            + Sync
            + 'static,
    {
        let action: Arc<dyn SagaAction<TSaga>> = Arc::new(FnAction::<TSaga, E, F>::new(action));
        self.then_actions.push(action);
        self
    }

    /// Set the then-arm's target state.
    pub fn transition_to(mut self, state: State) -> Self {
        self.then_target = Some(state);
        self
    }

    /// Open the else-arm.
    pub fn otherwise(self) -> ElseBuilder<TSaga, E> {
        ElseBuilder {
            branch: self,
            else_actions: Vec::new(),
            else_target: None,
        }
    }

    /// Close the branch with an empty else-arm.
    pub fn end_branch(self) -> TransitionBuilder<TSaga, E> {
        self.finish(Vec::new(), None)
    }

    fn finish(
        mut self,
        else_actions: Vec<Arc<dyn SagaAction<TSaga>>>,
        else_target: Option<State>,
    ) -> TransitionBuilder<TSaga, E> {
        self.transition.actions.push(Arc::new(BranchAction {
            predicate: self.predicate,
            then_actions: self.then_actions,
            then_target: self.then_target,
            else_actions,
            else_target,
        }));
        self.transition
    }
}

/// Else-arm of a conditional branch.
pub struct ElseBuilder<TSaga, E> {
    branch: BranchBuilder<TSaga, E>,
    else_actions: Vec<Arc<dyn SagaAction<TSaga>>>,
    else_target: Option<State>,
}

impl<TSaga: Saga, E: Message> ElseBuilder<TSaga, E> {
    /// Attach an action to the else-arm.
    pub fn then<F>(mut self, action: F) -> Self
    where
        F: Fn(&mut TSaga, &E, &mut CompensationContext) -> MessagingResult<()>
            + Send
            + Sync
            + 'static,
    {
        let action: Arc<dyn SagaAction<TSaga>> = Arc::new(FnAction::<TSaga, E, F>::new(action));
        self.else_actions.push(action);
        self
    }

    /// Set the else-arm's target state.
    pub fn transition_to(mut self, state: State) -> Self {
        self.else_target = Some(state);
        self
    }

    /// Close the branch.
    pub fn end_branch(self) -> TransitionBuilder<TSaga, E> {
        self.branch.finish(self.else_actions, self.else_target)
    }
}
