//! Per-transition execution context

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{MessagingError, MessagingResult};
use crate::message::Message;
use crate::saga::compensation::CompensationContext;

/// Type-keyed bag of injected collaborators available to actions.
#[derive(Default)]
pub struct Services {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Services {
    /// Create an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, replacing any previous one of the same type.
    pub fn insert<T: Send + Sync + 'static>(&mut self, service: Arc<T>) {
        self.entries.insert(TypeId::of::<T>(), service);
    }

    /// Look up a service by type.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|service| service.downcast::<T>().ok())
    }
}

/// Everything a transition action can touch: the saga instance, the
/// triggering event, injected services, and the compensation stack.
pub struct StateContext<'a, TSaga> {
    /// The saga instance, borrowed for this event
    pub instance: &'a mut TSaga,
    event: &'a (dyn Any + Send + Sync),
    /// Injected collaborators
    pub services: &'a Services,
    /// Undo steps registered so far
    pub compensation: &'a mut CompensationContext,
}

impl<'a, TSaga> StateContext<'a, TSaga> {
    /// Build a context around one event dispatch.
    pub fn new(
        instance: &'a mut TSaga,
        event: &'a (dyn Any + Send + Sync),
        services: &'a Services,
        compensation: &'a mut CompensationContext,
    ) -> Self {
        Self {
            instance,
            event,
            services,
            compensation,
        }
    }

    /// The triggering event, untyped.
    pub fn event_any(&self) -> &'a (dyn Any + Send + Sync) {
        self.event
    }

    /// The triggering event, downcast to its concrete type.
    pub fn event_as<E: Message>(&self) -> MessagingResult<&'a E> {
        self.event
            .downcast_ref::<E>()
            .ok_or_else(|| MessagingError::internal("event type does not match the transition"))
    }
}
