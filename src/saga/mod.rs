//! Saga orchestration
//!
//! A builder-driven state machine engine for long-running workflows:
//! - [`StateMachineBuilder`] declares states, event-matched transitions,
//!   conditional branches, and compensations
//! - [`SagaOrchestrator`] routes events to saga instances, runs the
//!   matched transition, and persists through a [`SagaRepository`]
//! - [`CompensationContext`] collects named undo steps and rolls them
//!   back in LIFO order
//! - [`SagaTimeoutSweeper`] finalizes sagas that stall past a timeout
//!
//! Repositories use optimistic concurrency: every successful update
//! increments the saga version by exactly one, and stale writers get a
//! concurrency error instead of silently losing updates.

pub mod builder;
pub mod compensation;
pub mod context;
pub mod definition;
pub mod orchestrator;
pub mod repository;
pub mod state;
#[cfg(test)]
pub(crate) mod testing;
pub mod timeout;

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use builder::StateMachineBuilder;
pub use compensation::{CompensationContext, CompensationRun};
pub use context::{Services, StateContext};
pub use definition::{SagaAction, StateMachineDefinition, Transition};
pub use orchestrator::SagaOrchestrator;
pub use repository::{InMemorySagaRepository, SagaRepository};
pub use state::{Event, State};
pub use timeout::{SagaTimeoutSweeper, SweeperConfig};

/// State every saga starts in
pub const INITIAL_STATE: &str = "Initial";

/// State the timeout sweeper parks stalled sagas in
pub const TIMED_OUT_STATE: &str = "TimedOut";

/// Domain object coordinated by the saga engine.
///
/// The engine borrows instances from the repository for the duration of
/// one event and returns them through `save`/`update`; it never owns
/// them. `version` is maintained by the repository and must not be
/// touched by domain code.
pub trait Saga: Send + Sync + 'static {
    /// 128-bit identity linking all messages of one conversation
    fn correlation_id(&self) -> Uuid;

    /// Set the correlation id (called once, on creation)
    fn set_correlation_id(&mut self, correlation_id: Uuid);

    /// Current state name; starts as [`INITIAL_STATE`]
    fn current_state(&self) -> &str;

    /// Move to a new state
    fn set_current_state(&mut self, state: String);

    /// Set on first save; immutable afterwards
    fn created_at(&self) -> DateTime<Utc>;

    /// Set by the repository on first save
    fn set_created_at(&mut self, at: DateTime<Utc>);

    /// Refreshed by the repository on every save and update
    fn updated_at(&self) -> DateTime<Utc>;

    /// Refreshed by the repository on every save and update
    fn set_updated_at(&mut self, at: DateTime<Utc>);

    /// Finalized sagas are never re-processed or swept
    fn is_completed(&self) -> bool;

    /// Finalize (terminal; never unset)
    fn set_completed(&mut self, completed: bool);

    /// Strictly increases by one per successful update
    fn version(&self) -> u64;

    /// Maintained by the repository
    fn set_version(&mut self, version: u64);
}
