//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use hero_messaging::error::{MessagingError, MessagingResult};
use hero_messaging::facade::{CommandProcessor, EventBus, QueryProcessor, QueueProcessor};
use hero_messaging::message::{Command, Event, Message, MessageId, Query, Responding};
use hero_messaging::pipeline::{MessageProcessor, ProcessingContext, ProcessingResult};
use hero_messaging::saga::{Saga, INITIAL_STATE};
use hero_messaging::scheduling::{MessageDeliveryHandler, ScheduleId, ScheduledMessage};

/// Fire-and-forget command used across facade tests.
#[derive(Debug, Clone)]
pub struct CreateOrder {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub customer: String,
}

impl CreateOrder {
    pub fn new(customer: &str) -> Self {
        Self {
            id: MessageId::new(),
            timestamp: Utc::now(),
            customer: customer.to_string(),
        }
    }
}

impl Message for CreateOrder {
    fn message_id(&self) -> MessageId {
        self.id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    fn payload(&self) -> serde_json::Value {
        serde_json::json!({"customer": self.customer})
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Command for CreateOrder {}

/// Response-bearing command.
#[derive(Debug, Clone)]
pub struct CreateInvoice {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub amount: u64,
}

impl CreateInvoice {
    pub fn new(amount: u64) -> Self {
        Self {
            id: MessageId::new(),
            timestamp: Utc::now(),
            amount,
        }
    }
}

impl Message for CreateInvoice {
    fn message_id(&self) -> MessageId {
        self.id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Command for CreateInvoice {}

impl Responding for CreateInvoice {
    type Response = u64;
}

/// Query returning the order status as a string.
#[derive(Debug, Clone)]
pub struct GetOrderStatus {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
}

impl GetOrderStatus {
    pub fn new() -> Self {
        Self {
            id: MessageId::new(),
            timestamp: Utc::now(),
        }
    }
}

impl Message for GetOrderStatus {
    fn message_id(&self) -> MessageId {
        self.id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Responding for GetOrderStatus {
    type Response = String;
}

impl Query for GetOrderStatus {}

/// Event published on order placement.
#[derive(Debug, Clone)]
pub struct OrderPlaced {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub correlation: Option<Uuid>,
}

impl OrderPlaced {
    pub fn new() -> Self {
        Self {
            id: MessageId::new(),
            timestamp: Utc::now(),
            correlation: None,
        }
    }
}

impl Message for OrderPlaced {
    fn message_id(&self) -> MessageId {
        self.id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    fn correlation_uuid(&self) -> Option<Uuid> {
        self.correlation
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Event for OrderPlaced {}

/// Command processor that counts dispatches and optionally fails or
/// responds with a fixed payload.
pub struct RecordingCommandProcessor {
    pub dispatched: AtomicU32,
    pub fail: bool,
    pub respond_with: Option<fn() -> Box<dyn Any + Send>>,
}

impl RecordingCommandProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dispatched: AtomicU32::new(0),
            fail: false,
            respond_with: None,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            dispatched: AtomicU32::new(0),
            fail: true,
            respond_with: None,
        })
    }

    pub fn responding(respond_with: fn() -> Box<dyn Any + Send>) -> Arc<Self> {
        Arc::new(Self {
            dispatched: AtomicU32::new(0),
            fail: false,
            respond_with: Some(respond_with),
        })
    }
}

#[async_trait]
impl CommandProcessor for RecordingCommandProcessor {
    async fn dispatch(
        &self,
        _command: Box<dyn Message>,
        _cancel: &CancellationToken,
    ) -> MessagingResult<Option<Box<dyn Any + Send>>> {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(MessagingError::transient("command handler unavailable"));
        }
        Ok(self.respond_with.map(|respond| respond()))
    }
}

/// Query processor that returns a fixed status string.
pub struct FixedQueryProcessor {
    pub executed: AtomicU32,
}

impl FixedQueryProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            executed: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl QueryProcessor for FixedQueryProcessor {
    async fn execute(
        &self,
        _query: Box<dyn Message>,
        _cancel: &CancellationToken,
    ) -> MessagingResult<Box<dyn Any + Send>> {
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new("shipped".to_string()))
    }
}

/// Event bus that records published events.
pub struct RecordingEventBus {
    pub published: AtomicU32,
    pub fail: bool,
}

impl RecordingEventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            published: AtomicU32::new(0),
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            published: AtomicU32::new(0),
            fail: true,
        })
    }
}

#[async_trait]
impl EventBus for RecordingEventBus {
    async fn publish(
        &self,
        _event: Box<dyn Message>,
        _cancel: &CancellationToken,
    ) -> MessagingResult<()> {
        if self.fail {
            return Err(MessagingError::transient("bus offline"));
        }
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Queue processor that records enqueued messages.
pub struct RecordingQueueProcessor {
    pub enqueued: Mutex<Vec<String>>,
    pub started: AtomicU32,
    pub stopped: AtomicU32,
}

impl RecordingQueueProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            enqueued: Mutex::new(Vec::new()),
            started: AtomicU32::new(0),
            stopped: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl QueueProcessor for RecordingQueueProcessor {
    async fn enqueue(
        &self,
        _message: Box<dyn Message>,
        queue: &str,
        _cancel: &CancellationToken,
    ) -> MessagingResult<()> {
        self.enqueued.lock().push(queue.to_string());
        Ok(())
    }

    async fn start(&self, _cancel: &CancellationToken) -> MessagingResult<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, _cancel: &CancellationToken) -> MessagingResult<()> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Inner pipeline processor with scriptable behavior.
pub struct CountingProcessor {
    pub calls: AtomicU32,
    pub batch_calls: AtomicU32,
    pub fail_first: AtomicU32,
}

impl CountingProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            batch_calls: AtomicU32::new(0),
            fail_first: AtomicU32::new(0),
        })
    }

    /// Fail the first `n` single-message calls with a transient error.
    pub fn failing_first(n: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            batch_calls: AtomicU32::new(0),
            fail_first: AtomicU32::new(n),
        })
    }
}

#[async_trait]
impl MessageProcessor for CountingProcessor {
    async fn process(
        &self,
        _message: Arc<dyn Message>,
        _context: &ProcessingContext,
        _cancel: &CancellationToken,
    ) -> MessagingResult<ProcessingResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Ok(ProcessingResult::failure(MessagingError::transient(
                "handler warming up",
            )));
        }
        Ok(ProcessingResult::success())
    }

    async fn process_batch(
        &self,
        messages: &[Arc<dyn Message>],
        _context: &ProcessingContext,
        _cancel: &CancellationToken,
    ) -> MessagingResult<Vec<ProcessingResult>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.calls
            .fetch_add(messages.len() as u32, Ordering::SeqCst);
        Ok(messages
            .iter()
            .map(|_| ProcessingResult::success())
            .collect())
    }
}

/// Delivery handler that records message ids it saw.
pub struct RecordingDeliveryHandler {
    pub delivered: Mutex<Vec<MessageId>>,
    pub failed: Mutex<Vec<ScheduleId>>,
}

impl RecordingDeliveryHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl MessageDeliveryHandler for RecordingDeliveryHandler {
    async fn deliver(
        &self,
        message: &ScheduledMessage,
        _cancel: &CancellationToken,
    ) -> MessagingResult<()> {
        self.delivered.lock().push(message.message.message_id());
        Ok(())
    }

    async fn handle_delivery_failure(
        &self,
        schedule_id: ScheduleId,
        _error: &MessagingError,
        _cancel: &CancellationToken,
    ) {
        self.failed.lock().push(schedule_id);
    }
}

/// Order-fulfilment saga used by the saga integration tests.
#[derive(Debug, Clone)]
pub struct OrderSaga {
    pub correlation_id: Uuid,
    pub current_state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed: bool,
    pub version: u64,
    pub reserved_stock: bool,
}

impl Default for OrderSaga {
    fn default() -> Self {
        Self {
            correlation_id: Uuid::nil(),
            current_state: INITIAL_STATE.to_string(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
            completed: false,
            version: 0,
            reserved_stock: false,
        }
    }
}

impl Saga for OrderSaga {
    fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }
    fn set_correlation_id(&mut self, correlation_id: Uuid) {
        self.correlation_id = correlation_id;
    }
    fn current_state(&self) -> &str {
        &self.current_state
    }
    fn set_current_state(&mut self, state: String) {
        self.current_state = state;
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = at;
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
    fn is_completed(&self) -> bool {
        self.completed
    }
    fn set_completed(&mut self, completed: bool) {
        self.completed = completed;
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

/// Saga event carrying an explicit correlation id.
#[derive(Debug, Clone)]
pub struct SagaEvent<const KIND: u8> {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub correlation: Uuid,
}

pub type OrderStarted = SagaEvent<0>;
pub type PaymentCompleted = SagaEvent<1>;

impl<const KIND: u8> SagaEvent<KIND> {
    pub fn new(correlation: Uuid) -> Self {
        Self {
            id: MessageId::new(),
            timestamp: Utc::now(),
            correlation,
        }
    }
}

impl<const KIND: u8> Message for SagaEvent<KIND> {
    fn message_id(&self) -> MessageId {
        self.id
    }
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    fn correlation_id(&self) -> Option<&str> {
        None
    }
    fn correlation_uuid(&self) -> Option<Uuid> {
        Some(self.correlation)
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}
