//! Shared fixtures for saga unit tests
#![allow(dead_code)]

use std::any::Any;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::message::{Message, MessageId};
use crate::saga::{Saga, INITIAL_STATE};

/// Order-fulfilment saga used across the saga unit tests.
#[derive(Debug, Clone)]
pub(crate) struct TestSaga {
    pub correlation_id: Uuid,
    pub current_state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed: bool,
    pub version: u64,
    pub order_total: i64,
    pub note: String,
}

impl Default for TestSaga {
    fn default() -> Self {
        Self {
            correlation_id: Uuid::nil(),
            current_state: INITIAL_STATE.to_string(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
            completed: false,
            version: 0,
            order_total: 0,
            note: String::new(),
        }
    }
}

impl Saga for TestSaga {
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

macro_rules! test_event {
    ($name:ident) => {
        #[derive(Debug, Clone)]
        pub(crate) struct $name {
            pub id: MessageId,
            pub timestamp: DateTime<Utc>,
            pub correlation: Option<Uuid>,
            pub total: i64,
        }

        impl $name {
            pub fn new(correlation: Uuid, total: i64) -> Self {
                Self {
                    id: MessageId::new(),
                    timestamp: Utc::now(),
                    correlation: Some(correlation),
                    total,
                }
            }

            pub fn uncorrelated() -> Self {
                Self {
                    id: MessageId::new(),
                    timestamp: Utc::now(),
                    correlation: None,
                    total: 0,
                }
            }
        }

        impl Message for $name {
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
    };
}

test_event!(OrderStarted);
test_event!(PaymentCompleted);
test_event!(OrderCancelled);
