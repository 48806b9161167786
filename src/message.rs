//! Message data model
//!
//! Every routable payload carries a 128-bit identity, a wall-clock
//! timestamp, optional correlation/causation links, and an ordered
//! metadata bag. Commands, queries, and events are marker layers over the
//! same base contract so the pipeline can treat them uniformly.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MessagingError, MessagingResult};

/// Unique identifier for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(#[serde(with = "uuid::serde::compact")] pub Uuid);

impl MessageId {
    /// Generate a new message ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The all-zero ID, never valid on a routable message
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Whether this is the all-zero ID
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Parse from string
    pub fn parse_str(s: &str) -> MessagingResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| MessagingError::invalid_input("message_id", e.to_string()))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered metadata bag attached to messages and processing contexts
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Sentinel for "timestamp was never set"
pub fn is_default_timestamp(timestamp: DateTime<Utc>) -> bool {
    timestamp == DateTime::<Utc>::UNIX_EPOCH
}

/// Base contract for every routable payload.
///
/// `as_any` powers typed dispatch (saga transition matching, typed batch
/// responses) without reflection; `payload` exposes the message body to
/// the size validator's serializer.
pub trait Message: fmt::Debug + Send + Sync + 'static {
    /// Unique message identity; must not be nil
    fn message_id(&self) -> MessageId;

    /// Creation instant; must not be the default sentinel
    fn timestamp(&self) -> DateTime<Utc>;

    /// Opaque conversation identifier
    fn correlation_id(&self) -> Option<&str> {
        None
    }

    /// Identifier of the message that caused this one
    fn causation_id(&self) -> Option<&str> {
        None
    }

    /// Ordered metadata bag
    fn metadata(&self) -> Option<&Metadata> {
        None
    }

    /// Type name used for rate-limit scoping and logging
    fn message_type(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Body exposed to the sizing serializer
    fn payload(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Typed view for downcast-based dispatch
    fn as_any(&self) -> &dyn Any;

    /// Correlation id parsed as a 128-bit value, when present and valid.
    ///
    /// Saga routing prefers the explicit string form; message types whose
    /// correlation lives in a typed field override this directly.
    fn correlation_uuid(&self) -> Option<Uuid> {
        self.correlation_id()
            .and_then(|value| Uuid::parse_str(value).ok())
    }
}

/// Fire-and-forget or response-bearing instruction
pub trait Command: Message {}

/// Fan-out notification
pub trait Event: Message {}

/// Marker for messages that produce a typed response
pub trait Responding {
    /// Response produced by the processor
    type Response: Send + 'static;
}

/// Request/response read; always response-bearing
pub trait Query: Message + Responding {}

/// Plain message routed to queue, outbox, or inbox processors.
///
/// Carries an arbitrary JSON body; domain code that needs typed payloads
/// implements [`Message`] directly instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericMessage {
    /// Message identity
    pub id: MessageId,
    /// Creation instant
    pub timestamp: DateTime<Utc>,
    /// Opaque conversation identifier
    pub correlation_id: Option<String>,
    /// Identifier of the causing message
    pub causation_id: Option<String>,
    /// Ordered metadata bag
    pub metadata: Metadata,
    /// Arbitrary JSON body
    pub body: serde_json::Value,
}

impl GenericMessage {
    /// Create a message with a fresh identity.
    pub fn new(body: serde_json::Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            timestamp,
            correlation_id: None,
            causation_id: None,
            metadata: Metadata::new(),
            body,
        }
    }

    /// Attach a correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach a causation id.
    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// Attach one metadata entry.
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl Message for GenericMessage {
    fn message_id(&self) -> MessageId {
        self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    fn metadata(&self) -> Option<&Metadata> {
        Some(&self.metadata)
    }

    fn payload(&self) -> serde_json::Value {
        self.body.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_nil_detection() {
        assert!(MessageId::nil().is_nil());
        assert!(!MessageId::new().is_nil());
    }

    #[test]
    fn test_default_timestamp_sentinel() {
        assert!(is_default_timestamp(DateTime::<Utc>::UNIX_EPOCH));
        assert!(!is_default_timestamp(Utc::now()));
    }

    #[test]
    fn test_correlation_uuid_parses_valid_ids() {
        let correlation = Uuid::new_v4();
        let message = GenericMessage::new(serde_json::json!({"k": 1}), Utc::now())
            .with_correlation_id(correlation.to_string());
        assert_eq!(message.correlation_uuid(), Some(correlation));

        let bad = GenericMessage::new(serde_json::Value::Null, Utc::now())
            .with_correlation_id("not-a-uuid");
        assert_eq!(bad.correlation_uuid(), None);
    }

    #[test]
    fn test_metadata_is_ordered() {
        let message = GenericMessage::new(serde_json::Value::Null, Utc::now())
            .with_metadata("zebra", 1)
            .with_metadata("apple", 2);
        let keys: Vec<_> = message.metadata.keys().cloned().collect();
        assert_eq!(keys, vec!["apple".to_string(), "zebra".to_string()]);
    }
}
