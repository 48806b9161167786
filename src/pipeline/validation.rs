//! Validation decorator
//!
//! Runs a list of validators before forwarding to the inner processor.
//! Any validator error short-circuits the call with a failure result that
//! aggregates every error found.
//!
//! Required-field checks are descriptor-driven: message types register
//! named extractors once at construction time, replacing runtime
//! reflection with a direct table lookup.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{MessagingError, MessagingResult};
use crate::message::{is_default_timestamp, Message};
use crate::pipeline::{MessageProcessor, ProcessingContext, ProcessingResult};

/// Validator output: pass/fail plus ordered error strings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    /// Whether the message passed
    pub is_valid: bool,
    /// Errors in the order they were found
    pub errors: Vec<String>,
}

impl ValidationReport {
    /// A passing report
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    /// A failing report with the given errors
    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            is_valid: false,
            errors,
        }
    }
}

/// One validation rule applied before processing
#[async_trait]
pub trait MessageValidator: Send + Sync {
    /// Validator name, used in logs
    fn name(&self) -> &str;

    /// Validate the message.
    async fn validate(&self, message: &dyn Message) -> ValidationReport;
}

/// Computes the JSON byte size of a message.
///
/// Injected so tests can drive sizing failures; sizing errors are
/// reported as validation errors, never rethrown.
pub trait MessageSizer: Send + Sync {
    /// Byte count of the serialized message
    fn json_byte_count(&self, message: &dyn Message) -> MessagingResult<usize>;
}

/// Default sizer: serializes the message envelope plus payload with
/// `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSizer;

impl MessageSizer for JsonSizer {
    fn json_byte_count(&self, message: &dyn Message) -> MessagingResult<usize> {
        let envelope = serde_json::json!({
            "message_id": message.message_id(),
            "timestamp": message.timestamp(),
            "correlation_id": message.correlation_id(),
            "causation_id": message.causation_id(),
            "metadata": message.metadata(),
            "payload": message.payload(),
        });
        Ok(serde_json::to_vec(&envelope)?.len())
    }
}

/// Rejects messages whose serialized size exceeds a byte budget.
pub struct MessageSizeValidator {
    max_bytes: usize,
    sizer: Arc<dyn MessageSizer>,
}

impl MessageSizeValidator {
    /// Create a validator with the given byte budget.
    pub fn new(max_bytes: usize, sizer: Arc<dyn MessageSizer>) -> Self {
        Self { max_bytes, sizer }
    }
}

#[async_trait]
impl MessageValidator for MessageSizeValidator {
    fn name(&self) -> &str {
        "MessageSizeValidator"
    }

    async fn validate(&self, message: &dyn Message) -> ValidationReport {
        match self.sizer.json_byte_count(message) {
            Ok(size) if size <= self.max_bytes => ValidationReport::valid(),
            Ok(size) => ValidationReport::invalid(vec![format!(
                "message size {} bytes exceeds the maximum of {} bytes",
                size, self.max_bytes
            )]),
            Err(error) => ValidationReport::invalid(vec![format!(
                "failed to compute message size: {}",
                error
            )]),
        }
    }
}

type FieldExtractor = Arc<dyn Fn(&dyn Message) -> Option<serde_json::Value> + Send + Sync>;

struct RequiredField {
    name: String,
    extract: FieldExtractor,
}

/// Checks base message invariants plus registered required fields.
///
/// Base invariants: non-nil `MessageId`, non-default timestamp. Required
/// fields fail on absent values, JSON null, and empty or whitespace-only
/// strings.
#[derive(Default)]
pub struct RequiredFieldsValidator {
    descriptors: HashMap<TypeId, Vec<RequiredField>>,
}

impl RequiredFieldsValidator {
    /// Create a validator with no registered fields (base checks only).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a required field for message type `M`.
    ///
    /// The extractor returns the current field value; `None` means the
    /// field is unset.
    pub fn require<M, F>(mut self, field_name: impl Into<String>, extract: F) -> Self
    where
        M: Message,
        F: Fn(&M) -> Option<serde_json::Value> + Send + Sync + 'static,
    {
        let erased: FieldExtractor = Arc::new(move |message: &dyn Message| {
            message.as_any().downcast_ref::<M>().and_then(&extract)
        });
        self.descriptors
            .entry(TypeId::of::<M>())
            .or_default()
            .push(RequiredField {
                name: field_name.into(),
                extract: erased,
            });
        self
    }
}

#[async_trait]
impl MessageValidator for RequiredFieldsValidator {
    fn name(&self) -> &str {
        "RequiredFieldsValidator"
    }

    async fn validate(&self, message: &dyn Message) -> ValidationReport {
        let mut errors = Vec::new();

        if message.message_id().is_nil() {
            errors.push("MessageId must not be empty".to_string());
        }
        if is_default_timestamp(message.timestamp()) {
            errors.push("Timestamp must be set".to_string());
        }

        if let Some(fields) = self.descriptors.get(&message.as_any().type_id()) {
            for field in fields {
                match (field.extract)(message) {
                    None | Some(serde_json::Value::Null) => {
                        errors.push(format!("required field '{}' is missing", field.name));
                    }
                    Some(serde_json::Value::String(text)) if text.trim().is_empty() => {
                        errors.push(format!("required field '{}' is empty", field.name));
                    }
                    Some(_) => {}
                }
            }
        }

        if errors.is_empty() {
            ValidationReport::valid()
        } else {
            ValidationReport::invalid(errors)
        }
    }
}

/// Decorator that validates before forwarding.
pub struct ValidationDecorator {
    inner: Arc<dyn MessageProcessor>,
    validators: Vec<Arc<dyn MessageValidator>>,
}

impl ValidationDecorator {
    /// Wrap `inner` with the given validators (run in order).
    pub fn new(inner: Arc<dyn MessageProcessor>, validators: Vec<Arc<dyn MessageValidator>>) -> Self {
        Self { inner, validators }
    }
}

#[async_trait]
impl MessageProcessor for ValidationDecorator {
    async fn process(
        &self,
        message: Arc<dyn Message>,
        context: &ProcessingContext,
        cancel: &CancellationToken,
    ) -> MessagingResult<ProcessingResult> {
        let mut errors = Vec::new();
        for validator in &self.validators {
            let report = validator.validate(message.as_ref()).await;
            if !report.is_valid {
                debug!(
                    validator = validator.name(),
                    message_id = %message.message_id(),
                    "message failed validation"
                );
                errors.extend(report.errors);
            }
        }

        if !errors.is_empty() {
            let summary = errors.join("; ");
            return Ok(ProcessingResult::failure_with_message(
                MessagingError::ValidationFailed { errors },
                summary,
            ));
        }

        self.inner.process(message, context, cancel).await
    }
}
