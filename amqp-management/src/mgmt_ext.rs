//! Extension trait for AMQP messages to provide management specific functionality

use amqp_engine::{Message, MessageExt};
use fe2o3_amqp_types::{messaging::MessageId, primitives::SimpleValue};

/// Extension trait for AMQP messages to provide management specific functionality
pub trait AmqpMessageManagementExt {
    /// The status code stored under `key`
    ///
    /// Returns `Some(Err(value))` if the property is present but not an `int`.
    fn status_code(&self, key: &str) -> Option<Result<i32, &SimpleValue>>;

    /// The status description stored under `key`
    ///
    /// Returns `Some(Err(value))` if the property is present but not a string.
    fn status_description(&self, key: &str) -> Option<Result<&str, &SimpleValue>>;

    /// The id a response to this request must carry as its correlation-id: the
    /// correlation-id if present, else the message-id
    fn request_correlation_key(&self) -> Option<&MessageId>;
}

impl AmqpMessageManagementExt for Message {
    fn status_code(&self, key: &str) -> Option<Result<i32, &SimpleValue>> {
        self.application_properties
            .as_ref()
            .and_then(|ap| ap.get(key))
            .map(|value| match value {
                SimpleValue::Int(code) => Ok(*code),
                _ => Err(value),
            })
    }

    fn status_description(&self, key: &str) -> Option<Result<&str, &SimpleValue>> {
        self.application_properties
            .as_ref()
            .and_then(|ap| ap.get(key))
            .map(|value| match value {
                SimpleValue::String(s) => Ok(s.as_str()),
                _ => Err(value),
            })
    }

    fn request_correlation_key(&self) -> Option<&MessageId> {
        self.correlation_id().or_else(|| self.message_id())
    }
}
