//! Request messages of the put-token and delete-token operations

use amqp_engine::{Message, MessageExt};
use fe2o3_amqp_types::primitives::SimpleValue;
use serde_amqp::{primitives::Timestamp, Value};

use crate::constants::{EXPIRATION, NAME};

/// The token travels as an AMQP value body. The audience and the expiry are
/// application properties; `operation` and `type` are stamped by the management
/// client.
pub(crate) fn put_token_message(audience: &str, token: &str, expiration: Option<Timestamp>) -> Message {
    let mut message = Message::value(Value::String(token.to_string()));
    let properties = message.application_properties_mut();
    properties.insert(String::from(NAME), SimpleValue::String(audience.to_string()));
    if let Some(expiration) = expiration {
        properties.insert(String::from(EXPIRATION), SimpleValue::Timestamp(expiration));
    }
    message
}

pub(crate) fn delete_token_message(audience: &str) -> Message {
    let mut message = Message::value(Value::Null);
    message
        .application_properties_mut()
        .insert(String::from(NAME), SimpleValue::String(audience.to_string()));
    message
}
