use bytes::Bytes;
use fe2o3_amqp_types::messaging::message::__private::{Deserializable, Serializable};
use serde_amqp::Value;

use super::{ApplicationProperties, MessageId, Properties};

/// Body of the messages moved by the engine
pub type Body = fe2o3_amqp_types::messaging::Body<Value>;

/// An AMQP message with a [`Body`] of values
pub type Message = fe2o3_amqp_types::messaging::Message<Body>;

/// Convenience accessors on [`Message`]
pub trait MessageExt {
    /// A message with a single amqp-value body section
    fn value(value: impl Into<Value>) -> Self;

    /// The message-id property
    fn message_id(&self) -> Option<&MessageId>;

    /// The correlation-id property
    fn correlation_id(&self) -> Option<&MessageId>;

    /// The properties section, created when absent
    fn properties_mut(&mut self) -> &mut Properties;

    /// The application-properties section, created when absent
    fn application_properties_mut(&mut self) -> &mut ApplicationProperties;
}

impl MessageExt for Message {
    fn value(value: impl Into<Value>) -> Self {
        Message::from(Body::from(value.into()))
    }

    fn message_id(&self) -> Option<&MessageId> {
        self.properties.as_ref()?.message_id.as_ref()
    }

    fn correlation_id(&self) -> Option<&MessageId> {
        self.properties.as_ref()?.correlation_id.as_ref()
    }

    fn properties_mut(&mut self) -> &mut Properties {
        self.properties.get_or_insert_with(Properties::default)
    }

    fn application_properties_mut(&mut self) -> &mut ApplicationProperties {
        self.application_properties
            .get_or_insert_with(ApplicationProperties::default)
    }
}

/// Encodes a message as the payload of a delivery
pub fn encode_message(message: &Message) -> Result<Bytes, serde_amqp::Error> {
    serde_amqp::to_vec(&Serializable(message)).map(Bytes::from)
}

/// Decodes the payload of a delivery
pub fn decode_message(payload: &[u8]) -> Result<Message, serde_amqp::Error> {
    let message: Deserializable<Message> = serde_amqp::from_slice(payload)?;
    Ok(message.0)
}

#[cfg(test)]
mod tests {
    use serde_amqp::primitives::Binary;
    use tokio_test::{assert_err, assert_ok};

    use crate::messaging::{Batch, Data, SimpleValue};

    use super::*;

    #[test]
    fn management_style_message_decodes_back() {
        let mut message = Message::value(Value::Null);
        message.properties_mut().message_id = Some(MessageId::from(String::from("id-1")));
        message.properties_mut().reply_to = Some(String::from("$management-reply"));
        message
            .application_properties_mut()
            .insert(String::from("operation"), SimpleValue::from("READ"));

        let payload = assert_ok!(encode_message(&message));
        let decoded = assert_ok!(decode_message(&payload));
        assert_eq!(decoded, message);
        assert_eq!(
            decoded.message_id(),
            Some(&MessageId::String(String::from("id-1")))
        );
        assert_eq!(
            decoded
                .application_properties
                .as_ref()
                .and_then(|p| p.get("operation")),
            Some(&SimpleValue::String(String::from("READ")))
        );
    }

    #[test]
    fn multiple_data_sections_are_kept_in_order() {
        let body = Body::Data(Batch::new(vec![
            Data(Binary::from(vec![1u8, 2])),
            Data(Binary::from(vec![3u8])),
        ]));
        let message = Message::from(body);
        let decoded = assert_ok!(decode_message(&assert_ok!(encode_message(&message))));
        match decoded.body {
            Body::Data(batch) => {
                let sections: Vec<Vec<u8>> = batch.iter().map(|d| d.0.to_vec()).collect();
                assert_eq!(sections, vec![vec![1, 2], vec![3]]);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        assert_err!(decode_message(&[0x00, 0x53, 0x99, 0x45]));
    }
}
