use crate::{
    definitions::{DeliveryNumber, DeliveryTag},
    messaging::Message,
};

/// A message received on a link, with the delivery it arrived in
#[derive(Debug, Clone)]
pub struct Delivery {
    pub(crate) delivery_id: DeliveryNumber,
    pub(crate) delivery_tag: DeliveryTag,
    pub(crate) message: Message,
}

impl Delivery {
    /// The decoded message
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The sender-chosen tag of the delivery
    pub fn delivery_tag(&self) -> &DeliveryTag {
        &self.delivery_tag
    }

    /// The session-scoped delivery-id
    pub fn delivery_id(&self) -> DeliveryNumber {
        self.delivery_id
    }

    /// Consumes the delivery and returns the message
    pub fn into_message(self) -> Message {
        self.message
    }
}
