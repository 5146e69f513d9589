//! Messaging layer types: messages, delivery states and link termini
//!
//! Sections, termini and outcomes are those of [`fe2o3_amqp_types::messaging`].
//! The engine carries messages whose body holds [`Value`](serde_amqp::Value)s.

mod message;

pub use fe2o3_amqp_types::messaging::{
    Accepted, AmqpSequence, AmqpValue, ApplicationProperties, Batch, Data, DeliveryAnnotations,
    DeliveryState, Footer, Header, MessageAnnotations, MessageId, Modified, Outcome, Properties,
    Received, Rejected, Released, Source, SourceBuilder, Target, TargetArchetype, TargetBuilder,
};
pub use fe2o3_amqp_types::primitives::SimpleValue;
pub use message::*;
