//! Errors associated with links

use crate::{context::Done, definitions};

use super::LinkState;

/// Errors associated with [`crate::MessageSender`] and [`crate::MessageReceiver`]
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The operation is not valid in the current link state
    #[error("Illegal local state {0:?}")]
    IllegalState(LinkState),

    /// The session is not mapped
    #[error("Session is not mapped")]
    SessionNotMapped,

    /// The connection has been dropped
    #[error("Connection dropped")]
    ConnectionDropped,

    /// The waiting context was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// The deadline of the waiting context elapsed
    #[error("Operation timed out")]
    Timeout,

    /// The peer detached the link without an error
    #[error("Link detached by peer")]
    Detached,

    /// A local error
    #[error("Local error {:?}", .0)]
    Local(definitions::Error),

    /// The remote peer detached with the provided error
    #[error("Remote error {:?}", .0)]
    Remote(definitions::Error),

    /// The message is larger than the peer's max-message-size
    #[error("Message size {size} exceeds max-message-size {max}")]
    MessageSizeExceeded {
        /// Encoded size of the message
        size: u64,
        /// The peer's limit
        max: u64,
    },

    /// The message could not be encoded
    #[error("Encode error {0}")]
    Encode(#[from] serde_amqp::Error),
}

impl From<Done> for LinkError {
    fn from(done: Done) -> Self {
        match done {
            Done::Cancelled => Self::Cancelled,
            Done::DeadlineExceeded => Self::Timeout,
        }
    }
}
