//! Errors associated with sessions

use crate::{connection::ConnectionState, definitions};

use super::SessionState;

/// Errors associated with [`crate::Session`]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation is not valid in the current session state
    #[error("Illegal local state {0:?}")]
    IllegalState(SessionState),

    /// The connection is not in a state that allows the operation
    #[error("Connection is not opened {0:?}")]
    ConnectionNotOpened(ConnectionState),

    /// The connection has been dropped
    #[error("Connection dropped")]
    ConnectionDropped,

    /// No free channel is left on the connection
    #[error("Reached connection channel max")]
    ChannelMaxReached,

    /// No free link handle is left on the session
    #[error("Reached session handle max")]
    HandleMaxReached,

    /// A link with the same name and role already exists on the session
    #[error("Link name must be unique")]
    DuplicatedLinkName,

    /// The endpoint was not offered by the peer, or is already bound
    #[error("Endpoint is not available")]
    EndpointNotAvailable,

    /// A local error
    #[error("Local error {:?}", .0)]
    Local(definitions::Error),

    /// The remote peer ended the session with the provided error
    #[error("Remote error {:?}", .0)]
    Remote(definitions::Error),
}
