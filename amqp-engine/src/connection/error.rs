//! Implements errors associated with the connection

use std::io;

use crate::{
    context::Done,
    definitions::{self, AmqpError, ConnectionError},
    frames, transport,
};

use super::ConnectionState;

/// Errors associated with [`crate::Connection`]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// The transport rejected an operation
    #[error(transparent)]
    Transport(#[from] transport::Error),

    /// Error parsing the url
    #[error(transparent)]
    UrlError(#[from] url::ParseError),

    /// The operation is not valid in the current state
    #[error("Illegal local state {0:?}")]
    IllegalState(ConnectionState),

    /// A local error
    #[error("Local error {:?}", .0)]
    Local(definitions::Error),

    /// The remote peer closed with the provided error
    #[error("Remote error {:?}", .0)]
    Remote(definitions::Error),

    /// No free channel is left
    #[error("Reached connection channel max")]
    ChannelMaxReached,

    /// The waiting context was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// The deadline of the waiting context elapsed
    #[error("Operation timed out")]
    Timeout,

    /// The connection was dropped while the operation was pending
    #[error("Connection dropped")]
    Dropped,
}

impl Error {
    pub(crate) fn amqp_error(
        condition: impl Into<AmqpError>,
        description: impl Into<Option<String>>,
    ) -> Self {
        Self::Local(definitions::Error::new(condition.into(), description, None))
    }

    pub(crate) fn connection_error(
        condition: impl Into<ConnectionError>,
        description: impl Into<Option<String>>,
    ) -> Self {
        Self::Local(definitions::Error::new(condition.into(), description, None))
    }

    /// The AMQP error sent to the peer, or recorded, for this failure
    pub(crate) fn to_amqp_error(&self) -> definitions::Error {
        match self {
            Error::Local(error) | Error::Remote(error) => error.clone(),
            Error::Io(error) => definitions::Error::new(
                ConnectionError::ConnectionForced,
                Some(error.to_string()),
                None,
            ),
            other => definitions::Error::new(
                AmqpError::InternalError,
                Some(other.to_string()),
                None,
            ),
        }
    }
}

impl From<frames::Error> for Error {
    fn from(err: frames::Error) -> Self {
        match err {
            frames::Error::Io(e) => Self::Io(e),
            frames::Error::Decode(e) => Self::amqp_error(AmqpError::DecodeError, e.to_string()),
            frames::Error::Encode(e) => Self::amqp_error(AmqpError::InternalError, e.to_string()),
            frames::Error::FramingError(description) => {
                Self::connection_error(ConnectionError::FramingError, description.to_string())
            }
            frames::Error::NotImplemented => {
                Self::amqp_error(AmqpError::NotImplemented, None)
            }
        }
    }
}

impl From<Done> for Error {
    fn from(done: Done) -> Self {
        match done {
            Done::Cancelled => Self::Cancelled,
            Done::DeadlineExceeded => Self::Timeout,
        }
    }
}
