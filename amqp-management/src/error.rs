//! Error types of the management client

use amqp_engine::{link::LinkError, session};

use crate::client::ManagementState;

/// Errors of [`crate::ManagementClient`]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operation is not allowed in the current state
    #[error("Illegal management client state {0:?}")]
    IllegalState(ManagementState),

    /// The links could not be attached when opening lazily
    #[error("Management links failed to open")]
    OpenFailed,

    /// A request with the same correlation-id is still waiting for its response
    #[error("A request with the same correlation id is outstanding")]
    DuplicateCorrelationId,

    /// The deadline of the context elapsed
    #[error("Management operation timed out")]
    Timeout,

    /// The context was cancelled
    #[error("Management operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Session(#[from] session::Error),

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// A specialized `Result` type for management operations
pub type Result<T> = std::result::Result<T, Error>;
