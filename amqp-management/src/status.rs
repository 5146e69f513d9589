//! Outcomes of management operations

use amqp_engine::{definitions, Message};

/// Result of [`crate::ManagementClient::open`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagementOpenStatus {
    /// Both links are attached
    Ok,

    /// A link failed to attach
    Error,

    /// The context was cancelled or expired before both links were attached
    Cancelled,
}

/// Status of a completed management operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagementOperationStatus {
    /// The node answered with a 2xx status code
    Ok,

    /// The request could not be delivered or the response could not be read
    Error,

    /// The node answered with a status code outside 200..=299
    FailedBadStatus,
}

/// Result of [`crate::ManagementClient::execute_operation`]
#[derive(Debug, Clone, PartialEq)]
pub struct ManagementResult {
    /// Overall status
    pub status: ManagementOperationStatus,

    /// The status code sent by the node, `0` if none could be read
    pub status_code: i32,

    /// The status description sent by the node
    pub description: String,

    /// Error that caused an [`ManagementOperationStatus::Error`], if known
    pub error: Option<definitions::Error>,

    /// The response message
    pub message: Option<Message>,
}

impl ManagementResult {
    pub(crate) fn error(description: impl Into<String>, error: Option<definitions::Error>) -> Self {
        Self {
            status: ManagementOperationStatus::Error,
            status_code: 0,
            description: description.into(),
            error,
            message: None,
        }
    }

    /// Whether the node answered with a 2xx status code
    pub fn is_ok(&self) -> bool {
        self.status == ManagementOperationStatus::Ok
    }
}
