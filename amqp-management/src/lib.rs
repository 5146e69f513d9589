#![deny(missing_debug_implementations)]
#![warn(missing_docs)]

//! An implementation of the AMQP 1.0 management request/response protocol on top of
//! `amqp-engine`
//!
//! A [`ManagementClient`] attaches a sender to the management node and a receiver
//! sourced from it. Each request carries `operation`, `type` and `locales`
//! application properties, and its response is matched by correlation-id: the
//! request's correlation-id when present, else its message-id.

pub mod client;
pub mod constants;
pub mod error;
pub mod mgmt_ext;
pub mod status;

/// The default address of the management node.
pub const MANAGEMENT_NODE_ADDRESS: &str = "$management";

pub use client::{
    ManagementClient, ManagementClientEvents, ManagementClientOptions, ManagementState,
};
pub use error::Error;
pub use status::{ManagementOpenStatus, ManagementOperationStatus, ManagementResult};
