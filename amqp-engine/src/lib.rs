#![deny(missing_debug_implementations)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! A poll-driven AMQP 1.0 client protocol engine
//!
//! The engine implements the connection, session and link layers of AMQP 1.0 on top
//! of any byte [`Transport`](transport::Transport). Every operation is non-blocking
//! and callback based, with async wrappers that wait on an [`OperationQueue`] while
//! driving the connection forward. Cancellation and deadlines are carried by a
//! [`Context`].
//!
//! # Feature flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `"tracing"` | enables logging with `tracing` |
//! | `"log"` | enables logging with `log` |
//!
//! # Quick start
//!
//! ```rust,ignore
//! use amqp_engine::{Connection, Context, Message, MessageExt, MessageSender, Session};
//!
//! let connection = Connection::builder()
//!     .container_id("client")
//!     .url("amqp://localhost:5672")?
//!     .build()?;
//! let _worker = connection.spawn_worker();
//! connection.open(&Context::new()).await?;
//!
//! let session = Session::new(&connection, Default::default(), None)?;
//! session.begin()?;
//!
//! let sender = MessageSender::new(&session, "q1", Default::default(), None)?;
//! sender.open(&Context::new()).await?;
//! sender.send(&Message::value("hello AMQP"), &Context::new()).await?;
//!
//! sender.close(&Context::new()).await?;
//! session.end()?;
//! connection.close(&Context::new()).await?;
//! ```

pub mod connection;
pub mod context;
pub mod frames;
pub mod link;
pub mod messaging;
pub mod operation_queue;
pub mod session;
pub mod transport;

pub use fe2o3_amqp_types::{definitions, performatives};
pub use connection::{Connection, ConnectionEvents, ConnectionOptions, ConnectionState};
pub use context::Context;
pub use link::{
    Delivery, LinkEndpoint, LinkState, MessageReceiver, MessageReceiverEvents, MessageReceiverOptions,
    MessageSender, MessageSenderEvents, MessageSenderOptions, SendStatus,
};
pub use messaging::{DeliveryState, Message, MessageExt, Outcome};
pub use operation_queue::{OperationQueue, Pollable};
pub use session::{Session, SessionEndpoint, SessionEvents, SessionOptions, SessionState};
