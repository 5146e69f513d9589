//! Byte transports underneath a connection
//!
//! A [`Transport`] moves opaque bytes. It never blocks the caller: completion of
//! `open`, `send` and `close` as well as incoming bytes are reported through the
//! [`TransportCallbacks`] handed to [`Transport::open`]. The connection drains those
//! events whenever it is polled.

use std::{fmt, io, sync::Arc};

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

mod error;
mod memory;
pub mod protocol_header;
mod tcp;

pub use error::Error;
pub use memory::MemoryTransport;
pub use tcp::TcpTransport;

/// An event reported by a transport
#[derive(Debug)]
pub enum TransportEvent {
    /// The transport is ready to carry bytes
    Opened,

    /// Bytes arrived from the peer
    BytesReceived(Bytes),

    /// A previous `send` was written out
    SendComplete,

    /// The transport was closed, locally or by the peer
    Closed,

    /// The transport failed
    Error(io::Error),
}

/// Completion callbacks of a transport
///
/// Every event is queued for the owning connection and wakes anything waiting on
/// that connection.
#[derive(Debug, Clone)]
pub struct TransportCallbacks {
    sender: mpsc::UnboundedSender<TransportEvent>,
    notify: Arc<Notify>,
}

impl TransportCallbacks {
    pub(crate) fn new(sender: mpsc::UnboundedSender<TransportEvent>, notify: Arc<Notify>) -> Self {
        Self { sender, notify }
    }

    fn emit(&self, event: TransportEvent) {
        // The connection may already be gone
        let _ = self.sender.send(event);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Reports that the transport is open
    pub fn on_open_complete(&self) {
        self.emit(TransportEvent::Opened)
    }

    /// Delivers bytes received from the peer
    pub fn on_bytes_received(&self, bytes: Bytes) {
        self.emit(TransportEvent::BytesReceived(bytes))
    }

    /// Reports that a send finished
    pub fn on_send_complete(&self) {
        self.emit(TransportEvent::SendComplete)
    }

    /// Reports that the transport is closed
    pub fn on_close_complete(&self) {
        self.emit(TransportEvent::Closed)
    }

    /// Reports a transport failure
    pub fn on_error(&self, error: io::Error) {
        self.emit(TransportEvent::Error(error))
    }
}

/// A bidirectional byte channel
pub trait Transport: Send + fmt::Debug {
    /// Starts the transport. Completion is reported through `callbacks`.
    fn open(&mut self, callbacks: TransportCallbacks) -> Result<(), Error>;

    /// Queues bytes for the peer
    fn send(&mut self, bytes: Bytes) -> Result<(), Error>;

    /// Starts closing the transport
    fn close(&mut self) -> Result<(), Error>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self, callbacks: TransportCallbacks) -> Result<(), Error> {
        (**self).open(callbacks)
    }

    fn send(&mut self, bytes: Bytes) -> Result<(), Error> {
        (**self).send(bytes)
    }

    fn close(&mut self) -> Result<(), Error> {
        (**self).close()
    }
}
