//! Implements AMQP1.0 Connection
//!
//! A [`Connection`] is a handle to a protocol engine guarded by a single lock. The
//! engine does not run on its own: it is driven by [`Connection::poll`], either
//! directly, by any task waiting on an operation of the connection, or by the task
//! started with [`Connection::spawn_worker`].

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::Notify, task::JoinHandle};

use crate::{
    context::{Context, Done},
    definitions,
    frames::amqp::Frame,
    operation_queue::{OperationQueue, Pollable, POLL_INTERVAL},
    session::{Session, SessionEndpoint},
};

mod builder;
pub(crate) mod engine;
mod error;
mod heartbeat;
mod outbox;

pub use builder::{Builder, ConnectionOptions, DEFAULT_PORT};
pub use error::Error;
pub(crate) use outbox::{Notification, Outbox};

use engine::ConnectionEngine;

/// Connection states as defined in the AMQP1.0 specification Part 2.4.6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// In this state a connection exists, but nothing has been sent or received.
    /// This is the state an implementation would be in immediately after
    /// performing a socket connect or socket accept.
    Start,

    /// In this state the connection header has been received from the peer but a
    /// connection header has not been sent.
    HeaderReceived,

    /// In this state the connection header has been sent to the peer but no
    /// connection header has been received.
    HeaderSent,

    /// In this state the connection header has been sent to the peer and a
    /// connection header has been received from the peer.
    HeaderExchanged,

    /// In this state both the connection header and the open frame have been
    /// sent but nothing has been received.
    OpenPipe,

    /// In this state, the connection header, the open frame, any pipelined
    /// connection traffic, and the close frame have been sent but nothing has
    /// been received.
    OcPipe,

    /// In this state the connection headers have been exchanged. An open frame
    /// has been received from the peer but an open frame has not been sent.
    OpenReceived,

    /// In this state the connection headers have been exchanged. An open frame
    /// has been sent to the peer but no open frame has yet been received.
    OpenSent,

    /// In this state the connection headers have been exchanged. An open frame,
    /// any pipelined connection traffic, and the close frame have been sent but
    /// no open frame has yet been received from the peer.
    ClosePipe,

    /// In this state the connection header and the open frame have been both
    /// sent and received.
    Opened,

    /// In this state a close frame has been received indicating that the peer
    /// has initiated an AMQP close.
    CloseReceived,

    /// In this state a close frame has been sent to the peer.
    CloseSent,

    /// A close frame carrying an error has been sent. Incoming frames other than
    /// CLOSE are dropped.
    Discarding,

    /// In this state it is illegal for either endpoint to write anything more
    /// onto the connection.
    End,

    /// The transport failed or a protocol violation was detected
    Error,
}

impl ConnectionState {
    /// Whether nothing can happen on the connection anymore
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::End | ConnectionState::Error)
    }
}

/// Events raised by a [`Connection`]
///
/// Callbacks run on whichever task polls the connection, after the engine lock is
/// released, so they may call back into the connection.
pub trait ConnectionEvents: Send + Sync {
    /// Called on every state transition
    fn on_state_changed(
        &self,
        _connection: &Connection,
        _new_state: ConnectionState,
        _old_state: ConnectionState,
    ) {
    }

    /// Called when the peer begins a session. Return `true` after binding a
    /// [`Session`] to the endpoint with [`Session::from_endpoint`], otherwise the
    /// session is rejected.
    fn on_new_endpoint(&self, _connection: &Connection, _endpoint: SessionEndpoint) -> bool {
        false
    }

    /// Called when the transport fails or the peer violates the protocol
    fn on_io_error(&self, _connection: &Connection, _error: &Error) {}

    /// Called for every frame received
    fn on_frame_received(&self, _connection: &Connection, _frame: &Frame) {}
}

pub(crate) struct ConnectionCore {
    engine: Mutex<ConnectionEngine>,
    pub(crate) notify: Arc<Notify>,
    container_id: String,
    listener: Option<Arc<dyn ConnectionEvents>>,
}

impl std::fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("container_id", &self.container_id)
            .finish_non_exhaustive()
    }
}

impl ConnectionCore {
    /// Runs `f` under the engine lock, then writes the frames it produced and
    /// invokes the callbacks it raised once the lock is released
    pub(crate) fn with_engine<R>(self: &Arc<Self>, f: impl FnOnce(&mut ConnectionEngine) -> R) -> R {
        let (result, notifications, discarded) = {
            let mut engine = self.engine.lock();
            let result = f(&mut engine);
            engine.flush();
            let (_, notifications, discarded) = engine.out.take();
            (result, notifications, discarded)
        };
        drop(discarded);
        self.dispatch(notifications);
        result
    }

    fn dispatch(self: &Arc<Self>, notifications: Vec<Notification>) {
        for notification in notifications {
            match notification {
                Notification::ConnectionStateChanged {
                    new_state,
                    old_state,
                } => {
                    if let Some(listener) = &self.listener {
                        listener.on_state_changed(&Connection::from_core(self.clone()), new_state, old_state);
                    }
                }
                Notification::IoError(error) => {
                    if let Some(listener) = &self.listener {
                        listener.on_io_error(&Connection::from_core(self.clone()), &error);
                    }
                }
                Notification::FrameReceived(frame) => {
                    if let Some(listener) = &self.listener {
                        listener.on_frame_received(&Connection::from_core(self.clone()), &frame);
                    }
                }
                Notification::NewEndpoint(key) => {
                    let accepted = self.listener.as_ref().map_or(false, |listener| {
                        listener.on_new_endpoint(&Connection::from_core(self.clone()), SessionEndpoint { key })
                    });
                    self.with_engine(|engine| engine.settle_offered_session(key, accepted));
                }
                Notification::LinkAttached {
                    listener,
                    session,
                    endpoint,
                    attach,
                } => {
                    let accepted = match session.upgrade() {
                        Some(shared) => {
                            listener.on_link_attached(&Session { shared }, endpoint, &attach)
                        }
                        None => false,
                    };
                    self.with_engine(|engine| {
                        engine.settle_offered_link(endpoint.session, endpoint.link, accepted)
                    });
                }
                Notification::LinkStateChanged {
                    listener,
                    new_state,
                    old_state,
                } => listener.on_state_changed(new_state, old_state),
                Notification::LinkDetached { listener, error } => {
                    listener.on_detached(error.as_ref())
                }
                Notification::MessageReceived {
                    listener,
                    session,
                    link,
                    delivery,
                } => {
                    let outcome = listener.on_message_received(&delivery);
                    let delivery_id = delivery.delivery_id();
                    self.with_engine(|engine| {
                        engine.complete_delivery(session, link, delivery_id, outcome)
                    });
                }
                Notification::SendComplete {
                    callback,
                    status,
                    state,
                } => callback(status, state),
            }
        }
    }
}

impl Drop for ConnectionCore {
    fn drop(&mut self) {
        self.engine.get_mut().shutdown();
    }
}

/// An AMQP1.0 connection
///
/// Clones share the same connection. The connection is closed when the last
/// clone, and every session created on it, is dropped.
///
/// # Example
///
/// ```rust,ignore
/// let connection = Connection::builder()
///     .container_id("client-1")
///     .url("amqp://localhost:5672")?
///     .build()?;
/// let _worker = connection.spawn_worker();
/// connection.open(&Context::new()).await?;
/// connection.close(&Context::new()).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Connection {
    pub(crate) core: Arc<ConnectionCore>,
}

impl Connection {
    /// Creates a builder for [`Connection`]
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Creates a connection to `host` with default options
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, Error> {
        Builder::new().host_name(host).port(port).build()
    }

    pub(crate) fn from_core(core: Arc<ConnectionCore>) -> Self {
        Self { core }
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionCore> {
        Arc::downgrade(&self.core)
    }

    /// Opens the transport and sends the protocol header and OPEN without waiting
    pub fn start(&self) -> Result<(), Error> {
        self.core.with_engine(|engine| engine.open()).map(|_| ())
    }

    /// Opens the connection and waits until the peer's OPEN arrives
    pub async fn open(&self, ctx: &Context) -> Result<(), Error> {
        let queue = self.core.with_engine(|engine| engine.open())?;
        self.wait(queue, ctx).await
    }

    /// Opens the transport and waits for the peer to initiate the exchange
    ///
    /// The peer's OPEN is answered automatically. Sessions the peer begins are
    /// offered to [`ConnectionEvents::on_new_endpoint`].
    pub fn listen(&self) -> Result<(), Error> {
        self.core.with_engine(|engine| engine.listen()).map(|_| ())
    }

    /// Sends CLOSE and waits for the peer's CLOSE
    pub async fn close(&self, ctx: &Context) -> Result<(), Error> {
        let queue = self.core.with_engine(|engine| engine.close(None))?;
        self.wait(queue, ctx).await
    }

    /// Sends CLOSE carrying `error` and waits for the peer's CLOSE
    pub async fn close_with_error(
        &self,
        error: definitions::Error,
        ctx: &Context,
    ) -> Result<(), Error> {
        let queue = self.core.with_engine(|engine| engine.close(Some(error)))?;
        self.wait(queue, ctx).await
    }

    async fn wait(
        &self,
        queue: Arc<OperationQueue<Result<(), Error>>>,
        ctx: &Context,
    ) -> Result<(), Error> {
        match queue.wait_for_polled_result(ctx, &[self]).await {
            Some(result) => result,
            None => Err(ctx.done_reason().unwrap_or(Done::Cancelled).into()),
        }
    }

    /// Processes pending transport events and timers without blocking
    ///
    /// Returns the failure once the connection is in [`ConnectionState::Error`].
    pub fn poll(&self) -> Result<(), Error> {
        self.core.with_engine(|engine| engine.poll())
    }

    /// Spawns a task polling the connection until it ends or is dropped
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn spawn_worker(&self) -> JoinHandle<()> {
        let core = self.downgrade();
        let notify = self.core.notify.clone();
        tokio::spawn(async move {
            loop {
                let _ = tokio::time::timeout(POLL_INTERVAL, notify.notified()).await;
                let Some(core) = core.upgrade() else {
                    break;
                };
                let _ = core.with_engine(|engine| engine.poll());
                let state = core.with_engine(|engine| engine.state());
                drop(core);
                if state.is_terminal() {
                    break;
                }
            }
        })
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.core.with_engine(|engine| engine.state())
    }

    /// The error carried by the peer's CLOSE, if any
    pub fn remote_error(&self) -> Option<definitions::Error> {
        self.core.with_engine(|engine| engine.remote_error())
    }

    /// The error that moved the connection to [`ConnectionState::Error`], if any
    pub fn failure(&self) -> Option<definitions::Error> {
        self.core.with_engine(|engine| engine.failure())
    }

    /// Local container id
    pub fn container_id(&self) -> &str {
        &self.core.container_id
    }

    /// The peer's container id, known once its OPEN is received
    pub fn remote_container_id(&self) -> Option<String> {
        self.core.with_engine(|engine| engine.remote_container_id())
    }

    /// Negotiated max-frame-size
    pub fn max_frame_size(&self) -> u32 {
        self.core.with_engine(|engine| engine.max_frame_size())
    }

    /// Negotiated channel-max
    pub fn channel_max(&self) -> u16 {
        self.core.with_engine(|engine| engine.channel_max())
    }

    /// Local idle timeout
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.core.with_engine(|engine| engine.options.idle_timeout)
    }

    /// The peer's idle timeout, heartbeats are sent at half of it
    pub fn remote_idle_timeout(&self) -> Option<Duration> {
        self.core.with_engine(|engine| engine.remote_idle_timeout())
    }
}

impl Pollable for Connection {
    fn poll(&self) {
        let _ = self.core.with_engine(|engine| engine.poll());
    }

    fn notifier(&self) -> Option<Arc<Notify>> {
        Some(self.core.notify.clone())
    }
}
