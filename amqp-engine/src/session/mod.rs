//! Implements AMQP1.0 Session

use std::sync::{Arc, Weak};

use crate::{
    connection::{Connection, ConnectionCore},
    definitions::{self, Fields},
    link::{engine::LinkKind, LinkConfig, LinkEndpoint},
    performatives::Attach,
};

pub(crate) mod engine;
mod error;

pub use error::Error;

/// Default incoming window
pub const DEFAULT_WINDOW: u32 = 2048;

/// Default number of links per session
pub const DEFAULT_MAX_LINK_COUNT: u32 = 256;

/// Session states as defined in the AMQP1.0 specification Part 2.5.5
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// In the UNMAPPED state, the session endpoint is not mapped to any incoming
    /// or outgoing channels on the connection endpoint.
    Unmapped,

    /// In the BEGIN SENT state, the session endpoint is assigned an outgoing
    /// channel number, but there is no entry in the incoming channel map.
    BeginSent,

    /// In the BEGIN RCVD state, the session endpoint has an entry in the incoming
    /// channel map, but has not yet been assigned an outgoing channel number.
    BeginReceived,

    /// In the MAPPED state, the session endpoint has both an outgoing channel
    /// number and an entry in the incoming channel map.
    Mapped,

    /// In the END SENT state, the session endpoint has an entry in the incoming
    /// channel map, but is no longer assigned an outgoing channel number.
    EndSent,

    /// In the END RCVD state, the session endpoint is assigned an outgoing
    /// channel number, but there is no entry in the incoming channel map.
    EndReceived,

    /// The DISCARDING state is a variant of the END SENT state where the end is
    /// triggered by an error.
    Discarding,

    /// The connection failed underneath the session
    Error,
}

/// Options of a [`Session`]
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Transfers the peer may send before a FLOW widens the window
    pub incoming_window: u32,

    /// Transfers this end may send before the peer widens the window
    pub outgoing_window: u32,

    /// Highest number of links attached at once, announced as handle-max + 1
    pub max_link_count: u32,

    /// Session properties sent in BEGIN
    pub properties: Option<Fields>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            incoming_window: DEFAULT_WINDOW,
            outgoing_window: DEFAULT_WINDOW,
            max_link_count: DEFAULT_MAX_LINK_COUNT,
            properties: None,
        }
    }
}

/// Events raised by a [`Session`]
pub trait SessionEvents: Send + Sync {
    /// Called when the peer attaches a link that no local link is waiting for
    ///
    /// `attach` carries the name, role, source, target and properties proposed by
    /// the peer. Return `true` after binding a sender or receiver to `endpoint`,
    /// otherwise the link is rejected with `amqp:not-allowed`.
    fn on_link_attached(&self, _session: &Session, _endpoint: LinkEndpoint, _attach: &Attach) -> bool {
        false
    }
}

/// A session begun by the peer
///
/// Handed to [`crate::ConnectionEvents::on_new_endpoint`] and consumed by
/// [`Session::from_endpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEndpoint {
    pub(crate) key: usize,
}

impl SessionEndpoint {
    /// The local channel reserved for the session
    pub fn channel(&self) -> u16 {
        self.key as u16
    }
}

#[derive(Debug)]
pub(crate) struct SessionShared {
    core: Weak<ConnectionCore>,
    key: usize,
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            let key = self.key;
            core.with_engine(|engine| engine.release_session(key));
        }
    }
}

/// An AMQP1.0 session
///
/// Clones share the same session. Senders and receivers keep their session alive.
/// The session is ended once the last handle is dropped.
#[derive(Debug, Clone)]
pub struct Session {
    pub(crate) shared: Arc<SessionShared>,
}

impl Session {
    /// Reserves a channel on `connection`. Nothing is sent until
    /// [`begin`](Self::begin) is called.
    pub fn new(
        connection: &Connection,
        options: SessionOptions,
        events: Option<Arc<dyn SessionEvents>>,
    ) -> Result<Self, Error> {
        let core = connection.downgrade();
        let shared = connection.core.with_engine(|engine| {
            let mut shared = None;
            engine.allocate_session(options, events, |key| {
                let new = Arc::new(SessionShared { core, key });
                let weak = Arc::downgrade(&new);
                shared = Some(new);
                weak
            })?;
            shared.ok_or(Error::ConnectionDropped)
        })?;
        Ok(Self { shared })
    }

    /// Binds a session to one begun by the peer. Call [`begin`](Self::begin) to
    /// answer the peer's BEGIN.
    pub fn from_endpoint(
        connection: &Connection,
        endpoint: SessionEndpoint,
        options: SessionOptions,
        events: Option<Arc<dyn SessionEvents>>,
    ) -> Result<Self, Error> {
        let shared = Arc::new(SessionShared {
            core: connection.downgrade(),
            key: endpoint.key,
        });
        let weak = Arc::downgrade(&shared);
        let bound = connection
            .core
            .with_engine(|engine| engine.bind_session(endpoint.key, options, events, weak));
        match bound {
            Ok(()) => Ok(Self { shared }),
            Err(error) => {
                // Nothing was bound, dropping the handle must not release the slot
                let mut shared = shared;
                if let Some(shared) = Arc::get_mut(&mut shared) {
                    shared.core = Weak::new();
                }
                Err(error)
            }
        }
    }

    /// The connection the session lives on, `None` once it has been dropped
    pub fn connection(&self) -> Option<Connection> {
        self.core().map(Connection::from_core)
    }

    pub(crate) fn core(&self) -> Option<Arc<ConnectionCore>> {
        self.shared.core.upgrade()
    }

    pub(crate) fn key(&self) -> usize {
        self.shared.key
    }

    fn core_or_err(&self) -> Result<Arc<ConnectionCore>, Error> {
        self.core().ok_or(Error::ConnectionDropped)
    }

    /// Sends BEGIN, or answers the peer's BEGIN for a session created with
    /// [`from_endpoint`](Self::from_endpoint)
    ///
    /// The connection must be [`Opened`](crate::ConnectionState::Opened).
    pub fn begin(&self) -> Result<(), Error> {
        let key = self.key();
        self.core_or_err()?
            .with_engine(|engine| engine.begin_session(key))
    }

    /// Sends END
    pub fn end(&self) -> Result<(), Error> {
        let key = self.key();
        self.core_or_err()?
            .with_engine(|engine| engine.end_session(key, None))
    }

    /// Sends END carrying `error`
    pub fn end_with_error(&self, error: definitions::Error) -> Result<(), Error> {
        let key = self.key();
        self.core_or_err()?
            .with_engine(|engine| engine.end_session(key, Some(error)))
    }

    /// Changes the incoming window. Only allowed before the session is begun.
    pub fn set_incoming_window(&self, window: u32) -> Result<(), Error> {
        let key = self.key();
        self.core_or_err()?.with_engine(|engine| {
            engine.with_session(key, |session, _| session.set_incoming_window(window))
        })
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        let key = self.key();
        match self.core() {
            Some(core) => core
                .with_engine(|engine| engine.with_session(key, |session, _| Ok(session.state)))
                .unwrap_or(SessionState::Unmapped),
            None => SessionState::Unmapped,
        }
    }

    /// The error carried by the peer's END, if any
    pub fn remote_error(&self) -> Option<definitions::Error> {
        let key = self.key();
        self.core()?
            .with_engine(|engine| {
                engine.with_session(key, |session, _| Ok(session.remote_error.clone()))
            })
            .ok()
            .flatten()
    }

    /// The local channel of the session
    pub fn channel(&self) -> u16 {
        self.key() as u16
    }

    pub(crate) fn allocate_link(&self, config: LinkConfig, kind: LinkKind) -> Result<usize, Error> {
        let key = self.key();
        self.core_or_err()?
            .with_engine(|engine| engine.allocate_link(key, config, kind))
    }

    pub(crate) fn bind_link(
        &self,
        endpoint: LinkEndpoint,
        config: LinkConfig,
        kind: LinkKind,
    ) -> Result<(), Error> {
        if endpoint.session != self.key() {
            return Err(Error::EndpointNotAvailable);
        }
        self.core_or_err()?
            .with_engine(|engine| engine.bind_link(endpoint, config, kind))
    }
}
