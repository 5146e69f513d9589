//! Links: unidirectional message transfer endpoints attached to a session

use std::sync::Arc;

use crate::{
    connection::{Connection, ConnectionCore},
    context::{Context, Done},
    definitions::{self, Fields, ReceiverSettleMode, SenderSettleMode},
    messaging::{Source, Target},
    operation_queue::OperationQueue,
    session::Session,
};

mod delivery;
pub(crate) mod engine;
mod error;
pub mod receiver;
pub mod sender;

pub use delivery::Delivery;
pub use error::LinkError;
pub use receiver::{MessageReceiver, MessageReceiverEvents, MessageReceiverOptions};
pub use sender::{MessageSender, MessageSenderEvents, MessageSenderOptions, SendCallback, SendStatus};

/// State of a [`MessageSender`] or [`MessageReceiver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// The link endpoint no longer exists
    Invalid,

    /// Not attached
    Idle,

    /// ATTACH sent, waiting for the peer's ATTACH
    Opening,

    /// Attached in both directions
    Open,

    /// DETACH sent, waiting for the peer's DETACH
    Closing,

    /// Detached because of an error
    Error,
}

/// State of a [`MessageSender`]
pub type MessageSenderState = LinkState;

/// State of a [`MessageReceiver`]
pub type MessageReceiverState = LinkState;

/// A link endpoint offered by the peer
///
/// Handed to [`crate::SessionEvents::on_link_attached`] and consumed by
/// [`MessageSender::from_endpoint`] or [`MessageReceiver::from_endpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkEndpoint {
    pub(crate) session: usize,
    pub(crate) link: usize,
}

impl LinkEndpoint {
    /// The local handle reserved for the link
    pub fn handle(&self) -> u32 {
        self.link as u32
    }
}

#[derive(Clone)]
pub(crate) enum LinkListener {
    Sender(Arc<dyn MessageSenderEvents>),
    Receiver(Arc<dyn MessageReceiverEvents>),
}

impl LinkListener {
    pub(crate) fn on_state_changed(&self, new_state: LinkState, old_state: LinkState) {
        match self {
            LinkListener::Sender(l) => l.on_state_changed(new_state, old_state),
            LinkListener::Receiver(l) => l.on_state_changed(new_state, old_state),
        }
    }

    pub(crate) fn on_detached(&self, error: Option<&definitions::Error>) {
        match self {
            LinkListener::Sender(l) => l.on_detached(error),
            LinkListener::Receiver(l) => l.on_detached(error),
        }
    }
}

/// Attach parameters chosen by the local side
#[derive(Debug, Clone)]
pub(crate) struct LinkConfig {
    pub(crate) name: String,
    pub(crate) source: Option<Source>,
    pub(crate) target: Option<Target>,
    pub(crate) snd_settle_mode: SenderSettleMode,
    pub(crate) rcv_settle_mode: ReceiverSettleMode,
    pub(crate) max_message_size: Option<u64>,
    pub(crate) initial_delivery_count: u32,
    pub(crate) properties: Option<Fields>,
    pub(crate) enable_trace: bool,
}

/// The part of a link handle shared by senders and receivers
///
/// Dropping the last clone detaches the link and frees its handle.
#[derive(Debug)]
pub(crate) struct LinkShared {
    pub(crate) session: Session,
    pub(crate) key: usize,
}

impl LinkShared {
    pub(crate) fn core(&self) -> Result<Arc<ConnectionCore>, LinkError> {
        self.session.core().ok_or(LinkError::ConnectionDropped)
    }

    pub(crate) fn with_link<R>(
        &self,
        f: impl FnOnce(&mut engine::LinkEngine, &mut crate::session::engine::SessionFlow, &mut crate::connection::Outbox) -> Result<R, LinkError>,
    ) -> Result<R, LinkError> {
        let core = self.core()?;
        let session = self.session.key();
        let key = self.key;
        core.with_engine(|engine| engine.with_link(session, key, f))
    }

    pub(crate) fn state(&self) -> LinkState {
        self.with_link(|link, _, _| Ok(link.state))
            .unwrap_or(LinkState::Invalid)
    }

    pub(crate) fn remote_error(&self) -> Option<definitions::Error> {
        self.with_link(|link, _, _| Ok(link.remote_error.clone()))
            .ok()
            .flatten()
    }

    pub(crate) fn attach(&self) -> Result<Arc<OperationQueue<Result<(), LinkError>>>, LinkError> {
        let core = self.core()?;
        let session = self.session.key();
        let key = self.key;
        core.with_engine(|engine| engine.attach_link(session, key))
    }

    pub(crate) fn detach(
        &self,
        error: Option<definitions::Error>,
    ) -> Result<Arc<OperationQueue<Result<(), LinkError>>>, LinkError> {
        self.with_link(|link, flow, out| link.detach(error, flow, out))
    }

    pub(crate) async fn wait(
        &self,
        queue: Arc<OperationQueue<Result<(), LinkError>>>,
        ctx: &Context,
    ) -> Result<(), LinkError> {
        let connection = Connection::from_core(self.core()?);
        match queue.wait_for_polled_result(ctx, &[&connection]).await {
            Some(result) => result,
            None => Err(ctx.done_reason().unwrap_or(Done::Cancelled).into()),
        }
    }
}

impl Drop for LinkShared {
    fn drop(&mut self) {
        if let Some(core) = self.session.core() {
            let session = self.session.key();
            let key = self.key;
            core.with_engine(|engine| engine.release_link(session, key));
        }
    }
}
