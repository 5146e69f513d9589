//! Implementation of AMQP1.0 sender

use std::sync::Arc;

use crate::{
    context::Context,
    definitions::{self, Fields, ReceiverSettleMode, SenderSettleMode},
    messaging::{encode_message, DeliveryState, Message, Source, Target},
    operation_queue::OperationQueue,
    session::{self, Session},
};

use super::{engine::LinkKind, LinkConfig, LinkEndpoint, LinkError, LinkShared, LinkState};

/// Result of a send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendStatus {
    /// The peer accepted the message, or the message was sent pre-settled
    Ok,

    /// The peer settled with a non-accepted outcome, or the link went away
    Error,

    /// The waiting context was cancelled or its deadline elapsed
    Cancelled,
}

/// Completion callback of [`MessageSender::send_async`]
pub type SendCallback = Box<dyn FnOnce(SendStatus, Option<DeliveryState>) + Send>;

/// Events raised by a [`MessageSender`]
///
/// Callbacks run on whichever task polls the connection, after the engine lock is
/// released.
pub trait MessageSenderEvents: Send + Sync {
    /// Called on every state transition
    fn on_state_changed(&self, _new_state: LinkState, _old_state: LinkState) {}

    /// Called when the peer detaches the link
    fn on_detached(&self, _error: Option<&definitions::Error>) {}
}

/// Options of a [`MessageSender`]
#[derive(Debug, Clone)]
pub struct MessageSenderOptions {
    /// Link name, a random name is generated when absent
    pub name: Option<String>,

    /// Address of the source terminus
    pub source_address: Option<String>,

    /// Sender settle mode, defaults to [`SenderSettleMode::Unsettled`]
    pub settle_mode: SenderSettleMode,

    /// Requested receiver settle mode
    pub receiver_settle_mode: ReceiverSettleMode,

    /// Largest message this end accepts
    pub max_message_size: Option<u64>,

    /// First delivery-count value
    pub initial_delivery_count: u32,

    /// Ask the peer to create a node and assign its address to the target
    pub dynamic_address: bool,

    /// Link properties
    pub properties: Option<Fields>,

    /// Trace every frame handled by the link
    pub enable_trace: bool,
}

impl Default for MessageSenderOptions {
    fn default() -> Self {
        Self {
            name: None,
            source_address: None,
            settle_mode: SenderSettleMode::Unsettled,
            receiver_settle_mode: ReceiverSettleMode::First,
            max_message_size: None,
            initial_delivery_count: 0,
            dynamic_address: false,
            properties: None,
            enable_trace: false,
        }
    }
}

impl MessageSenderOptions {
    pub(crate) fn into_config(self, target: Option<Target>) -> LinkConfig {
        let name = self
            .name
            .unwrap_or_else(|| format!("sender-{}", uuid::Uuid::new_v4()));
        let source = Source {
            address: Some(self.source_address.unwrap_or_else(|| name.clone())),
            ..Default::default()
        };
        let target = if self.dynamic_address {
            Some(Target::builder().dynamic(true).build())
        } else {
            target
        };
        LinkConfig {
            name,
            source: Some(source),
            target,
            snd_settle_mode: self.settle_mode,
            rcv_settle_mode: self.receiver_settle_mode,
            max_message_size: self.max_message_size,
            initial_delivery_count: self.initial_delivery_count,
            properties: self.properties,
            enable_trace: self.enable_trace,
        }
    }
}

/// An AMQP1.0 sender
///
/// Clones share the same link. The link is detached when the last clone is dropped.
///
/// # Example
///
/// ```rust,ignore
/// let sender = MessageSender::new(&session, "q1", MessageSenderOptions::default(), None)?;
/// sender.open(&Context::new()).await?;
/// let (status, _state) = sender.send(&Message::value("hello"), &Context::new()).await?;
/// sender.close(&Context::new()).await?;
/// ```
#[derive(Debug, Clone)]
pub struct MessageSender {
    link: Arc<LinkShared>,
}

impl MessageSender {
    /// Creates a sender targeting `target` on `session`. The link is not attached
    /// until [`attach`](Self::attach) or [`open`](Self::open) is called.
    pub fn new(
        session: &Session,
        target: impl Into<String>,
        options: MessageSenderOptions,
        events: Option<Arc<dyn MessageSenderEvents>>,
    ) -> Result<Self, session::Error> {
        let config = options.into_config(Some(Target::builder().address(target).build()));
        let key = session.allocate_link(config, LinkKind::sender(events))?;
        Ok(Self::from_parts(session, key))
    }

    /// Binds a sender to a link offered by the peer. Call [`attach`](Self::attach)
    /// to answer the peer's ATTACH.
    pub fn from_endpoint(
        session: &Session,
        endpoint: LinkEndpoint,
        options: MessageSenderOptions,
        events: Option<Arc<dyn MessageSenderEvents>>,
    ) -> Result<Self, session::Error> {
        let config = options.into_config(None);
        session.bind_link(endpoint, config, LinkKind::sender(events))?;
        Ok(Self::from_parts(session, endpoint.link))
    }

    fn from_parts(session: &Session, key: usize) -> Self {
        Self {
            link: Arc::new(LinkShared {
                session: session.clone(),
                key,
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    /// The error carried by the peer's DETACH, if any
    pub fn remote_error(&self) -> Option<definitions::Error> {
        self.link.remote_error()
    }

    /// Address of the target, including an address assigned by the peer for a
    /// dynamic target
    pub fn target_address(&self) -> Option<String> {
        self.link
            .with_link(|link, _, _| Ok(link.target.as_ref().and_then(|t| t.address.clone())))
            .ok()
            .flatten()
    }

    /// Largest message the peer accepts, `None` if unlimited
    pub fn max_message_size(&self) -> Option<u64> {
        self.link
            .with_link(|link, _, _| Ok(link.remote_max_message_size))
            .ok()
            .flatten()
    }

    /// Sends ATTACH without waiting for the peer's answer
    pub fn attach(&self) -> Result<(), LinkError> {
        self.link.attach().map(|_| ())
    }

    /// Attaches the link and waits until the peer answers
    pub async fn open(&self, ctx: &Context) -> Result<(), LinkError> {
        let queue = self.link.attach()?;
        self.link.wait(queue, ctx).await
    }

    /// Sends DETACH without waiting for the peer's answer
    pub fn detach(&self) -> Result<(), LinkError> {
        self.link.detach(None).map(|_| ())
    }

    /// Detaches the link and waits until the peer answers
    ///
    /// Closing a sender that is not attached fails with [`LinkError::IllegalState`].
    pub async fn close(&self, ctx: &Context) -> Result<(), LinkError> {
        let queue = self.link.detach(None)?;
        self.link.wait(queue, ctx).await
    }

    /// Detaches the link with an error and waits until the peer answers
    pub async fn close_with_error(
        &self,
        error: definitions::Error,
        ctx: &Context,
    ) -> Result<(), LinkError> {
        let queue = self.link.detach(Some(error))?;
        self.link.wait(queue, ctx).await
    }

    /// Queues a message. `callback` runs once the delivery is settled, or fails.
    ///
    /// Fails immediately when the link is not open or the message is larger than
    /// the peer's max-message-size.
    pub fn send_async(
        &self,
        message: &Message,
        callback: impl FnOnce(SendStatus, Option<DeliveryState>) + Send + 'static,
    ) -> Result<(), LinkError> {
        self.enqueue(message, Box::new(callback)).map(|_| ())
    }

    fn enqueue(&self, message: &Message, callback: SendCallback) -> Result<u64, LinkError> {
        let payload = encode_message(message)?;
        self.link
            .with_link(move |link, _, _| link.enqueue(payload, callback))
    }

    /// Sends a message and waits for its settlement
    ///
    /// A cancelled or expired `ctx` yields [`SendStatus::Cancelled`]. A message that
    /// has not been written out yet is then withdrawn.
    pub async fn send(
        &self,
        message: &Message,
        ctx: &Context,
    ) -> Result<(SendStatus, Option<DeliveryState>), LinkError> {
        let queue = Arc::new(OperationQueue::new());
        let completion = queue.clone();
        let id = self.enqueue(
            message,
            Box::new(move |status, state| completion.complete_operation((status, state))),
        )?;

        let connection = crate::Connection::from_core(self.link.core()?);
        match queue.wait_for_polled_result(ctx, &[&connection]).await {
            Some(result) => Ok(result),
            None => {
                let _ = self.link.with_link(|link, _, out| {
                    link.cancel_send(id, out);
                    Ok(())
                });
                Ok((SendStatus::Cancelled, None))
            }
        }
    }
}
