//! Implementation of AMQP1.0 receiver

use std::sync::Arc;

use crate::{
    context::Context,
    definitions::{self, Fields, ReceiverSettleMode, SenderSettleMode},
    messaging::{Accepted, Outcome, Source, Target},
    session::{self, Session},
};

use super::{engine::LinkKind, Delivery, LinkConfig, LinkEndpoint, LinkError, LinkShared, LinkState};

/// Default link credit granted by a receiver
pub const DEFAULT_LINK_CREDIT: u32 = 100;

/// Events raised by a [`MessageReceiver`]
///
/// When a receiver is created with events, every incoming message goes to
/// [`on_message_received`](Self::on_message_received) and is settled with the
/// returned outcome. Without events, messages are accepted and queued for
/// [`MessageReceiver::wait_for_incoming_message`].
pub trait MessageReceiverEvents: Send + Sync {
    /// Called for every complete incoming message
    fn on_message_received(&self, _delivery: &Delivery) -> Outcome {
        Outcome::Accepted(Accepted {})
    }

    /// Called on every state transition
    fn on_state_changed(&self, _new_state: LinkState, _old_state: LinkState) {}

    /// Called when the peer detaches the link
    fn on_detached(&self, _error: Option<&definitions::Error>) {}
}

/// Options of a [`MessageReceiver`]
#[derive(Debug, Clone)]
pub struct MessageReceiverOptions {
    /// Link name, a random name is generated when absent
    pub name: Option<String>,

    /// Address of the target terminus
    pub target_address: Option<String>,

    /// Receiver settle mode, defaults to [`ReceiverSettleMode::First`]
    pub settle_mode: ReceiverSettleMode,

    /// Requested sender settle mode
    pub sender_settle_mode: SenderSettleMode,

    /// Largest message this end accepts
    pub max_message_size: Option<u64>,

    /// Ask the peer to create a node and assign its address to the source
    pub dynamic_address: bool,

    /// Credit granted to the sender, replenished once half of it is used
    pub link_credit: u32,

    /// Link properties
    pub properties: Option<Fields>,

    /// Trace every frame handled by the link
    pub enable_trace: bool,
}

impl Default for MessageReceiverOptions {
    fn default() -> Self {
        Self {
            name: None,
            target_address: None,
            settle_mode: ReceiverSettleMode::First,
            sender_settle_mode: SenderSettleMode::Unsettled,
            max_message_size: None,
            dynamic_address: false,
            link_credit: DEFAULT_LINK_CREDIT,
            properties: None,
            enable_trace: false,
        }
    }
}

impl MessageReceiverOptions {
    pub(crate) fn into_config(self, source: Option<Source>) -> (LinkConfig, u32) {
        let name = self
            .name
            .unwrap_or_else(|| format!("receiver-{}", uuid::Uuid::new_v4()));
        let target = Target::builder()
            .address(self.target_address.unwrap_or_else(|| name.clone()))
            .build();
        let source = if self.dynamic_address {
            Some(Source::builder().dynamic(true).build())
        } else {
            source
        };
        let config = LinkConfig {
            name,
            source,
            target: Some(target),
            snd_settle_mode: self.sender_settle_mode,
            rcv_settle_mode: self.settle_mode,
            max_message_size: self.max_message_size,
            initial_delivery_count: 0,
            properties: self.properties,
            enable_trace: self.enable_trace,
        };
        (config, self.link_credit.max(1))
    }
}

/// An AMQP1.0 receiver
///
/// Clones share the same link. The link is detached when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct MessageReceiver {
    link: Arc<LinkShared>,
}

impl MessageReceiver {
    /// Creates a receiver sourcing from `source` on `session`. The link is not
    /// attached until [`attach`](Self::attach) or [`open`](Self::open) is called.
    pub fn new(
        session: &Session,
        source: impl Into<String>,
        options: MessageReceiverOptions,
        events: Option<Arc<dyn MessageReceiverEvents>>,
    ) -> Result<Self, session::Error> {
        let (config, credit) = options.into_config(Some(Source::builder().address(source).build()));
        let key = session.allocate_link(config, LinkKind::receiver(credit, events))?;
        Ok(Self::from_parts(session, key))
    }

    /// Binds a receiver to a link offered by the peer. Call [`attach`](Self::attach)
    /// to answer the peer's ATTACH.
    pub fn from_endpoint(
        session: &Session,
        endpoint: LinkEndpoint,
        options: MessageReceiverOptions,
        events: Option<Arc<dyn MessageReceiverEvents>>,
    ) -> Result<Self, session::Error> {
        let (config, credit) = options.into_config(None);
        session.bind_link(endpoint, config, LinkKind::receiver(credit, events))?;
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

    /// Address of the source, including an address assigned by the peer for a
    /// dynamic source
    pub fn source_address(&self) -> Option<String> {
        self.link
            .with_link(|link, _, _| Ok(link.source.as_ref().and_then(|s| s.address.clone())))
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
    /// Closing a receiver that is not attached fails with [`LinkError::IllegalState`].
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

    /// Waits for the next queued delivery
    ///
    /// Returns `None` when `ctx` is cancelled or expires, or when the receiver is
    /// gone.
    pub async fn wait_for_incoming_message(&self, ctx: &Context) -> Option<Delivery> {
        let queue = self
            .link
            .with_link(|link, _, _| link.incoming_messages())
            .ok()?;
        let connection = crate::Connection::from_core(self.link.core().ok()?);
        queue.wait_for_polled_result(ctx, &[&connection]).await
    }
}
