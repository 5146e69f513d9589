//! Link endpoint state machine, driven by the owning session

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
};

use bytes::{Bytes, BytesMut};
use serde_bytes::ByteBuf;

use crate::{
    connection::{Notification, Outbox},
    definitions::{
        self, AmqpError, DeliveryNumber, DeliveryTag, Fields, Handle, ReceiverSettleMode, Role,
        SenderSettleMode,
    },
    frames::{
        amqp::{performative_size, FrameBody},
        FRAME_HEADER_SIZE,
    },
    messaging::{
        decode_message, Accepted, DeliveryState, Outcome, Rejected, Source, Target,
        TargetArchetype,
    },
    operation_queue::OperationQueue,
    performatives::{Attach, Detach, Disposition, Flow, Performative, Transfer},
    session::{self, engine::SessionFlow},
};

use super::{
    receiver::DEFAULT_LINK_CREDIT, Delivery, LinkConfig, LinkError, LinkListener, LinkState,
    MessageReceiverEvents, MessageSenderEvents, SendCallback, SendStatus,
};

pub(crate) type CompletionQueue = Arc<OperationQueue<Result<(), LinkError>>>;

struct PendingTransfer {
    id: u64,
    payload: Bytes,
    settled: bool,
    callback: SendCallback,
}

/// A delivery with its first frame written but not its last
struct OutgoingDelivery {
    delivery_id: DeliveryNumber,
    tag: DeliveryTag,
    settled: bool,
    remaining: Bytes,
    first_frame: bool,
    callback: SendCallback,
}

pub(crate) struct SenderState {
    listener: Option<Arc<dyn MessageSenderEvents>>,
    pending: VecDeque<PendingTransfer>,
    current: Option<OutgoingDelivery>,
    unsettled: BTreeMap<DeliveryNumber, SendCallback>,
    next_tag: u32,
    next_send_id: u64,
    drain: bool,
}

struct PartialDelivery {
    delivery_id: DeliveryNumber,
    tag: DeliveryTag,
    settled: bool,
    payload: BytesMut,
}

pub(crate) struct ReceiverState {
    listener: Option<Arc<dyn MessageReceiverEvents>>,
    credit: u32,
    messages: Arc<OperationQueue<Delivery>>,
    partial: Option<PartialDelivery>,
    awaiting_outcome: BTreeSet<DeliveryNumber>,
}

pub(crate) enum LinkKind {
    Sender(SenderState),
    Receiver(ReceiverState),
}

impl LinkKind {
    pub(crate) fn sender(listener: Option<Arc<dyn MessageSenderEvents>>) -> Self {
        LinkKind::Sender(SenderState {
            listener,
            pending: VecDeque::new(),
            current: None,
            unsettled: BTreeMap::new(),
            next_tag: 0,
            next_send_id: 0,
            drain: false,
        })
    }

    pub(crate) fn receiver(credit: u32, listener: Option<Arc<dyn MessageReceiverEvents>>) -> Self {
        LinkKind::Receiver(ReceiverState {
            listener,
            credit,
            messages: Arc::new(OperationQueue::new()),
            partial: None,
            awaiting_outcome: BTreeSet::new(),
        })
    }

    pub(crate) fn role(&self) -> Role {
        match self {
            LinkKind::Sender(_) => Role::Sender,
            LinkKind::Receiver(_) => Role::Receiver,
        }
    }

    fn listener(&self) -> Option<LinkListener> {
        match self {
            LinkKind::Sender(s) => s.listener.clone().map(LinkListener::Sender),
            LinkKind::Receiver(r) => r.listener.clone().map(LinkListener::Receiver),
        }
    }
}

/// Whether `id` lies in the wrapping range `first..=last`
pub(crate) fn in_range(first: DeliveryNumber, last: DeliveryNumber, id: DeliveryNumber) -> bool {
    id.wrapping_sub(first) <= last.wrapping_sub(first)
}

pub(crate) struct LinkEngine {
    pub(crate) name: String,
    pub(crate) handle: u32,
    pub(crate) remote_handle: Option<u32>,
    pub(crate) state: LinkState,

    /// Owned by a local handle
    pub(crate) bound: bool,

    /// The local handle is gone, remove once detached
    pub(crate) released: bool,

    pub(crate) source: Option<Source>,
    pub(crate) target: Option<Target>,
    snd_settle_mode: SenderSettleMode,
    rcv_settle_mode: ReceiverSettleMode,
    max_message_size: Option<u64>,
    pub(crate) remote_max_message_size: Option<u64>,
    initial_delivery_count: u32,
    properties: Option<Fields>,
    enable_trace: bool,

    delivery_count: u32,
    link_credit: u32,
    pub(crate) remote_error: Option<definitions::Error>,
    closing: bool,
    refused: bool,

    kind: LinkKind,
    open_queue: CompletionQueue,
    close_queue: CompletionQueue,
}

impl LinkEngine {
    pub(crate) fn new(handle: u32, config: LinkConfig, kind: LinkKind) -> Self {
        Self {
            name: config.name,
            handle,
            remote_handle: None,
            state: LinkState::Idle,
            bound: true,
            released: false,
            source: config.source,
            target: config.target,
            snd_settle_mode: config.snd_settle_mode,
            rcv_settle_mode: config.rcv_settle_mode,
            max_message_size: config.max_message_size,
            remote_max_message_size: None,
            initial_delivery_count: config.initial_delivery_count,
            properties: config.properties,
            enable_trace: config.enable_trace,
            delivery_count: config.initial_delivery_count,
            link_credit: 0,
            remote_error: None,
            closing: false,
            refused: false,
            kind,
            open_queue: Arc::new(OperationQueue::new()),
            close_queue: Arc::new(OperationQueue::new()),
        }
    }

    /// A link endpoint answering an ATTACH the peer sent first
    pub(crate) fn offered(handle: u32, attach: &Attach) -> Self {
        let kind = match attach.role {
            Role::Sender => LinkKind::receiver(DEFAULT_LINK_CREDIT, None),
            Role::Receiver => LinkKind::sender(None),
        };
        let config = LinkConfig {
            name: attach.name.clone(),
            source: attach.source.as_deref().cloned(),
            target: attach
                .target
                .as_deref()
                .cloned()
                .and_then(|target| Target::try_from(target).ok()),
            snd_settle_mode: attach.snd_settle_mode.clone(),
            rcv_settle_mode: attach.rcv_settle_mode.clone(),
            max_message_size: None,
            initial_delivery_count: 0,
            properties: None,
            enable_trace: false,
        };
        let mut link = Self::new(handle, config, kind);
        link.bound = false;
        link.remote_handle = Some(attach.handle.0);
        link.apply_remote_attach(attach);
        link
    }

    pub(crate) fn role(&self) -> Role {
        self.kind.role()
    }

    /// Whether an ATTACH or DETACH exchange is still outstanding
    pub(crate) fn is_attached(&self) -> bool {
        matches!(
            self.state,
            LinkState::Opening | LinkState::Open | LinkState::Closing
        )
    }

    /// Binds a local handle to an offered endpoint
    pub(crate) fn bind(&mut self, config: LinkConfig, kind: LinkKind) -> Result<(), session::Error> {
        if self.bound || self.released || self.role() != kind.role() {
            return Err(session::Error::EndpointNotAvailable);
        }
        // A dynamic terminus requested by the peer gets the address of the local one
        match kind {
            LinkKind::Sender(_) => {
                self.initial_delivery_count = config.initial_delivery_count;
                self.delivery_count = config.initial_delivery_count;
                if let Some(source) = self.source.as_mut().filter(|s| s.dynamic && s.address.is_none()) {
                    source.address = config.source.and_then(|s| s.address);
                }
            }
            LinkKind::Receiver(_) => {
                if let Some(target) = self.target.as_mut().filter(|t| t.dynamic && t.address.is_none()) {
                    target.address = config.target.and_then(|t| t.address);
                }
            }
        }
        self.max_message_size = config.max_message_size;
        self.properties = config.properties;
        self.enable_trace = config.enable_trace;
        self.kind = kind;
        self.bound = true;
        Ok(())
    }

    pub(crate) fn incoming_messages(&self) -> Result<Arc<OperationQueue<Delivery>>, LinkError> {
        match &self.kind {
            LinkKind::Receiver(receiver) => Ok(receiver.messages.clone()),
            LinkKind::Sender(_) => Err(LinkError::IllegalState(self.state)),
        }
    }

    pub(crate) fn set_state(&mut self, new_state: LinkState, out: &mut Outbox) {
        let old_state = std::mem::replace(&mut self.state, new_state);
        if old_state == new_state {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(link = %self.name, ?old_state, ?new_state, "link state changed");
        #[cfg(feature = "log")]
        log::debug!("link {} state {:?} -> {:?}", self.name, old_state, new_state);
        if let Some(listener) = self.kind.listener() {
            out.notify(Notification::LinkStateChanged {
                listener,
                new_state,
                old_state,
            });
        }
    }

    fn attach_frame(&self) -> Attach {
        let initial_delivery_count = match self.kind {
            LinkKind::Sender(_) => Some(self.initial_delivery_count),
            LinkKind::Receiver(_) => None,
        };
        Attach {
            name: self.name.clone(),
            handle: Handle(self.handle),
            role: self.role(),
            snd_settle_mode: self.snd_settle_mode.clone(),
            rcv_settle_mode: self.rcv_settle_mode.clone(),
            source: self.source.clone().map(Box::new),
            target: self
                .target
                .clone()
                .map(|target| Box::new(TargetArchetype::from(target))),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count,
            max_message_size: self.max_message_size,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: self.properties.clone(),
        }
    }

    fn flow_frame(&self, flow: &SessionFlow) -> Flow {
        let mut frame = flow.flow();
        frame.handle = Some(Handle(self.handle));
        frame.delivery_count = Some(self.delivery_count);
        frame.link_credit = Some(self.link_credit);
        if let LinkKind::Sender(sender) = &self.kind {
            let in_progress = u32::from(sender.current.is_some());
            frame.available = Some(sender.pending.len() as u32 + in_progress);
            frame.drain = sender.drain;
        }
        frame
    }

    fn apply_remote_attach(&mut self, attach: &Attach) {
        self.remote_max_message_size = attach.max_message_size.filter(|max| *max > 0);
        if let LinkKind::Receiver(_) = self.kind {
            self.delivery_count = attach.initial_delivery_count.unwrap_or(0);
        }
    }

    /// Sends ATTACH, or answers the peer's ATTACH on an offered endpoint
    pub(crate) fn attach(
        &mut self,
        flow: &mut SessionFlow,
        out: &mut Outbox,
    ) -> Result<CompletionQueue, LinkError> {
        if self.released || self.state != LinkState::Idle {
            return Err(LinkError::IllegalState(self.state));
        }
        self.open_queue.clear();
        self.remote_error = None;
        self.closing = false;
        self.refused = false;
        self.link_credit = 0;
        if let LinkKind::Sender(_) = self.kind {
            self.delivery_count = self.initial_delivery_count;
        }

        out.send(flow.channel, FrameBody::Attach(self.attach_frame()));
        if self.remote_handle.is_some() {
            self.set_state(LinkState::Open, out);
            self.on_opened(flow, out);
        } else {
            self.set_state(LinkState::Opening, out);
        }
        Ok(self.open_queue.clone())
    }

    fn on_opened(&mut self, flow: &mut SessionFlow, out: &mut Outbox) {
        self.open_queue.complete_operation(Ok(()));
        if let LinkKind::Receiver(receiver) = &self.kind {
            self.link_credit = receiver.credit;
            out.send(flow.channel, FrameBody::Flow(self.flow_frame(flow)));
        }
    }

    /// The peer's ATTACH answering ours
    pub(crate) fn on_attach(&mut self, attach: Attach, flow: &mut SessionFlow, out: &mut Outbox) {
        self.remote_handle = Some(attach.handle.0);
        self.apply_remote_attach(&attach);
        if self.state != LinkState::Opening {
            return;
        }

        let refused = match self.kind {
            LinkKind::Sender(_) => attach.target.is_none(),
            LinkKind::Receiver(_) => attach.source.is_none(),
        };
        if refused {
            // A DETACH with the reason follows
            self.refused = true;
            return;
        }

        match self.kind {
            LinkKind::Sender(_) if self.target.as_ref().map_or(false, |t| t.dynamic) => {
                self.target = attach
                    .target
                    .and_then(|target| Target::try_from(*target).ok());
            }
            LinkKind::Receiver(_) if self.source.as_ref().map_or(false, |s| s.dynamic) => {
                self.source = attach.source.map(|source| *source);
            }
            _ => {}
        }
        self.set_state(LinkState::Open, out);
        self.on_opened(flow, out);
    }

    /// Sends DETACH
    pub(crate) fn detach(
        &mut self,
        error: Option<definitions::Error>,
        flow: &mut SessionFlow,
        out: &mut Outbox,
    ) -> Result<CompletionQueue, LinkError> {
        match self.state {
            LinkState::Open | LinkState::Opening => {}
            state => return Err(LinkError::IllegalState(state)),
        }
        self.close_queue.clear();
        if self.state == LinkState::Opening {
            self.open_queue.complete_operation(Err(LinkError::Cancelled));
        }
        out.send(
            flow.channel,
            FrameBody::Detach(Detach {
                handle: Handle(self.handle),
                closed: true,
                error,
            }),
        );
        self.closing = true;
        self.fail_transfers(flow, out);
        self.set_state(LinkState::Closing, out);
        Ok(self.close_queue.clone())
    }

    /// Answers an offered endpoint nobody wants: an ATTACH without terminus, then a
    /// closing DETACH
    pub(crate) fn reject(&mut self, flow: &mut SessionFlow, out: &mut Outbox) {
        let mut attach = self.attach_frame();
        attach.source = None;
        attach.target = None;
        out.send(flow.channel, FrameBody::Attach(attach));
        out.send(
            flow.channel,
            FrameBody::Detach(Detach {
                handle: Handle(self.handle),
                closed: true,
                error: Some(definitions::Error::new(
                    AmqpError::NotAllowed,
                    Some(String::from("link endpoint rejected")),
                    None,
                )),
            }),
        );
        self.released = true;
        self.closing = true;
        self.state = LinkState::Closing;
    }

    pub(crate) fn on_detach(&mut self, detach: Detach, flow: &mut SessionFlow, out: &mut Outbox) {
        self.remote_handle = None;
        if self.closing {
            self.closing = false;
            self.close_queue.complete_operation(Ok(()));
            self.set_state(LinkState::Idle, out);
            return;
        }

        let old_state = self.state;
        if matches!(old_state, LinkState::Open | LinkState::Opening) {
            out.send(
                flow.channel,
                FrameBody::Detach(Detach {
                    handle: Handle(self.handle),
                    closed: true,
                    error: None,
                }),
            );
        }

        let error = detach.error;
        #[cfg(feature = "tracing")]
        tracing::debug!(link = %self.name, ?error, "link detached by peer");
        #[cfg(feature = "log")]
        log::debug!("link {} detached by peer {:?}", self.name, error);

        if old_state == LinkState::Opening {
            let result = match &error {
                Some(error) => LinkError::Remote(error.clone()),
                None => LinkError::Detached,
            };
            self.open_queue.complete_operation(Err(result));
        }
        self.remote_error = error.clone();
        self.fail_transfers(flow, out);
        if let Some(listener) = self.kind.listener() {
            out.notify(Notification::LinkDetached {
                listener,
                error: error.clone(),
            });
        }
        let new_state = match (old_state, error) {
            (LinkState::Idle, _) => LinkState::Idle,
            (_, Some(_)) => LinkState::Error,
            (_, None) => LinkState::Idle,
        };
        self.set_state(new_state, out);
    }

    /// The owning session ended, or its connection closed
    pub(crate) fn on_session_ended(
        &mut self,
        error: Option<definitions::Error>,
        flow: &mut SessionFlow,
        out: &mut Outbox,
    ) {
        self.remote_handle = None;
        if !self.is_attached() {
            return;
        }
        if self.closing {
            self.closing = false;
            self.close_queue.complete_operation(Ok(()));
        }
        if self.state == LinkState::Opening {
            let result = match &error {
                Some(error) => LinkError::Remote(error.clone()),
                None => LinkError::SessionNotMapped,
            };
            self.open_queue.complete_operation(Err(result));
        }
        self.fail_transfers(flow, out);

        let new_state = match (self.state, &error) {
            (LinkState::Closing, _) => LinkState::Idle,
            (_, Some(_)) => LinkState::Error,
            (_, None) => LinkState::Idle,
        };
        if new_state == LinkState::Error {
            self.remote_error = error.clone();
            if let Some(listener) = self.kind.listener() {
                out.notify(Notification::LinkDetached { listener, error });
            }
        }
        self.set_state(new_state, out);
    }

    /// Marks the link as released by its handle. Returns `true` if it can be
    /// removed right away.
    pub(crate) fn release(&mut self, flow: &mut SessionFlow, out: &mut Outbox) -> bool {
        self.released = true;
        match self.state {
            LinkState::Open | LinkState::Opening => {
                let _ = self.detach(None, flow, out);
                false
            }
            LinkState::Closing => false,
            _ => true,
        }
    }

    fn fail_transfers(&mut self, flow: &mut SessionFlow, out: &mut Outbox) {
        match &mut self.kind {
            LinkKind::Sender(sender) => {
                let current = sender.current.take().map(|delivery| delivery.callback);
                let pending = sender.pending.drain(..).map(|transfer| transfer.callback);
                for callback in current.into_iter().chain(pending) {
                    out.notify(Notification::SendComplete {
                        callback,
                        status: SendStatus::Error,
                        state: None,
                    });
                }
                let unsettled = std::mem::take(&mut sender.unsettled);
                for (delivery_id, callback) in unsettled {
                    flow.outgoing_deliveries.remove(&delivery_id);
                    out.notify(Notification::SendComplete {
                        callback,
                        status: SendStatus::Error,
                        state: None,
                    });
                }
                sender.drain = false;
            }
            LinkKind::Receiver(receiver) => {
                receiver.partial = None;
                for delivery_id in std::mem::take(&mut receiver.awaiting_outcome) {
                    flow.incoming_deliveries.remove(&delivery_id);
                }
            }
        }
        self.link_credit = 0;
    }

    /* ---------------------------------- sender ---------------------------------- */

    pub(crate) fn enqueue(&mut self, payload: Bytes, callback: SendCallback) -> Result<u64, LinkError> {
        if self.state != LinkState::Open {
            return Err(LinkError::IllegalState(self.state));
        }
        if let Some(max) = self.remote_max_message_size {
            let size = payload.len() as u64;
            if size > max {
                return Err(LinkError::MessageSizeExceeded { size, max });
            }
        }
        let settled = self.snd_settle_mode == SenderSettleMode::Settled;
        let LinkKind::Sender(sender) = &mut self.kind else {
            return Err(LinkError::IllegalState(self.state));
        };
        let id = sender.next_send_id;
        sender.next_send_id += 1;
        sender.pending.push_back(PendingTransfer {
            id,
            payload,
            settled,
            callback,
        });
        Ok(id)
    }

    /// Withdraws a message that has not been written out yet
    pub(crate) fn cancel_send(&mut self, id: u64, out: &mut Outbox) {
        if let LinkKind::Sender(sender) = &mut self.kind {
            if let Some(index) = sender.pending.iter().position(|t| t.id == id) {
                if let Some(transfer) = sender.pending.remove(index) {
                    out.discard(transfer.callback);
                }
            }
        }
    }

    /// Writes queued messages while both link credit and session window allow
    ///
    /// A message takes one unit of link credit and one delivery-id. Every frame it
    /// is split into takes one transfer-id and one slot of the peer's incoming
    /// window.
    pub(crate) fn pump(&mut self, key: usize, flow: &mut SessionFlow, out: &mut Outbox) {
        if self.state != LinkState::Open {
            return;
        }
        let LinkKind::Sender(sender) = &mut self.kind else {
            return;
        };

        while flow.remote_incoming_window > 0 {
            if sender.current.is_none() {
                if self.link_credit == 0 {
                    break;
                }
                let Some(transfer) = sender.pending.pop_front() else {
                    break;
                };
                let delivery_id = flow.next_delivery_id;
                flow.next_delivery_id = delivery_id.wrapping_add(1);
                let tag = ByteBuf::from(sender.next_tag.to_be_bytes().to_vec());
                sender.next_tag = sender.next_tag.wrapping_add(1);
                self.delivery_count = self.delivery_count.wrapping_add(1);
                self.link_credit -= 1;

                if self.enable_trace {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(link = %self.name, delivery_id, size = transfer.payload.len(), "transfer");
                    #[cfg(feature = "log")]
                    log::trace!("link {} transfer {} ({} bytes)", self.name, delivery_id, transfer.payload.len());
                }

                sender.current = Some(OutgoingDelivery {
                    delivery_id,
                    tag,
                    settled: transfer.settled,
                    remaining: transfer.payload,
                    first_frame: true,
                    callback: transfer.callback,
                });
            }
            let Some(current) = sender.current.as_mut() else {
                break;
            };

            // Only the first frame carries the delivery fields
            let mut performative = Transfer {
                handle: Handle(self.handle),
                delivery_id: None,
                delivery_tag: None,
                message_format: None,
                settled: None,
                more: true,
                rcv_settle_mode: None,
                state: None,
                resume: false,
                aborted: false,
                batchable: false,
            };
            if current.first_frame {
                performative.delivery_id = Some(current.delivery_id);
                performative.delivery_tag = Some(current.tag.clone());
                performative.message_format = Some(0);
                performative.settled = Some(current.settled);
            }

            let overhead = match performative_size(&Performative::Transfer(performative.clone())) {
                Ok(size) => FRAME_HEADER_SIZE + size,
                Err(_error) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(link = %self.name, error = ?_error, "failed to encode transfer");
                    #[cfg(feature = "log")]
                    log::error!("link {} failed to encode transfer: {:?}", self.name, _error);
                    if let Some(failed) = sender.current.take() {
                        out.notify(Notification::SendComplete {
                            callback: failed.callback,
                            status: SendStatus::Error,
                            state: None,
                        });
                    }
                    continue;
                }
            };
            let chunk = flow.max_frame_size.saturating_sub(overhead).max(1);
            let payload = current
                .remaining
                .split_to(chunk.min(current.remaining.len()));
            let more = !current.remaining.is_empty();
            performative.more = more;
            current.first_frame = false;

            out.send(
                flow.channel,
                FrameBody::Transfer {
                    performative,
                    payload,
                },
            );
            flow.next_outgoing_id = flow.next_outgoing_id.wrapping_add(1);
            flow.remote_incoming_window -= 1;
            if more {
                continue;
            }

            let Some(delivery) = sender.current.take() else {
                break;
            };
            if delivery.settled {
                out.notify(Notification::SendComplete {
                    callback: delivery.callback,
                    status: SendStatus::Ok,
                    state: None,
                });
            } else {
                sender.unsettled.insert(delivery.delivery_id, delivery.callback);
                flow.outgoing_deliveries.insert(delivery.delivery_id, key);
            }
        }

        let drained = sender.drain
            && sender.pending.is_empty()
            && sender.current.is_none()
            && self.link_credit > 0;
        if drained {
            sender.drain = false;
            self.delivery_count = self.delivery_count.wrapping_add(self.link_credit);
            self.link_credit = 0;
            out.send(flow.channel, FrameBody::Flow(self.flow_frame(flow)));
        }
    }

    pub(crate) fn on_flow(&mut self, frame: &Flow, flow: &mut SessionFlow, out: &mut Outbox) {
        match &mut self.kind {
            LinkKind::Sender(sender) => {
                let delivery_count = frame.delivery_count.unwrap_or(self.initial_delivery_count);
                let credit = frame.link_credit.unwrap_or(0);
                self.link_credit = delivery_count
                    .wrapping_add(credit)
                    .wrapping_sub(self.delivery_count);
                sender.drain = frame.drain;
            }
            LinkKind::Receiver(_) => {
                // A draining sender advances delivery-count over the unused credit
                if let Some(delivery_count) = frame.delivery_count {
                    let advanced = delivery_count.wrapping_sub(self.delivery_count);
                    self.link_credit = self.link_credit.saturating_sub(advanced);
                    self.delivery_count = delivery_count;
                }
            }
        }
        if frame.echo {
            out.send(flow.channel, FrameBody::Flow(self.flow_frame(flow)));
        }
    }

    /// The peer's disposition of one of our deliveries
    pub(crate) fn on_outgoing_disposition(
        &mut self,
        delivery_id: DeliveryNumber,
        settled: bool,
        state: Option<DeliveryState>,
        flow: &mut SessionFlow,
        out: &mut Outbox,
    ) {
        let LinkKind::Sender(sender) = &mut self.kind else {
            return;
        };
        let terminal = state.as_ref().map_or(settled, DeliveryState::is_terminal);
        if !terminal {
            return;
        }
        let Some(callback) = sender.unsettled.remove(&delivery_id) else {
            return;
        };
        flow.outgoing_deliveries.remove(&delivery_id);
        if !settled {
            out.send(
                flow.channel,
                FrameBody::Disposition(Disposition {
                    role: Role::Sender,
                    first: delivery_id,
                    last: None,
                    settled: true,
                    state: state.clone(),
                    batchable: false,
                }),
            );
        }
        let status = match &state {
            None | Some(DeliveryState::Accepted(_)) => SendStatus::Ok,
            Some(_) => SendStatus::Error,
        };
        out.notify(Notification::SendComplete {
            callback,
            status,
            state,
        });
    }

    /* --------------------------------- receiver --------------------------------- */

    pub(crate) fn on_transfer(
        &mut self,
        key: usize,
        transfer: Transfer,
        payload: Bytes,
        flow: &mut SessionFlow,
        out: &mut Outbox,
    ) {
        if self.state != LinkState::Open {
            return;
        }
        let LinkKind::Receiver(receiver) = &mut self.kind else {
            return;
        };

        if receiver.partial.is_none() {
            let Some(delivery_id) = transfer.delivery_id else {
                return;
            };
            receiver.partial = Some(PartialDelivery {
                delivery_id,
                tag: transfer.delivery_tag.clone().unwrap_or_default(),
                settled: false,
                payload: BytesMut::new(),
            });
        }
        let Some(partial) = receiver.partial.as_mut() else {
            return;
        };
        if transfer.settled == Some(true) {
            partial.settled = true;
        }
        partial.payload.extend_from_slice(&payload);
        if !transfer.aborted && transfer.more {
            return;
        }

        let Some(partial) = receiver.partial.take() else {
            return;
        };
        self.delivery_count = self.delivery_count.wrapping_add(1);
        self.link_credit = self.link_credit.saturating_sub(1);

        let delivery_id = partial.delivery_id;
        let mut settle_now = None;
        if !transfer.aborted {
            match decode_message(&partial.payload) {
                Ok(message) => {
                    let delivery = Delivery {
                        delivery_id,
                        delivery_tag: partial.tag,
                        message,
                    };
                    if self.enable_trace {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(link = %self.name, delivery_id, "message received");
                        #[cfg(feature = "log")]
                        log::trace!("link {} received delivery {}", self.name, delivery_id);
                    }
                    if !partial.settled {
                        flow.incoming_deliveries.insert(delivery_id, key);
                    }
                    match &receiver.listener {
                        Some(listener) => {
                            receiver.awaiting_outcome.insert(delivery_id);
                            out.notify(Notification::MessageReceived {
                                listener: listener.clone(),
                                session: flow.session_key,
                                link: key,
                                delivery,
                            });
                        }
                        None => {
                            receiver.messages.complete_operation(delivery);
                            if !partial.settled {
                                settle_now = Some(Outcome::Accepted(Accepted {}));
                            }
                        }
                    }
                }
                Err(_error) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(link = %self.name, delivery_id, error = ?_error, "failed to decode message");
                    #[cfg(feature = "log")]
                    log::error!("link {} failed to decode delivery {}: {:?}", self.name, delivery_id, _error);
                    if !partial.settled {
                        flow.incoming_deliveries.insert(delivery_id, key);
                        settle_now = Some(Outcome::Rejected(Rejected {
                            error: Some(definitions::Error::new(
                                AmqpError::DecodeError,
                                Some(String::from("malformed message")),
                                None,
                            )),
                        }));
                    }
                }
            }
        }

        if let Some(outcome) = settle_now {
            self.settle_incoming(delivery_id, outcome, flow, out);
        }
        self.replenish_credit(flow, out);
    }

    /// Applies the outcome chosen by the message callback
    pub(crate) fn complete_delivery(
        &mut self,
        delivery_id: DeliveryNumber,
        outcome: Outcome,
        flow: &mut SessionFlow,
        out: &mut Outbox,
    ) {
        let LinkKind::Receiver(receiver) = &mut self.kind else {
            return;
        };
        if !receiver.awaiting_outcome.remove(&delivery_id) {
            return;
        }
        if flow.incoming_deliveries.contains_key(&delivery_id) {
            self.settle_incoming(delivery_id, outcome, flow, out);
        }
    }

    fn settle_incoming(
        &mut self,
        delivery_id: DeliveryNumber,
        outcome: Outcome,
        flow: &mut SessionFlow,
        out: &mut Outbox,
    ) {
        let settled = match self.rcv_settle_mode {
            ReceiverSettleMode::First => {
                flow.incoming_deliveries.remove(&delivery_id);
                true
            }
            // The sender settles, then the delivery is forgotten
            ReceiverSettleMode::Second => false,
        };
        out.send(
            flow.channel,
            FrameBody::Disposition(Disposition {
                role: Role::Receiver,
                first: delivery_id,
                last: None,
                settled,
                state: Some(outcome.into()),
                batchable: false,
            }),
        );
    }

    fn replenish_credit(&mut self, flow: &SessionFlow, out: &mut Outbox) {
        let LinkKind::Receiver(receiver) = &self.kind else {
            return;
        };
        let credit = receiver.credit;
        if self.link_credit <= credit / 2 {
            self.link_credit = credit;
            out.send(flow.channel, FrameBody::Flow(self.flow_frame(flow)));
        }
    }
}
