//! Session endpoint state machine, driven by the connection engine

use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use slab::Slab;

use crate::{
    connection::{Notification, Outbox},
    definitions::{
        self, AmqpError, DeliveryNumber, Handle, Role, SessionError, TransferNumber,
        MIN_MAX_FRAME_SIZE,
    },
    frames::amqp::FrameBody,
    link::{
        engine::{in_range, LinkEngine, LinkKind},
        LinkConfig, LinkEndpoint, LinkError,
    },
    messaging::Outcome,
    performatives::{Attach, Begin, Detach, Disposition, End, Flow, Transfer},
};

use super::{Error, SessionEvents, SessionOptions, SessionShared, SessionState};

/// Session level flow control and delivery bookkeeping
///
/// Handed to link operations alongside the link so that both can be updated in
/// one step.
#[derive(Debug)]
pub(crate) struct SessionFlow {
    pub(crate) channel: u16,
    pub(crate) session_key: usize,
    pub(crate) initial_incoming_window: u32,

    pub(crate) next_outgoing_id: TransferNumber,
    pub(crate) incoming_window: u32,
    pub(crate) outgoing_window: u32,
    pub(crate) next_incoming_id: Option<TransferNumber>,
    pub(crate) remote_incoming_window: u32,
    pub(crate) remote_outgoing_window: u32,

    pub(crate) next_delivery_id: DeliveryNumber,

    /// Largest frame the peer accepts, transfers are split to fit
    pub(crate) max_frame_size: usize,

    /// Unsettled outgoing deliveries and the key of their link
    pub(crate) outgoing_deliveries: BTreeMap<DeliveryNumber, usize>,

    /// Unsettled incoming deliveries and the key of their link
    pub(crate) incoming_deliveries: BTreeMap<DeliveryNumber, usize>,
}

impl SessionFlow {
    pub(crate) fn new(key: usize, options: &SessionOptions) -> Self {
        Self {
            channel: key as u16,
            session_key: key,
            initial_incoming_window: options.incoming_window,
            next_outgoing_id: 0,
            incoming_window: options.incoming_window,
            outgoing_window: options.outgoing_window,
            next_incoming_id: None,
            remote_incoming_window: 0,
            remote_outgoing_window: 0,
            next_delivery_id: 0,
            max_frame_size: MIN_MAX_FRAME_SIZE,
            outgoing_deliveries: BTreeMap::new(),
            incoming_deliveries: BTreeMap::new(),
        }
    }

    /// A session level FLOW reflecting the current windows
    pub(crate) fn flow(&self) -> Flow {
        Flow {
            next_incoming_id: self.next_incoming_id,
            incoming_window: self.incoming_window,
            next_outgoing_id: self.next_outgoing_id,
            outgoing_window: self.outgoing_window,
            handle: None,
            delivery_count: None,
            link_credit: None,
            available: None,
            drain: false,
            echo: false,
            properties: None,
        }
    }
}

pub(crate) struct SessionEngine {
    pub(crate) state: SessionState,
    pub(crate) shared: Weak<SessionShared>,

    /// Owned by a local handle
    pub(crate) bound: bool,

    /// The local handle is gone, remove once unmapped
    pub(crate) released: bool,

    listener: Option<Arc<dyn SessionEvents>>,
    options: SessionOptions,
    pub(crate) remote_channel: Option<u16>,
    remote_handle_max: u32,
    pub(crate) remote_error: Option<definitions::Error>,

    pub(crate) flow: SessionFlow,
    pub(crate) links: Slab<LinkEngine>,
    remote_handles: BTreeMap<u32, usize>,
}

impl SessionEngine {
    pub(crate) fn new(
        key: usize,
        options: SessionOptions,
        listener: Option<Arc<dyn SessionEvents>>,
    ) -> Self {
        Self {
            state: SessionState::Unmapped,
            shared: Weak::new(),
            bound: true,
            released: false,
            listener,
            flow: SessionFlow::new(key, &options),
            options,
            remote_channel: None,
            remote_handle_max: u32::MAX,
            remote_error: None,
            links: Slab::new(),
            remote_handles: BTreeMap::new(),
        }
    }

    /// A session endpoint answering a BEGIN the peer sent first
    pub(crate) fn offered(key: usize, remote_channel: u16, begin: &Begin) -> Self {
        let mut session = Self::new(key, SessionOptions::default(), None);
        session.bound = false;
        session.state = SessionState::BeginReceived;
        session.remote_channel = Some(remote_channel);
        session.apply_remote_begin(begin);
        session
    }

    /// Binds a local handle to an offered session
    pub(crate) fn bind(
        &mut self,
        options: SessionOptions,
        listener: Option<Arc<dyn SessionEvents>>,
    ) -> Result<(), Error> {
        if self.bound || self.released || self.state != SessionState::BeginReceived {
            return Err(Error::EndpointNotAvailable);
        }
        self.flow.initial_incoming_window = options.incoming_window;
        self.flow.incoming_window = options.incoming_window;
        self.flow.outgoing_window = options.outgoing_window;
        self.options = options;
        self.listener = listener;
        self.bound = true;
        Ok(())
    }

    fn set_state(&mut self, new_state: SessionState) {
        let _old_state = std::mem::replace(&mut self.state, new_state);
        #[cfg(feature = "tracing")]
        tracing::debug!(channel = self.flow.channel, old_state = ?_old_state, ?new_state, "session state changed");
        #[cfg(feature = "log")]
        log::debug!("session {} state {:?} -> {:?}", self.flow.channel, _old_state, new_state);
    }

    fn apply_remote_begin(&mut self, begin: &Begin) {
        self.flow.next_incoming_id = Some(begin.next_outgoing_id);
        self.flow.remote_incoming_window = begin.incoming_window;
        self.flow.remote_outgoing_window = begin.outgoing_window;
        self.remote_handle_max = begin.handle_max.0;
    }

    fn handle_max(&self) -> u32 {
        self.options
            .max_link_count
            .saturating_sub(1)
            .min(self.remote_handle_max)
    }

    pub(crate) fn set_incoming_window(&mut self, window: u32) -> Result<(), Error> {
        if self.state != SessionState::Unmapped && self.state != SessionState::BeginReceived {
            return Err(Error::IllegalState(self.state));
        }
        self.options.incoming_window = window;
        self.flow.initial_incoming_window = window;
        self.flow.incoming_window = window;
        Ok(())
    }

    /// Sends BEGIN, or answers the peer's BEGIN on an offered session
    pub(crate) fn begin(&mut self, out: &mut Outbox) -> Result<(), Error> {
        let begin = Begin {
            remote_channel: None,
            next_outgoing_id: self.flow.next_outgoing_id,
            incoming_window: self.flow.incoming_window,
            outgoing_window: self.flow.outgoing_window,
            handle_max: Handle(self.options.max_link_count.saturating_sub(1)),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: self.options.properties.clone(),
        };
        match self.state {
            SessionState::Unmapped => {
                self.remote_error = None;
                out.send(self.flow.channel, FrameBody::Begin(begin));
                self.set_state(SessionState::BeginSent);
            }
            SessionState::BeginReceived => {
                let begin = Begin {
                    remote_channel: self.remote_channel,
                    ..begin
                };
                out.send(self.flow.channel, FrameBody::Begin(begin));
                self.set_state(SessionState::Mapped);
            }
            state => return Err(Error::IllegalState(state)),
        }
        Ok(())
    }

    /// Sends END. An error moves the session to [`SessionState::Discarding`].
    pub(crate) fn end(
        &mut self,
        error: Option<definitions::Error>,
        out: &mut Outbox,
    ) -> Result<(), Error> {
        match self.state {
            SessionState::Mapped | SessionState::BeginSent => {}
            state => return Err(Error::IllegalState(state)),
        }
        let discarding = error.is_some();
        out.send(self.flow.channel, FrameBody::End(End { error }));
        self.set_state(if discarding {
            SessionState::Discarding
        } else {
            SessionState::EndSent
        });
        Ok(())
    }

    fn end_with_error(&mut self, condition: SessionError, description: &str, out: &mut Outbox) {
        #[cfg(feature = "tracing")]
        tracing::error!(channel = self.flow.channel, ?condition, description, "ending session");
        #[cfg(feature = "log")]
        log::error!("ending session {}: {:?} {}", self.flow.channel, condition, description);
        let error = definitions::Error::new(condition, Some(description.to_string()), None);
        let _ = self.end(Some(error), out);
    }

    /// Marks the session as released by its handle. Returns `true` if it can be
    /// removed right away.
    pub(crate) fn release(&mut self, out: &mut Outbox) -> bool {
        self.released = true;
        match self.state {
            SessionState::Mapped | SessionState::BeginSent => {
                let _ = self.end(None, out);
                false
            }
            SessionState::BeginReceived => {
                self.reject(out);
                false
            }
            SessionState::EndSent | SessionState::Discarding => false,
            _ => true,
        }
    }

    /// Answers an offered session nobody wants with BEGIN then END carrying
    /// `amqp:not-allowed`
    pub(crate) fn reject(&mut self, out: &mut Outbox) {
        self.released = true;
        if self.begin(out).is_ok() {
            let error = definitions::Error::new(
                AmqpError::NotAllowed,
                Some(String::from("session endpoint rejected")),
                None,
            );
            let _ = self.end(Some(error), out);
        }
    }

    /// The connection closed or failed underneath the session
    pub(crate) fn on_connection_closed(
        &mut self,
        error: Option<definitions::Error>,
        out: &mut Outbox,
    ) {
        self.end_links(error.clone(), out);
        self.remote_channel = None;
        let new_state = match error {
            Some(_) if self.state != SessionState::Unmapped => SessionState::Error,
            _ => SessionState::Unmapped,
        };
        if self.state != new_state {
            self.set_state(new_state);
        }
    }

    fn end_links(&mut self, error: Option<definitions::Error>, out: &mut Outbox) {
        for (_, link) in self.links.iter_mut() {
            link.on_session_ended(error.clone(), &mut self.flow, out);
        }
        self.remote_handles.clear();
        self.flow.outgoing_deliveries.clear();
        self.flow.incoming_deliveries.clear();
        let released: Vec<usize> = self
            .links
            .iter()
            .filter(|(_, link)| link.released || !link.bound)
            .map(|(key, _)| key)
            .collect();
        for key in released {
            let link = self.links.remove(key);
            out.discard(link);
        }
    }

    /* ------------------------------ incoming frames ----------------------------- */

    /// The peer's BEGIN answering ours
    pub(crate) fn on_begin(&mut self, remote_channel: u16, begin: &Begin, out: &mut Outbox) {
        self.remote_channel = Some(remote_channel);
        self.apply_remote_begin(begin);
        if self.state == SessionState::BeginSent {
            self.set_state(SessionState::Mapped);
        }
        self.pump(out);
    }

    pub(crate) fn on_frame(&mut self, body: FrameBody, out: &mut Outbox) {
        match body {
            FrameBody::Attach(attach) => self.on_attach(attach, out),
            FrameBody::Flow(flow) => self.on_flow(flow, out),
            FrameBody::Transfer {
                performative,
                payload,
            } => self.on_transfer(performative, payload, out),
            FrameBody::Disposition(disposition) => self.on_disposition(disposition, out),
            FrameBody::Detach(detach) => self.on_detach(detach, out),
            FrameBody::End(end) => self.on_end(end, out),
            _ => {}
        }
    }

    fn is_mapped(&self) -> bool {
        matches!(self.state, SessionState::Mapped | SessionState::BeginReceived)
    }

    fn on_attach(&mut self, attach: Attach, out: &mut Outbox) {
        if !self.is_mapped() {
            return;
        }
        if self.remote_handles.contains_key(&attach.handle.0) {
            self.end_with_error(SessionError::HandleInUse, "attach on a handle in use", out);
            return;
        }

        let answered = self
            .links
            .iter()
            .find(|(_, link)| {
                link.name == attach.name
                    && link.role() != attach.role
                    && link.remote_handle.is_none()
                    && link.is_attached()
            })
            .map(|(key, _)| key);
        if let Some(key) = answered {
            self.remote_handles.insert(attach.handle.0, key);
            if let Some(link) = self.links.get_mut(key) {
                link.on_attach(attach, &mut self.flow, out);
                link.pump(key, &mut self.flow, out);
            }
            return;
        }

        let key = self.links.vacant_key();
        if key as u32 > self.handle_max() {
            self.end_with_error(
                SessionError::HandleInUse,
                "attach exceeds the session handle-max",
                out,
            );
            return;
        }
        self.links.insert(LinkEngine::offered(key as u32, &attach));
        self.remote_handles.insert(attach.handle.0, key);

        match &self.listener {
            Some(listener) => out.notify(Notification::LinkAttached {
                listener: listener.clone(),
                session: self.shared.clone(),
                endpoint: LinkEndpoint {
                    session: self.flow.session_key,
                    link: key,
                },
                attach,
            }),
            None => self.reject_link(key, out),
        }
    }

    fn reject_link(&mut self, key: usize, out: &mut Outbox) {
        if let Some(link) = self.links.get_mut(key) {
            link.reject(&mut self.flow, out);
        }
    }

    fn on_flow(&mut self, frame: Flow, out: &mut Outbox) {
        let next_incoming_id = frame.next_incoming_id.unwrap_or(0);
        self.flow.remote_incoming_window = next_incoming_id
            .wrapping_add(frame.incoming_window)
            .wrapping_sub(self.flow.next_outgoing_id);
        self.flow.remote_outgoing_window = frame.outgoing_window;

        match &frame.handle {
            Some(handle) => {
                let Some(&key) = self.remote_handles.get(&handle.0) else {
                    self.end_with_error(
                        SessionError::UnattachedHandle,
                        "flow on an unattached handle",
                        out,
                    );
                    return;
                };
                if let Some(link) = self.links.get_mut(key) {
                    link.on_flow(&frame, &mut self.flow, out);
                }
            }
            None if frame.echo => out.send(self.flow.channel, FrameBody::Flow(self.flow.flow())),
            None => {}
        }
        self.pump(out);
    }

    fn on_transfer(&mut self, transfer: Transfer, payload: Bytes, out: &mut Outbox) {
        if self.flow.incoming_window == 0 {
            self.end_with_error(
                SessionError::WindowViolation,
                "transfer exceeds the incoming window",
                out,
            );
            return;
        }
        let Some(&key) = self.remote_handles.get(&transfer.handle.0) else {
            self.end_with_error(
                SessionError::UnattachedHandle,
                "transfer on an unattached handle",
                out,
            );
            return;
        };

        self.flow.incoming_window -= 1;
        self.flow.next_incoming_id = self.flow.next_incoming_id.map(|id| id.wrapping_add(1));
        self.flow.remote_outgoing_window = self.flow.remote_outgoing_window.saturating_sub(1);

        if let Some(link) = self.links.get_mut(key) {
            link.on_transfer(key, transfer, payload, &mut self.flow, out);
        }

        if self.flow.incoming_window <= self.flow.initial_incoming_window / 2 {
            self.flow.incoming_window = self.flow.initial_incoming_window;
            out.send(self.flow.channel, FrameBody::Flow(self.flow.flow()));
        }
    }

    fn on_disposition(&mut self, disposition: Disposition, out: &mut Outbox) {
        let first = disposition.first;
        let last = disposition.last.unwrap_or(first);
        match disposition.role {
            // The receiving side reports on our outgoing deliveries
            Role::Receiver => {
                let deliveries: Vec<(DeliveryNumber, usize)> = self
                    .flow
                    .outgoing_deliveries
                    .iter()
                    .filter(|(id, _)| in_range(first, last, **id))
                    .map(|(id, key)| (*id, *key))
                    .collect();
                for (delivery_id, key) in deliveries {
                    if let Some(link) = self.links.get_mut(key) {
                        link.on_outgoing_disposition(
                            delivery_id,
                            disposition.settled,
                            disposition.state.clone(),
                            &mut self.flow,
                            out,
                        );
                    }
                }
            }
            Role::Sender => {
                if disposition.settled {
                    self.flow
                        .incoming_deliveries
                        .retain(|id, _| !in_range(first, last, *id));
                }
            }
        }
    }

    fn on_detach(&mut self, detach: Detach, out: &mut Outbox) {
        let Some(key) = self.remote_handles.remove(&detach.handle.0) else {
            self.end_with_error(
                SessionError::UnattachedHandle,
                "detach on an unattached handle",
                out,
            );
            return;
        };
        let Some(link) = self.links.get_mut(key) else {
            return;
        };
        link.on_detach(detach, &mut self.flow, out);
        self.flow.outgoing_deliveries.retain(|_, k| *k != key);
        self.flow.incoming_deliveries.retain(|_, k| *k != key);
        if (link.released || !link.bound) && !link.is_attached() {
            let link = self.links.remove(key);
            out.discard(link);
        }
    }

    fn on_end(&mut self, end: End, out: &mut Outbox) {
        let error = end.error;
        #[cfg(feature = "tracing")]
        tracing::debug!(channel = self.flow.channel, ?error, "peer ended session");
        #[cfg(feature = "log")]
        log::debug!("peer ended session {}: {:?}", self.flow.channel, error);

        match self.state {
            SessionState::Mapped | SessionState::BeginSent | SessionState::BeginReceived => {
                self.set_state(SessionState::EndReceived);
                out.send(self.flow.channel, FrameBody::End(End { error: None }));
                self.remote_error = error.clone();
                // Links ended by the peer carry its error, or a detach-forced one
                let link_error = error.unwrap_or_else(|| {
                    definitions::Error::new(
                        crate::definitions::LinkError::DetachForced,
                        Some(String::from("session ended by peer")),
                        None,
                    )
                });
                self.end_links(Some(link_error), out);
            }
            SessionState::EndSent => {
                self.remote_error = error;
                self.end_links(None, out);
            }
            SessionState::Discarding => {
                self.remote_error = error;
                self.end_links(None, out);
            }
            _ => return,
        }
        self.remote_channel = None;
        self.set_state(SessionState::Unmapped);
    }

    /* ------------------------------ link operations ----------------------------- */

    pub(crate) fn allocate_link(&mut self, config: LinkConfig, kind: LinkKind) -> Result<usize, Error> {
        if matches!(
            self.state,
            SessionState::EndSent | SessionState::Discarding | SessionState::Error
        ) {
            return Err(Error::IllegalState(self.state));
        }
        if self
            .links
            .iter()
            .any(|(_, link)| link.name == config.name && link.role() == kind.role())
        {
            return Err(Error::DuplicatedLinkName);
        }
        let key = self.links.vacant_key();
        if key as u32 > self.handle_max() {
            return Err(Error::HandleMaxReached);
        }
        Ok(self
            .links
            .insert(LinkEngine::new(key as u32, config, kind)))
    }

    pub(crate) fn bind_link(
        &mut self,
        key: usize,
        config: LinkConfig,
        kind: LinkKind,
    ) -> Result<(), Error> {
        self.links
            .get_mut(key)
            .ok_or(Error::EndpointNotAvailable)?
            .bind(config, kind)
    }

    /// Runs `f` on a link, then writes whatever the link may now send
    pub(crate) fn with_link<R>(
        &mut self,
        key: usize,
        out: &mut Outbox,
        f: impl FnOnce(&mut LinkEngine, &mut SessionFlow, &mut Outbox) -> Result<R, LinkError>,
    ) -> Result<R, LinkError> {
        let link = self
            .links
            .get_mut(key)
            .ok_or(LinkError::IllegalState(crate::link::LinkState::Invalid))?;
        let result = f(link, &mut self.flow, out);
        link.pump(key, &mut self.flow, out);
        result
    }

    pub(crate) fn attach_link(
        &mut self,
        key: usize,
        out: &mut Outbox,
    ) -> Result<crate::link::engine::CompletionQueue, LinkError> {
        if !matches!(self.state, SessionState::Mapped | SessionState::BeginSent) {
            return Err(LinkError::SessionNotMapped);
        }
        self.with_link(key, out, |link, flow, out| link.attach(flow, out))
    }

    pub(crate) fn release_link(&mut self, key: usize, out: &mut Outbox) {
        let Some(link) = self.links.get_mut(key) else {
            return;
        };
        if link.release(&mut self.flow, out) {
            self.remote_handles.retain(|_, k| *k != key);
            let link = self.links.remove(key);
            out.discard(link);
        }
    }

    /// Rejects an offered link once every listener had its say, unless a local
    /// handle was bound to it
    pub(crate) fn settle_offered_link(&mut self, key: usize, accepted: bool, out: &mut Outbox) {
        let Some(link) = self.links.get(key) else {
            return;
        };
        let unclaimed = !accepted || !link.bound;
        if unclaimed && link.state == crate::link::LinkState::Idle && link.remote_handle.is_some() {
            self.reject_link(key, out);
        }
    }

    pub(crate) fn complete_delivery(
        &mut self,
        key: usize,
        delivery_id: DeliveryNumber,
        outcome: Outcome,
        out: &mut Outbox,
    ) {
        if let Some(link) = self.links.get_mut(key) {
            link.complete_delivery(delivery_id, outcome, &mut self.flow, out);
        }
    }

    fn pump(&mut self, out: &mut Outbox) {
        for (key, link) in self.links.iter_mut() {
            link.pump(key, &mut self.flow, out);
        }
    }
}
