//! Connection state machine: protocol header, OPEN/CLOSE, channel routing and
//! idle timeouts

use std::{collections::BTreeMap, io, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use slab::Slab;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    definitions::{self, AmqpError, ConnectionError, DeliveryNumber},
    frames::amqp::{Frame, FrameBody, FrameCodec},
    link::{
        engine::{CompletionQueue as LinkCompletionQueue, LinkEngine, LinkKind},
        LinkConfig, LinkEndpoint, LinkError,
    },
    messaging::Outcome,
    operation_queue::OperationQueue,
    performatives::{Begin, ChannelMax, Close, MaxFrameSize, Open},
    session::{
        self,
        engine::{SessionEngine, SessionFlow},
        SessionEvents, SessionOptions, SessionShared, SessionState,
    },
    transport::{
        self,
        protocol_header::{ProtocolHeader, ProtocolHeaderCodec},
        Transport, TransportCallbacks, TransportEvent,
    },
};

use super::{
    heartbeat::IdleTimer, ConnectionOptions, ConnectionState, Error, Notification, Outbox,
};

pub(crate) type CompletionQueue = Arc<OperationQueue<Result<(), Error>>>;

pub(crate) struct ConnectionEngine {
    state: ConnectionState,
    pub(crate) options: ConnectionOptions,

    transport: Box<dyn Transport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    callbacks: TransportCallbacks,
    transport_closed: bool,

    listening: bool,
    has_listener: bool,

    read_buf: BytesMut,
    header_codec: ProtocolHeaderCodec,
    header_received: bool,
    frame_codec: FrameCodec,

    remote_open: Option<Open>,
    remote_error: Option<definitions::Error>,
    failure: Option<definitions::Error>,
    channel_max: u16,
    max_frame_size: u32,

    sessions: Slab<SessionEngine>,
    remote_channels: BTreeMap<u16, usize>,
    idle: IdleTimer,

    pub(crate) out: Outbox,
    open_queue: CompletionQueue,
    open_pending: bool,
    close_queue: CompletionQueue,
    close_pending: bool,
}

impl std::fmt::Debug for ConnectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEngine")
            .field("state", &self.state)
            .field("container_id", &self.options.container_id)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionEngine {
    pub(crate) fn new(
        options: ConnectionOptions,
        transport: Box<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        callbacks: TransportCallbacks,
        has_listener: bool,
    ) -> Self {
        Self {
            state: ConnectionState::Start,
            frame_codec: FrameCodec::new(options.max_frame_size),
            channel_max: options.max_channel_count,
            max_frame_size: options.max_frame_size,
            idle: IdleTimer::new(options.idle_timeout),
            options,
            transport,
            events,
            callbacks,
            transport_closed: false,
            listening: false,
            has_listener,
            read_buf: BytesMut::new(),
            header_codec: ProtocolHeaderCodec::new(),
            header_received: false,
            remote_open: None,
            remote_error: None,
            failure: None,
            sessions: Slab::new(),
            remote_channels: BTreeMap::new(),
            out: Outbox::default(),
            open_queue: Arc::new(OperationQueue::new()),
            open_pending: false,
            close_queue: Arc::new(OperationQueue::new()),
            close_pending: false,
        }
    }

    /* -------------------------------- accessors -------------------------------- */

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn remote_error(&self) -> Option<definitions::Error> {
        self.remote_error.clone()
    }

    pub(crate) fn failure(&self) -> Option<definitions::Error> {
        self.failure.clone()
    }

    pub(crate) fn remote_container_id(&self) -> Option<String> {
        self.remote_open.as_ref().map(|open| open.container_id.clone())
    }

    pub(crate) fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    pub(crate) fn channel_max(&self) -> u16 {
        self.channel_max
    }

    pub(crate) fn remote_idle_timeout(&self) -> Option<Duration> {
        self.idle.remote()
    }

    fn set_state(&mut self, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut self.state, new_state);
        if old_state == new_state {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(container_id = %self.options.container_id, ?old_state, ?new_state, "connection state changed");
        #[cfg(feature = "log")]
        log::debug!(
            "connection {} state {:?} -> {:?}",
            self.options.container_id,
            old_state,
            new_state
        );
        if self.has_listener {
            self.out.notify(Notification::ConnectionStateChanged {
                new_state,
                old_state,
            });
        }
    }

    /* -------------------------------- operations -------------------------------- */

    fn start_transport(&mut self) -> Result<(), Error> {
        self.transport.open(self.callbacks.clone())?;
        self.idle.reset();
        Ok(())
    }

    fn send_header(&mut self) -> Result<(), Error> {
        self.transport.send(Bytes::from(ProtocolHeader::amqp()))?;
        self.idle.on_sent();
        Ok(())
    }

    fn send_open(&mut self) {
        let open = Open {
            container_id: self.options.container_id.clone(),
            hostname: self.options.host_name.clone(),
            max_frame_size: MaxFrameSize(self.options.max_frame_size),
            channel_max: ChannelMax(self.options.max_channel_count),
            idle_time_out: self
                .options
                .idle_timeout
                .map(|timeout| timeout.as_millis().min(u32::MAX as u128) as u32),
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: self.options.properties.clone(),
        };
        self.out.send(0, FrameBody::Open(open));
    }

    /// Opens the transport, then pipelines the protocol header and OPEN
    pub(crate) fn open(&mut self) -> Result<CompletionQueue, Error> {
        if self.state != ConnectionState::Start {
            return Err(Error::IllegalState(self.state));
        }
        self.open_queue.clear();
        self.listening = false;
        self.start_transport()?;
        self.send_header()?;
        self.set_state(ConnectionState::HeaderSent);
        self.send_open();
        self.set_state(ConnectionState::OpenPipe);
        self.open_pending = true;
        Ok(self.open_queue.clone())
    }

    /// Opens the transport and waits for the peer to start the exchange
    pub(crate) fn listen(&mut self) -> Result<CompletionQueue, Error> {
        if self.state != ConnectionState::Start {
            return Err(Error::IllegalState(self.state));
        }
        self.open_queue.clear();
        self.listening = true;
        self.start_transport()?;
        self.open_pending = true;
        Ok(self.open_queue.clone())
    }

    /// Sends CLOSE. An error moves the connection to [`ConnectionState::Discarding`].
    pub(crate) fn close(&mut self, error: Option<definitions::Error>) -> Result<CompletionQueue, Error> {
        self.close_queue.clear();
        let discarding = error.is_some();
        let next = match self.state {
            ConnectionState::Opened if discarding => ConnectionState::Discarding,
            ConnectionState::Opened => ConnectionState::CloseSent,
            ConnectionState::OpenPipe => ConnectionState::OcPipe,
            ConnectionState::OpenSent => ConnectionState::ClosePipe,
            ConnectionState::HeaderExchanged if self.listening => {
                self.send_open();
                ConnectionState::ClosePipe
            }
            state => return Err(Error::IllegalState(state)),
        };
        self.out.send(0, FrameBody::Close(Close { error }));
        self.set_state(next);
        self.close_pending = true;
        Ok(self.close_queue.clone())
    }

    /// Best effort CLOSE when the last handle goes away
    pub(crate) fn shutdown(&mut self) {
        match self.state {
            ConnectionState::Start | ConnectionState::End | ConnectionState::Error => return,
            ConnectionState::Opened => {
                self.out.send(0, FrameBody::Close(Close { error: None }));
            }
            _ => {}
        }
        let frames = self.out.take_frames();
        let _ = self.write_frames(frames);
        self.close_transport();
        self.state = ConnectionState::End;
    }

    /// Processes every pending transport event, then checks idle timeouts
    pub(crate) fn poll(&mut self) -> Result<(), Error> {
        while let Ok(event) = self.events.try_recv() {
            match event {
                TransportEvent::Opened | TransportEvent::SendComplete => {}
                TransportEvent::BytesReceived(bytes) => {
                    if self.state.is_terminal() {
                        continue;
                    }
                    self.read_buf.extend_from_slice(&bytes);
                    if let Err(error) = self.process_incoming() {
                        self.fail(error);
                    }
                }
                TransportEvent::Closed => {
                    self.transport_closed = true;
                    if !self.state.is_terminal() {
                        self.fail(Error::Io(io::Error::new(
                            io::ErrorKind::ConnectionReset,
                            "transport closed",
                        )));
                    }
                }
                TransportEvent::Error(error) => {
                    if !self.state.is_terminal() {
                        self.fail(Error::Io(error));
                    }
                }
            }
        }
        self.check_idle();

        match (&self.state, &self.failure) {
            (ConnectionState::Error, Some(failure)) => Err(Error::Local(failure.clone())),
            _ => Ok(()),
        }
    }

    fn check_idle(&mut self) {
        if !self.header_received || self.state.is_terminal() {
            return;
        }
        if self.idle.local_expired() {
            let error = definitions::Error::new(
                AmqpError::ResourceLimitExceeded,
                Some(String::from("local-idle-timeout expired")),
                None,
            );
            if self.state == ConnectionState::Opened {
                self.out.send(
                    0,
                    FrameBody::Close(Close {
                        error: Some(error.clone()),
                    }),
                );
            }
            self.fail(Error::Local(error));
            return;
        }
        if self.state == ConnectionState::Opened && self.idle.heartbeat_due() {
            self.out.send(0, FrameBody::Empty);
        }
    }

    /// Writes collected frames to the transport
    pub(crate) fn flush(&mut self) {
        let frames = self.out.take_frames();
        if frames.is_empty() || self.transport_closed {
            return;
        }
        if let Err(error) = self.write_frames(frames) {
            self.fail(error);
        }
    }

    fn write_frames(&mut self, frames: Vec<Frame>) -> Result<(), Error> {
        if self.transport_closed || frames.is_empty() {
            return Ok(());
        }
        let mut buf = BytesMut::new();
        for frame in frames {
            if self.options.enable_trace {
                #[cfg(feature = "tracing")]
                tracing::trace!(channel = frame.channel, frame = ?frame.body, "SEND");
                #[cfg(feature = "log")]
                log::trace!("SEND channel = {}, frame = {:?}", frame.channel, frame.body);
            }
            self.frame_codec.encode(frame, &mut buf)?;
        }
        self.transport.send(buf.freeze())?;
        self.idle.on_sent();
        Ok(())
    }

    fn close_transport(&mut self) {
        if !self.transport_closed {
            self.transport_closed = true;
            let _ = self.transport.close();
        }
    }

    /// Moves to [`ConnectionState::Error`], failing every pending operation
    fn fail(&mut self, error: Error) {
        if self.state.is_terminal() {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::error!(container_id = %self.options.container_id, ?error, "connection failed");
        #[cfg(feature = "log")]
        log::error!("connection {} failed: {:?}", self.options.container_id, error);

        let amqp_error = error.to_amqp_error();
        self.failure = Some(amqp_error.clone());
        let frames = self.out.take_frames();
        let _ = self.write_frames(frames);
        self.close_transport();
        self.set_state(ConnectionState::Error);

        self.end_sessions(Some(amqp_error.clone()));
        if std::mem::take(&mut self.open_pending) {
            self.open_queue
                .complete_operation(Err(Error::Local(amqp_error.clone())));
        }
        if std::mem::take(&mut self.close_pending) {
            self.close_queue
                .complete_operation(Err(Error::Local(amqp_error)));
        }
        if self.has_listener {
            self.out.notify(Notification::IoError(error));
        }
    }

    /// Moves to [`ConnectionState::End`] after the CLOSE exchange
    fn finish(&mut self) {
        let frames = self.out.take_frames();
        let _ = self.write_frames(frames);
        self.close_transport();
        self.set_state(ConnectionState::End);

        let remote_error = self.remote_error.clone();
        self.end_sessions(remote_error.clone());
        let result = match &remote_error {
            Some(error) => Err(Error::Remote(error.clone())),
            None => Ok(()),
        };
        if std::mem::take(&mut self.open_pending) {
            let error = remote_error.map_or(Error::IllegalState(ConnectionState::End), Error::Remote);
            self.open_queue.complete_operation(Err(error));
        }
        if std::mem::take(&mut self.close_pending) {
            self.close_queue.complete_operation(result);
        }
    }

    fn end_sessions(&mut self, error: Option<definitions::Error>) {
        for (_, session) in self.sessions.iter_mut() {
            session.on_connection_closed(error.clone(), &mut self.out);
        }
        self.remote_channels.clear();
        let removed: Vec<usize> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.released || !session.bound)
            .map(|(key, _)| key)
            .collect();
        for key in removed {
            let session = self.sessions.remove(key);
            self.out.discard(session);
        }
    }

    /* ------------------------------ incoming bytes ------------------------------ */

    fn process_incoming(&mut self) -> Result<(), Error> {
        if !self.header_received {
            let Some(header) = self.header_codec.decode(&mut self.read_buf)? else {
                return Ok(());
            };
            if !header.is_supported() {
                return Err(transport::Error::ProtocolHeaderMismatch(header.into()).into());
            }
            self.idle.on_received();
            self.on_header()?;
        }

        while !self.state.is_terminal() {
            let Some(frame) = self.frame_codec.decode(&mut self.read_buf)? else {
                break;
            };
            self.idle.on_received();
            self.on_frame(frame)?;
        }
        Ok(())
    }

    fn on_header(&mut self) -> Result<(), Error> {
        self.header_received = true;
        match self.state {
            ConnectionState::HeaderSent => self.set_state(ConnectionState::HeaderExchanged),
            ConnectionState::OpenPipe => self.set_state(ConnectionState::OpenSent),
            ConnectionState::OcPipe => self.set_state(ConnectionState::ClosePipe),
            ConnectionState::Start if self.listening => {
                self.set_state(ConnectionState::HeaderReceived);
                self.send_header()?;
                self.set_state(ConnectionState::HeaderExchanged);
            }
            state => return Err(Error::IllegalState(state)),
        }
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame) -> Result<(), Error> {
        if self.options.enable_trace {
            #[cfg(feature = "tracing")]
            tracing::trace!(channel = frame.channel, frame = ?frame.body, "RECV");
            #[cfg(feature = "log")]
            log::trace!("RECV channel = {}, frame = {:?}", frame.channel, frame.body);
        }
        if self.has_listener {
            self.out.notify(Notification::FrameReceived(frame.clone()));
        }

        let channel = frame.channel;
        match frame.body {
            FrameBody::Open(open) => self.on_open(open),
            FrameBody::Close(close) => self.on_close(close),
            FrameBody::Empty => Ok(()),
            body => match self.state {
                ConnectionState::Opened => self.on_session_frame(channel, body),
                // Frames crossing our CLOSE are dropped
                ConnectionState::CloseSent | ConnectionState::Discarding => Ok(()),
                state => Err(Error::IllegalState(state)),
            },
        }
    }

    fn apply_remote_open(&mut self, open: Open) {
        self.frame_codec.set_remote_max_frame_size(open.max_frame_size.0);
        self.max_frame_size = self.options.max_frame_size.min(open.max_frame_size.0);
        self.channel_max = self.options.max_channel_count.min(open.channel_max.0);
        self.idle.set_remote(open.idle_time_out);
        let remote_max_frame_size = self.frame_codec.remote_max_frame_size();
        for (_, session) in self.sessions.iter_mut() {
            session.flow.max_frame_size = remote_max_frame_size;
        }
        self.remote_open = Some(open);
    }

    fn on_open(&mut self, open: Open) -> Result<(), Error> {
        match self.state {
            ConnectionState::HeaderExchanged if self.listening => {
                self.apply_remote_open(open);
                self.set_state(ConnectionState::OpenReceived);
                self.send_open();
                self.set_state(ConnectionState::Opened);
            }
            ConnectionState::OpenSent => {
                self.apply_remote_open(open);
                self.set_state(ConnectionState::Opened);
            }
            ConnectionState::ClosePipe => {
                self.apply_remote_open(open);
                self.set_state(ConnectionState::CloseSent);
                return Ok(());
            }
            state => return Err(Error::IllegalState(state)),
        }
        if std::mem::take(&mut self.open_pending) {
            self.open_queue.complete_operation(Ok(()));
        }
        Ok(())
    }

    fn on_close(&mut self, close: Close) -> Result<(), Error> {
        #[cfg(feature = "tracing")]
        tracing::debug!(container_id = %self.options.container_id, error = ?close.error, "peer closed connection");
        #[cfg(feature = "log")]
        log::debug!("peer closed connection {}: {:?}", self.options.container_id, close.error);

        self.remote_error = close.error;
        match self.state {
            ConnectionState::Opened => {
                self.set_state(ConnectionState::CloseReceived);
                self.out.send(0, FrameBody::Close(Close { error: None }));
            }
            ConnectionState::CloseSent
            | ConnectionState::Discarding
            | ConnectionState::ClosePipe
            | ConnectionState::OpenSent
            | ConnectionState::OpenReceived
            | ConnectionState::HeaderExchanged => {}
            state => return Err(Error::IllegalState(state)),
        }
        self.finish();
        Ok(())
    }

    fn on_session_frame(&mut self, channel: u16, body: FrameBody) -> Result<(), Error> {
        if let FrameBody::Begin(begin) = body {
            return self.on_begin(channel, begin);
        }
        let Some(&key) = self.remote_channels.get(&channel) else {
            return Err(Error::connection_error(
                ConnectionError::FramingError,
                format!("frame {} on unmapped channel {}", body.name(), channel),
            ));
        };
        if let Some(session) = self.sessions.get_mut(key) {
            session.on_frame(body, &mut self.out);
        }
        self.reap_session(key);
        Ok(())
    }

    fn on_begin(&mut self, channel: u16, begin: Begin) -> Result<(), Error> {
        if self.remote_channels.contains_key(&channel) {
            return Err(Error::amqp_error(
                AmqpError::NotAllowed,
                format!("BEGIN on mapped channel {}", channel),
            ));
        }

        if let Some(local) = begin.remote_channel {
            let key = local as usize;
            match self.sessions.get_mut(key) {
                Some(session) if session.state == SessionState::BeginSent => {
                    session.on_begin(channel, &begin, &mut self.out);
                    self.remote_channels.insert(channel, key);
                    Ok(())
                }
                _ => Err(Error::amqp_error(
                    AmqpError::NotAllowed,
                    format!("BEGIN answers unknown channel {}", local),
                )),
            }
        } else {
            let key = self.sessions.vacant_key();
            if key > self.channel_max as usize {
                return Err(Error::connection_error(
                    ConnectionError::FramingError,
                    String::from("channel-max exceeded"),
                ));
            }
            let mut session = SessionEngine::offered(key, channel, &begin);
            session.flow.max_frame_size = self.frame_codec.remote_max_frame_size();
            self.sessions.insert(session);
            self.remote_channels.insert(channel, key);
            if self.has_listener {
                self.out.notify(Notification::NewEndpoint(key));
            } else if let Some(session) = self.sessions.get_mut(key) {
                session.reject(&mut self.out);
            }
            Ok(())
        }
    }

    /// Removes a session that is unmapped and has no local handle
    fn reap_session(&mut self, key: usize) {
        let Some(session) = self.sessions.get(key) else {
            return;
        };
        if matches!(session.state, SessionState::Unmapped | SessionState::Error) {
            self.remote_channels.retain(|_, k| *k != key);
            if session.released || !session.bound {
                let session = self.sessions.remove(key);
                self.out.discard(session);
            }
        }
    }

    /* ----------------------------- session operations ---------------------------- */

    pub(crate) fn allocate_session(
        &mut self,
        options: SessionOptions,
        listener: Option<Arc<dyn SessionEvents>>,
        shared: impl FnOnce(usize) -> std::sync::Weak<SessionShared>,
    ) -> Result<usize, session::Error> {
        if !matches!(
            self.state,
            ConnectionState::Start
                | ConnectionState::HeaderSent
                | ConnectionState::HeaderReceived
                | ConnectionState::HeaderExchanged
                | ConnectionState::OpenPipe
                | ConnectionState::OpenSent
                | ConnectionState::OpenReceived
                | ConnectionState::Opened
        ) {
            return Err(session::Error::ConnectionNotOpened(self.state));
        }
        let key = self.sessions.vacant_key();
        if key > self.channel_max as usize {
            return Err(session::Error::ChannelMaxReached);
        }
        let mut session = SessionEngine::new(key, options, listener);
        session.flow.max_frame_size = self.frame_codec.remote_max_frame_size();
        session.shared = shared(key);
        Ok(self.sessions.insert(session))
    }

    pub(crate) fn bind_session(
        &mut self,
        key: usize,
        options: SessionOptions,
        listener: Option<Arc<dyn SessionEvents>>,
        shared: std::sync::Weak<SessionShared>,
    ) -> Result<(), session::Error> {
        let session = self
            .sessions
            .get_mut(key)
            .ok_or(session::Error::EndpointNotAvailable)?;
        session.bind(options, listener)?;
        session.shared = shared;
        Ok(())
    }

    pub(crate) fn with_session<R>(
        &mut self,
        key: usize,
        f: impl FnOnce(&mut SessionEngine, &mut Outbox) -> Result<R, session::Error>,
    ) -> Result<R, session::Error> {
        let session = self
            .sessions
            .get_mut(key)
            .ok_or(session::Error::IllegalState(SessionState::Unmapped))?;
        f(session, &mut self.out)
    }

    pub(crate) fn begin_session(&mut self, key: usize) -> Result<(), session::Error> {
        if self.state != ConnectionState::Opened {
            return Err(session::Error::ConnectionNotOpened(self.state));
        }
        self.with_session(key, |session, out| session.begin(out))
    }

    pub(crate) fn end_session(
        &mut self,
        key: usize,
        error: Option<definitions::Error>,
    ) -> Result<(), session::Error> {
        self.with_session(key, |session, out| session.end(error, out))
    }

    pub(crate) fn release_session(&mut self, key: usize) {
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        if session.release(&mut self.out) || self.state.is_terminal() {
            self.remote_channels.retain(|_, k| *k != key);
            let session = self.sessions.remove(key);
            self.out.discard(session);
        }
    }

    /// Rejects an offered session once the listener had its say, unless a local
    /// handle was bound to it
    pub(crate) fn settle_offered_session(&mut self, key: usize, accepted: bool) {
        let Some(session) = self.sessions.get_mut(key) else {
            return;
        };
        if (!accepted || !session.bound) && session.state == SessionState::BeginReceived {
            session.reject(&mut self.out);
        }
    }

    /* ------------------------------ link operations ------------------------------ */

    pub(crate) fn allocate_link(
        &mut self,
        session: usize,
        config: LinkConfig,
        kind: LinkKind,
    ) -> Result<usize, session::Error> {
        self.with_session(session, |session, _| session.allocate_link(config, kind))
    }

    pub(crate) fn bind_link(
        &mut self,
        endpoint: LinkEndpoint,
        config: LinkConfig,
        kind: LinkKind,
    ) -> Result<(), session::Error> {
        self.with_session(endpoint.session, |session, _| {
            session.bind_link(endpoint.link, config, kind)
        })
    }

    pub(crate) fn with_link<R>(
        &mut self,
        session: usize,
        link: usize,
        f: impl FnOnce(&mut LinkEngine, &mut SessionFlow, &mut Outbox) -> Result<R, LinkError>,
    ) -> Result<R, LinkError> {
        let session = self
            .sessions
            .get_mut(session)
            .ok_or(LinkError::SessionNotMapped)?;
        session.with_link(link, &mut self.out, f)
    }

    pub(crate) fn attach_link(
        &mut self,
        session: usize,
        link: usize,
    ) -> Result<LinkCompletionQueue, LinkError> {
        if self.state != ConnectionState::Opened {
            return Err(LinkError::SessionNotMapped);
        }
        let session = self
            .sessions
            .get_mut(session)
            .ok_or(LinkError::SessionNotMapped)?;
        session.attach_link(link, &mut self.out)
    }

    pub(crate) fn release_link(&mut self, session: usize, link: usize) {
        if let Some(session) = self.sessions.get_mut(session) {
            session.release_link(link, &mut self.out);
        }
    }

    pub(crate) fn settle_offered_link(&mut self, session: usize, link: usize, accepted: bool) {
        if let Some(session) = self.sessions.get_mut(session) {
            session.settle_offered_link(link, accepted, &mut self.out);
        }
    }

    pub(crate) fn complete_delivery(
        &mut self,
        session: usize,
        link: usize,
        delivery_id: DeliveryNumber,
        outcome: Outcome,
    ) {
        if let Some(session) = self.sessions.get_mut(session) {
            session.complete_delivery(link, delivery_id, outcome, &mut self.out);
        }
    }
}
