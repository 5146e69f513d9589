//! Management client

use std::sync::{Arc, Weak};

use amqp_engine::{
    context::Done,
    definitions::{self, AmqpError},
    link::LinkError,
    session, Context, Delivery, DeliveryState, LinkState, Message, MessageExt, MessageReceiver,
    MessageReceiverEvents, MessageReceiverOptions, MessageSender, MessageSenderEvents,
    MessageSenderOptions, OperationQueue, Outcome, SendStatus, Session,
};
use fe2o3_amqp_types::{
    messaging::{Accepted, MessageId, Rejected, Released},
    primitives::SimpleValue,
};
use parking_lot::Mutex;

use crate::{
    constants,
    error::{Error, Result},
    mgmt_ext::AmqpMessageManagementExt,
    status::{ManagementOpenStatus, ManagementOperationStatus, ManagementResult},
};

/// State of a [`ManagementClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManagementState {
    /// No link is attached
    Idle,

    /// The links are being attached
    Opening,

    /// Both links are attached
    Open,

    /// The links are being detached
    Closing,

    /// A link left the open state without a local close
    Error,
}

/// Options of a [`ManagementClient`]
#[derive(Debug, Clone)]
pub struct ManagementClientOptions {
    /// Trace every request and response
    pub enable_trace: bool,

    /// Application property holding the status code of a response
    pub expected_status_code_key_name: String,

    /// Application property holding the status description of a response
    pub expected_status_description_key_name: String,

    /// Address responses are sent to, `"<node>-client"` when absent
    pub client_node_address: Option<String>,
}

impl Default for ManagementClientOptions {
    fn default() -> Self {
        Self {
            enable_trace: false,
            expected_status_code_key_name: String::from(constants::STATUS_CODE),
            expected_status_description_key_name: String::from(constants::STATUS_DESCRIPTION),
            client_node_address: None,
        }
    }
}

/// Events raised by a [`ManagementClient`]
pub trait ManagementClientEvents: Send + Sync {
    /// Called when a response cannot be processed, or when a management link is lost
    fn on_error(&self, _error: &definitions::Error) {}
}

type PendingQueue = Arc<OperationQueue<ManagementResult>>;

struct Inner {
    session: Session,
    node: String,
    client_node: String,
    options: ManagementClientOptions,
    events: Option<Arc<dyn ManagementClientEvents>>,
    state: Mutex<ManagementState>,
    links: Mutex<Option<(MessageSender, MessageReceiver)>>,
    // Held across the whole attach exchange so that only one caller opens
    open_gate: tokio::sync::Mutex<()>,
    // Keyed by the correlation-id the response must carry
    pending: Mutex<Vec<(MessageId, PendingQueue)>>,
}

impl Inner {
    fn state(&self) -> ManagementState {
        *self.state.lock()
    }

    fn set_state(&self, new_state: ManagementState) {
        let _old_state = std::mem::replace(&mut *self.state.lock(), new_state);
        if self.options.enable_trace {
            #[cfg(feature = "tracing")]
            tracing::debug!(node = %self.node, ?_old_state, ?new_state, "management state changed");
            #[cfg(feature = "log")]
            log::debug!("management {} state {:?} -> {:?}", self.node, _old_state, new_state);
        }
    }

    fn find_pending(&self, key: &MessageId) -> Option<PendingQueue> {
        self.pending
            .lock()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, queue)| queue.clone())
    }

    fn remove_pending(&self, key: &MessageId) {
        self.pending.lock().retain(|(k, _)| k != key);
    }

    fn fail_pending(&self, error: Option<definitions::Error>) {
        let pending = std::mem::take(&mut *self.pending.lock());
        let description = error
            .as_ref()
            .and_then(|e| e.description.clone())
            .unwrap_or_default();
        for (_, queue) in pending {
            queue.complete_operation(ManagementResult::error(description.clone(), error.clone()));
        }
    }

    fn notify_error(&self, error: &definitions::Error) {
        if let Some(events) = &self.events {
            events.on_error(error);
        }
    }

    /// Fails the matching request, if any, and rejects the response
    fn indicate_error(
        &self,
        queue: Option<&PendingQueue>,
        condition: AmqpError,
        reason: String,
    ) -> Outcome {
        #[cfg(feature = "tracing")]
        tracing::warn!(node = %self.node, %reason, "management response error");
        #[cfg(feature = "log")]
        log::warn!("management {} response error: {}", self.node, reason);

        let error = definitions::Error::new(condition, Some(reason), None);
        if let Some(queue) = queue {
            queue.complete_operation(ManagementResult::error(
                constants::PROCESSING_ERROR_DESCRIPTION,
                Some(error.clone()),
            ));
        }
        self.notify_error(&error);
        Outcome::Rejected(Rejected { error: Some(error) })
    }

    fn on_message_received(&self, message: &Message) -> Outcome {
        let key = match message.correlation_id() {
            Some(key) => key,
            None => {
                return self.indicate_error(
                    None,
                    AmqpError::NotFound,
                    String::from("response has no correlation-id"),
                )
            }
        };
        if self.options.enable_trace {
            #[cfg(feature = "tracing")]
            tracing::trace!(node = %self.node, correlation_id = ?key, "management response");
            #[cfg(feature = "log")]
            log::trace!("management {} response {:?}", self.node, key);
        }
        let queue = match self.find_pending(key) {
            Some(queue) => queue,
            None => {
                return self.indicate_error(
                    None,
                    AmqpError::NotFound,
                    format!("correlation-id {:?} matches no request", key),
                )
            }
        };

        let code_key = &self.options.expected_status_code_key_name;
        let status_code = match message.status_code(code_key) {
            Some(Ok(code)) => code,
            Some(Err(value)) => {
                return self.indicate_error(
                    Some(&queue),
                    AmqpError::InternalError,
                    format!("{} is not an int: {:?}", code_key, value),
                )
            }
            None => {
                return self.indicate_error(
                    Some(&queue),
                    AmqpError::InternalError,
                    format!("response has no {}", code_key),
                )
            }
        };

        let description_key = &self.options.expected_status_description_key_name;
        let description = match message.status_description(description_key) {
            Some(Ok(description)) => description.to_string(),
            Some(Err(value)) => {
                return self.indicate_error(
                    Some(&queue),
                    AmqpError::InternalError,
                    format!("{} is not a string: {:?}", description_key, value),
                )
            }
            None => String::new(),
        };

        // Status codes follow HTTP
        let (status, error) = if (200..=299).contains(&status_code) {
            (ManagementOperationStatus::Ok, None)
        } else {
            let error = definitions::Error::new(
                AmqpError::NotAllowed,
                Some(description.clone()),
                None,
            );
            (ManagementOperationStatus::FailedBadStatus, Some(error))
        };
        queue.complete_operation(ManagementResult {
            status,
            status_code,
            description,
            error,
            message: Some(message.clone()),
        });
        Outcome::Accepted(Accepted {})
    }

    fn on_link_lost(&self, error: Option<&definitions::Error>) {
        {
            let mut state = self.state.lock();
            if *state != ManagementState::Open {
                return;
            }
            *state = ManagementState::Error;
        }
        let error = error.cloned().unwrap_or_else(|| {
            definitions::Error::new(
                definitions::LinkError::DetachForced,
                Some(String::from("management link is no longer open")),
                None,
            )
        });
        #[cfg(feature = "tracing")]
        tracing::error!(node = %self.node, ?error, "management link lost");
        #[cfg(feature = "log")]
        log::error!("management {} link lost: {:?}", self.node, error);

        self.fail_pending(Some(error.clone()));
        self.notify_error(&error);
    }
}

/// Forwards link events without keeping the client alive
struct LinkEvents(Weak<Inner>);

impl MessageSenderEvents for LinkEvents {
    fn on_state_changed(&self, new_state: LinkState, _old_state: LinkState) {
        if let (Some(inner), true) = (self.0.upgrade(), new_state != LinkState::Open) {
            inner.on_link_lost(None);
        }
    }

    fn on_detached(&self, error: Option<&definitions::Error>) {
        if let Some(inner) = self.0.upgrade() {
            inner.on_link_lost(error);
        }
    }
}

impl MessageReceiverEvents for LinkEvents {
    fn on_message_received(&self, delivery: &Delivery) -> Outcome {
        match self.0.upgrade() {
            Some(inner) => inner.on_message_received(delivery.message()),
            None => Outcome::Released(Released {}),
        }
    }

    fn on_state_changed(&self, new_state: LinkState, _old_state: LinkState) {
        if let (Some(inner), true) = (self.0.upgrade(), new_state != LinkState::Open) {
            inner.on_link_lost(None);
        }
    }

    fn on_detached(&self, error: Option<&definitions::Error>) {
        if let Some(inner) = self.0.upgrade() {
            inner.on_link_lost(error);
        }
    }
}

fn done_error(ctx: &Context) -> Error {
    match ctx.done_reason() {
        Some(Done::DeadlineExceeded) => Error::Timeout,
        _ => Error::Cancelled,
    }
}

/// A request/response client of an AMQP management node
///
/// Requests are sent over a sender targeting the node, and responses arrive on a
/// receiver sourced from it. Responses are matched to requests by correlation-id,
/// so several requests may be outstanding at once.
///
/// # Example
///
/// ```rust,ignore
/// let management = ManagementClient::new(&session, "$management", Default::default(), None);
/// management.open(&Context::new()).await?;
/// let result = management
///     .execute_operation("READ", "com.example.queue", "", Message::value(Value::Null), &ctx)
///     .await?;
/// management.close(&Context::new()).await?;
/// ```
pub struct ManagementClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ManagementClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementClient")
            .field("node", &self.inner.node)
            .field("client_node", &self.inner.client_node)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

impl ManagementClient {
    /// Creates a client of the management node at `node`. Nothing is attached until
    /// [`open`](Self::open) or the first [`execute_operation`](Self::execute_operation).
    pub fn new(
        session: &Session,
        node: impl Into<String>,
        options: ManagementClientOptions,
        events: Option<Arc<dyn ManagementClientEvents>>,
    ) -> Self {
        let node = node.into();
        let client_node = options
            .client_node_address
            .clone()
            .unwrap_or_else(|| format!("{}-client", node));
        Self {
            inner: Arc::new(Inner {
                session: session.clone(),
                node,
                client_node,
                options,
                events,
                state: Mutex::new(ManagementState::Idle),
                links: Mutex::new(None),
                open_gate: tokio::sync::Mutex::new(()),
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Address of the management node
    pub fn node(&self) -> &str {
        &self.inner.node
    }

    /// Address responses are sent to
    pub fn client_node(&self) -> &str {
        &self.inner.client_node
    }

    /// Current state
    pub fn state(&self) -> ManagementState {
        self.inner.state()
    }

    fn create_links(&self) -> Result<(MessageSender, MessageReceiver)> {
        let inner = &self.inner;
        let events = Arc::new(LinkEvents(Arc::downgrade(inner)));
        let sender_events: Arc<dyn MessageSenderEvents> = events.clone();
        let receiver_events: Arc<dyn MessageReceiverEvents> = events;

        let sender = MessageSender::new(
            &inner.session,
            inner.node.clone(),
            MessageSenderOptions {
                name: Some(format!("{}-sender", inner.node)),
                source_address: Some(inner.client_node.clone()),
                enable_trace: inner.options.enable_trace,
                ..Default::default()
            },
            Some(sender_events),
        )?;
        let receiver = MessageReceiver::new(
            &inner.session,
            inner.node.clone(),
            MessageReceiverOptions {
                name: Some(format!("{}-receiver", inner.node)),
                target_address: Some(inner.client_node.clone()),
                enable_trace: inner.options.enable_trace,
                ..Default::default()
            },
            Some(receiver_events),
        )?;
        Ok((sender, receiver))
    }

    /// Attaches the sender and the receiver and waits for both
    ///
    /// Fails with [`Error::IllegalState`] if the client is already open. A link that
    /// fails to attach yields [`ManagementOpenStatus::Error`]; a cancelled or expired
    /// `ctx` yields [`ManagementOpenStatus::Cancelled`]. In both cases the client
    /// returns to [`ManagementState::Idle`].
    pub async fn open(&self, ctx: &Context) -> Result<ManagementOpenStatus> {
        let _gate = tokio::select! {
            gate = self.inner.open_gate.lock() => gate,
            _ = ctx.done() => return Ok(ManagementOpenStatus::Cancelled),
        };
        self.open_locked(ctx).await
    }

    /// Opens the client, the open gate being held by the caller
    async fn open_locked(&self, ctx: &Context) -> Result<ManagementOpenStatus> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ManagementState::Idle | ManagementState::Error => {
                    *state = ManagementState::Opening
                }
                other => return Err(Error::IllegalState(other)),
            }
        }
        // Links left over from a lost session are released before reusing their names
        drop(self.inner.links.lock().take());

        let (sender, receiver) = match self.create_links() {
            Ok(links) => links,
            Err(error) => {
                self.inner.set_state(ManagementState::Idle);
                return Err(error);
            }
        };
        *self.inner.links.lock() = Some((sender.clone(), receiver.clone()));

        let opened = match sender.open(ctx).await {
            Ok(()) => receiver.open(ctx).await,
            Err(error) => Err(error),
        };
        match opened {
            Ok(()) => {
                self.inner.set_state(ManagementState::Open);
                Ok(ManagementOpenStatus::Ok)
            }
            Err(error) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(node = %self.inner.node, ?error, "management open failed");
                #[cfg(feature = "log")]
                log::warn!("management {} open failed: {:?}", self.inner.node, error);

                let _ = sender.detach();
                let _ = receiver.detach();
                drop(self.inner.links.lock().take());
                self.inner.set_state(ManagementState::Idle);
                match error {
                    LinkError::Cancelled | LinkError::Timeout => Ok(ManagementOpenStatus::Cancelled),
                    _ => Ok(ManagementOpenStatus::Error),
                }
            }
        }
    }

    /// Detaches both links and fails every outstanding request
    ///
    /// Fails with [`Error::IllegalState`] if the client is not open.
    pub async fn close(&self, ctx: &Context) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ManagementState::Open | ManagementState::Error => {
                    *state = ManagementState::Closing
                }
                other => return Err(Error::IllegalState(other)),
            }
        }

        let links = self.inner.links.lock().take();
        let mut result = Ok(());
        if let Some((sender, receiver)) = links {
            for closed in [sender.close(ctx).await, receiver.close(ctx).await] {
                match closed {
                    // Already detached by the peer
                    Ok(()) | Err(LinkError::IllegalState(_)) => {}
                    Err(error) if result.is_ok() => result = Err(error.into()),
                    Err(_) => {}
                }
            }
        }
        self.inner.fail_pending(None);
        self.inner.set_state(ManagementState::Idle);
        result
    }

    /// Sends `message` as a management request and waits for the response
    ///
    /// The `operation`, `type` and, unless empty, `locales` application properties
    /// are stamped on the request. The caller's correlation-id is kept when present,
    /// otherwise a fresh message-id is generated. The client is opened first if it
    /// is idle.
    ///
    /// A response that cannot be read resolves to [`ManagementOperationStatus::Error`]
    /// with status code `0`. An elapsed deadline is [`Error::Timeout`] and a cancelled
    /// `ctx` is [`Error::Cancelled`].
    pub async fn execute_operation(
        &self,
        operation: &str,
        entity_type: &str,
        locales: &str,
        mut message: Message,
        ctx: &Context,
    ) -> Result<ManagementResult> {
        if self.inner.state() != ManagementState::Open {
            // Concurrent first requests queue here while one of them opens the links
            let _gate = tokio::select! {
                gate = self.inner.open_gate.lock() => gate,
                _ = ctx.done() => return Err(done_error(ctx)),
            };
            match self.inner.state() {
                ManagementState::Open => {}
                ManagementState::Idle => match self.open_locked(ctx).await? {
                    ManagementOpenStatus::Ok => {}
                    ManagementOpenStatus::Cancelled => return Err(done_error(ctx)),
                    ManagementOpenStatus::Error => return Err(Error::OpenFailed),
                },
                other => return Err(Error::IllegalState(other)),
            }
        }
        let sender = self
            .inner
            .links
            .lock()
            .as_ref()
            .map(|(sender, _)| sender.clone())
            .ok_or_else(|| Error::IllegalState(self.inner.state()))?;
        let connection = self
            .inner
            .session
            .connection()
            .ok_or(Error::Session(session::Error::ConnectionDropped))?;

        let application_properties = message.application_properties_mut();
        application_properties.insert(
            String::from(constants::OPERATION),
            SimpleValue::String(operation.to_string()),
        );
        application_properties.insert(
            String::from(constants::TYPE),
            SimpleValue::String(entity_type.to_string()),
        );
        if !locales.is_empty() {
            application_properties.insert(
                String::from(constants::LOCALES),
                SimpleValue::String(locales.to_string()),
            );
        }
        let properties = message.properties_mut();
        properties
            .reply_to
            .get_or_insert_with(|| self.inner.client_node.clone());
        let key = match &properties.correlation_id {
            Some(correlation_id) => correlation_id.clone(),
            None => {
                let message_id = MessageId::String(uuid::Uuid::new_v4().to_string());
                properties.message_id = Some(message_id.clone());
                message_id
            }
        };

        let queue = Arc::new(OperationQueue::new());
        {
            let mut pending = self.inner.pending.lock();
            if pending.iter().any(|(k, _)| *k == key) {
                return Err(Error::DuplicateCorrelationId);
            }
            pending.push((key.clone(), queue.clone()));
        }
        if self.inner.options.enable_trace {
            #[cfg(feature = "tracing")]
            tracing::trace!(node = %self.inner.node, operation, correlation_id = ?key, "management request");
            #[cfg(feature = "log")]
            log::trace!("management {} request {} {:?}", self.inner.node, operation, key);
        }

        let (status, state) = match sender.send(&message, ctx).await {
            Ok(sent) => sent,
            Err(error) => {
                self.inner.remove_pending(&key);
                return Err(error.into());
            }
        };
        match status {
            SendStatus::Ok => {}
            SendStatus::Cancelled => {
                self.inner.remove_pending(&key);
                return Err(done_error(ctx));
            }
            SendStatus::Error => {
                self.inner.remove_pending(&key);
                let error = match state {
                    Some(DeliveryState::Rejected(Rejected { error })) => error,
                    _ => None,
                };
                let description = error
                    .as_ref()
                    .and_then(|e| e.description.clone())
                    .unwrap_or_default();
                return Ok(ManagementResult::error(description, error));
            }
        }

        let result = queue.wait_for_polled_result(ctx, &[&connection]).await;
        self.inner.remove_pending(&key);
        result.ok_or_else(|| done_error(ctx))
    }
}
