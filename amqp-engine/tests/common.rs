#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use amqp_engine::{
    definitions::Role,
    frames::amqp::Frame,
    messaging::{Accepted, Rejected, Released, SimpleValue, Target},
    performatives::Attach,
    transport::MemoryTransport,
    Connection, ConnectionEvents, Context, Delivery, LinkEndpoint, Message, MessageReceiver,
    MessageReceiverEvents, MessageReceiverOptions, MessageSender, MessageSenderOptions, Outcome,
    Session, SessionEndpoint, SessionEvents, SessionOptions,
};
use parking_lot::Mutex;
use tokio_test::assert_ok;

/// What the in-process broker agrees to
#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    pub accept_sessions: bool,
    pub accept_links: bool,

    /// Whether accepted links are answered with an ATTACH
    pub answer_links: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            accept_sessions: true,
            accept_links: true,
            answer_links: true,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    config: Option<BrokerConfig>,
    sessions: Mutex<Vec<Session>>,
    receivers: Mutex<Vec<MessageReceiver>>,
    senders: Mutex<HashMap<String, MessageSender>>,
    received: Mutex<Vec<Message>>,
    dynamic_nodes: AtomicUsize,
}

/// A listening connection that accepts sessions and links, records every message
/// it receives and forwards it to a receiver attached on the same address
pub struct Broker {
    pub connection: Connection,
    state: Arc<BrokerState>,
}

struct BrokerConnection(Arc<BrokerState>);
struct BrokerSession(Arc<BrokerState>);
struct BrokerNode {
    state: Arc<BrokerState>,
    address: String,
}

impl ConnectionEvents for BrokerConnection {
    fn on_new_endpoint(&self, connection: &Connection, endpoint: SessionEndpoint) -> bool {
        let config = self.0.config.unwrap_or_default();
        if !config.accept_sessions {
            return false;
        }
        let events: Option<Arc<dyn SessionEvents>> = if config.accept_links {
            Some(Arc::new(BrokerSession(self.0.clone())))
        } else {
            None
        };
        let session = assert_ok!(Session::from_endpoint(
            connection,
            endpoint,
            SessionOptions::default(),
            events
        ));
        assert_ok!(session.begin());
        self.0.sessions.lock().push(session);
        true
    }
}

impl BrokerSession {
    fn dynamic_address(&self) -> String {
        let n = self.0.dynamic_nodes.fetch_add(1, Ordering::SeqCst);
        format!("dynamic-{}", n)
    }
}

impl SessionEvents for BrokerSession {
    fn on_link_attached(&self, session: &Session, endpoint: LinkEndpoint, attach: &Attach) -> bool {
        let answer = self.0.config.unwrap_or_default().answer_links;
        match attach.role {
            // The peer sends, the broker receives
            Role::Sender => {
                let target = attach
                    .target
                    .as_ref()
                    .and_then(|t| Target::try_from((**t).clone()).ok());
                let address = match target {
                    Some(t) if t.dynamic => self.dynamic_address(),
                    Some(t) => t.address.unwrap_or_default(),
                    None => String::new(),
                };
                let node = Arc::new(BrokerNode {
                    state: self.0.clone(),
                    address: address.clone(),
                });
                let options = MessageReceiverOptions {
                    target_address: Some(address),
                    ..Default::default()
                };
                let receiver =
                    assert_ok!(MessageReceiver::from_endpoint(session, endpoint, options, Some(node)));
                if answer {
                    assert_ok!(receiver.attach());
                }
                self.0.receivers.lock().push(receiver);
            }
            Role::Receiver => {
                let address = match attach.source.as_ref() {
                    Some(s) if s.dynamic => self.dynamic_address(),
                    Some(s) => s.address.clone().unwrap_or_default(),
                    None => String::new(),
                };
                let options = MessageSenderOptions {
                    source_address: Some(address.clone()),
                    ..Default::default()
                };
                let sender = assert_ok!(MessageSender::from_endpoint(session, endpoint, options, None));
                if answer {
                    assert_ok!(sender.attach());
                }
                self.0.senders.lock().insert(address, sender);
            }
        }
        true
    }
}

impl MessageReceiverEvents for BrokerNode {
    fn on_message_received(&self, delivery: &Delivery) -> Outcome {
        let message = delivery.message();
        self.state.received.lock().push(message.clone());

        let requested = message
            .application_properties
            .as_ref()
            .and_then(|p| p.get("outcome").cloned());
        match requested {
            Some(SimpleValue::String(s)) if s == "reject" => {
                return Outcome::Rejected(Rejected { error: None })
            }
            Some(SimpleValue::String(s)) if s == "release" => {
                return Outcome::Released(Released {})
            }
            _ => {}
        }

        let forward = self.state.senders.lock().get(&self.address).cloned();
        if let Some(sender) = forward {
            let _ = sender.send_async(message, |_, _| {});
        }
        Outcome::Accepted(Accepted {})
    }
}

impl Broker {
    pub fn start(transport: MemoryTransport, config: BrokerConfig) -> Self {
        let state = Arc::new(BrokerState {
            config: Some(config),
            ..Default::default()
        });
        let connection = assert_ok!(Connection::builder()
            .container_id("broker")
            .transport(transport)
            .events(Arc::new(BrokerConnection(state.clone())))
            .build());
        assert_ok!(connection.listen());
        let _worker = connection.spawn_worker();
        Self { connection, state }
    }

    pub fn received(&self) -> Vec<Message> {
        self.state.received.lock().clone()
    }

    /// The broker's ends of the links attached by client senders
    pub fn receivers(&self) -> Vec<MessageReceiver> {
        self.state.receivers.lock().clone()
    }
}

/// Records every frame a connection receives
#[derive(Default)]
pub struct FrameRecorder {
    pub frames: Mutex<Vec<Frame>>,
}

impl ConnectionEvents for FrameRecorder {
    fn on_frame_received(&self, _connection: &Connection, frame: &Frame) {
        self.frames.lock().push(frame.clone());
    }
}

pub fn ctx() -> Context {
    Context::with_timeout(Duration::from_secs(5))
}

/// Opens a client connection to a freshly started broker
pub async fn connect(config: BrokerConfig) -> (Connection, Broker) {
    connect_with_events(config, None).await
}

/// Opens a client connection with `events` to a freshly started broker
pub async fn connect_with_events(
    config: BrokerConfig,
    events: Option<Arc<dyn ConnectionEvents>>,
) -> (Connection, Broker) {
    let (client, server) = MemoryTransport::pair();
    let broker = Broker::start(server, config);
    let mut builder = Connection::builder().container_id("client").transport(client);
    if let Some(events) = events {
        builder = builder.events(events);
    }
    let connection = assert_ok!(builder.build());
    assert_ok!(connection.open(&ctx()).await);
    (connection, broker)
}

/// Polls `connection` until `condition` holds
pub async fn wait_until(connection: &Connection, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        let _ = connection.poll();
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Begins a session and waits until it is mapped
pub async fn begin_session(connection: &Connection) -> Session {
    let session = assert_ok!(Session::new(connection, SessionOptions::default(), None));
    assert_ok!(session.begin());
    wait_until(connection, || {
        session.state() == amqp_engine::SessionState::Mapped
    })
    .await;
    session
}
