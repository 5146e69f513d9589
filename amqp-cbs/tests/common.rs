#![allow(dead_code)]

use std::{collections::HashMap, sync::Arc, time::Duration};

use amqp_engine::{
    definitions::Role,
    messaging::{Accepted, AmqpValue, Body, SimpleValue, Target},
    performatives::Attach,
    transport::MemoryTransport,
    Connection, ConnectionEvents, Context, Delivery, LinkEndpoint, Message, MessageExt,
    MessageReceiver, MessageReceiverEvents, MessageReceiverOptions, MessageSender,
    MessageSenderOptions, Outcome, Session, SessionEndpoint, SessionEvents, SessionOptions,
    SessionState,
};
use parking_lot::Mutex;
use serde_amqp::Value;
use tokio_test::assert_ok;

/// Token the mock node refuses with a 401
pub const BAD_TOKEN: &str = "bad";

#[derive(Default)]
struct NodeState {
    sessions: Mutex<Vec<Session>>,
    receivers: Mutex<Vec<MessageReceiver>>,
    senders: Mutex<HashMap<String, MessageSender>>,
    requests: Mutex<Vec<Message>>,
}

/// An in-process `$cbs` node
///
/// Every token is accepted with a 202 except [`BAD_TOKEN`].
pub struct CbsNode {
    pub connection: Connection,
    state: Arc<NodeState>,
}

struct NodeConnection(Arc<NodeState>);
struct NodeSession(Arc<NodeState>);
struct NodeReceiver(Arc<NodeState>);

fn target_address(attach: &Attach) -> String {
    attach
        .target
        .as_ref()
        .and_then(|t| Target::try_from((**t).clone()).ok())
        .and_then(|t| t.address)
        .unwrap_or_default()
}

impl ConnectionEvents for NodeConnection {
    fn on_new_endpoint(&self, connection: &Connection, endpoint: SessionEndpoint) -> bool {
        let events: Arc<dyn SessionEvents> = Arc::new(NodeSession(self.0.clone()));
        let session = assert_ok!(Session::from_endpoint(
            connection,
            endpoint,
            SessionOptions::default(),
            Some(events)
        ));
        assert_ok!(session.begin());
        self.0.sessions.lock().push(session);
        true
    }
}

impl SessionEvents for NodeSession {
    fn on_link_attached(&self, session: &Session, endpoint: LinkEndpoint, attach: &Attach) -> bool {
        match attach.role {
            Role::Sender => {
                let receiver = assert_ok!(MessageReceiver::from_endpoint(
                    session,
                    endpoint,
                    MessageReceiverOptions::default(),
                    Some(Arc::new(NodeReceiver(self.0.clone()))),
                ));
                assert_ok!(receiver.attach());
                self.0.receivers.lock().push(receiver);
            }
            Role::Receiver => {
                let sender = assert_ok!(MessageSender::from_endpoint(
                    session,
                    endpoint,
                    MessageSenderOptions::default(),
                    None,
                ));
                assert_ok!(sender.attach());
                self.0.senders.lock().insert(target_address(attach), sender);
            }
        }
        true
    }
}

impl MessageReceiverEvents for NodeReceiver {
    fn on_message_received(&self, delivery: &Delivery) -> Outcome {
        let message = delivery.message();
        self.0.requests.lock().push(message.clone());

        let (code, description) = match &message.body {
            Body::Value(AmqpValue(Value::String(token))) if token == BAD_TOKEN => {
                (401, "Unauthorized")
            }
            _ => (202, "Accepted"),
        };
        let reply_to = message
            .properties
            .as_ref()
            .and_then(|p| p.reply_to.clone())
            .unwrap_or_default();

        let mut response = Message::value(Value::Null);
        response.properties_mut().correlation_id = message
            .correlation_id()
            .or_else(|| message.message_id())
            .cloned();
        let properties = response.application_properties_mut();
        properties.insert(String::from("status-code"), SimpleValue::Int(code));
        properties.insert(
            String::from("status-description"),
            SimpleValue::String(description.to_string()),
        );

        let sender = self.0.senders.lock().get(&reply_to).cloned();
        if let Some(sender) = sender {
            let _ = sender.send_async(&response, |_, _| {});
        }
        Outcome::Accepted(Accepted {})
    }
}

impl CbsNode {
    pub fn start(transport: MemoryTransport) -> Self {
        let state = Arc::new(NodeState::default());
        let connection = assert_ok!(Connection::builder()
            .container_id("cbs-node")
            .transport(transport)
            .events(Arc::new(NodeConnection(state.clone())))
            .build());
        assert_ok!(connection.listen());
        let _worker = connection.spawn_worker();
        Self { connection, state }
    }

    pub fn requests(&self) -> Vec<Message> {
        self.state.requests.lock().clone()
    }
}

pub fn ctx() -> Context {
    Context::with_timeout(Duration::from_secs(5))
}

/// Opens a connection to a fresh `$cbs` node and begins a session on it
pub async fn connect() -> (Connection, Session, CbsNode) {
    let (client, server) = MemoryTransport::pair();
    let node = CbsNode::start(server);
    let connection = assert_ok!(Connection::builder()
        .container_id("cbs-client")
        .transport(client)
        .build());
    assert_ok!(connection.open(&ctx()).await);

    let session = assert_ok!(Session::new(&connection, SessionOptions::default(), None));
    assert_ok!(session.begin());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while session.state() != SessionState::Mapped {
        let _ = connection.poll();
        assert!(tokio::time::Instant::now() < deadline, "session not mapped");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    (connection, session, node)
}
