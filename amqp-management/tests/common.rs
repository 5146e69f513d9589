#![allow(dead_code)]

use std::{collections::HashMap, sync::Arc, time::Duration};

use amqp_engine::{
    definitions::Role,
    messaging::{Accepted, Rejected, SimpleValue, Target},
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

/// How the mock node answers a request
#[derive(Debug, Clone)]
pub enum Reply {
    /// Answers with `code` stored under `code_key`, and `description` under
    /// `"statusDescription"`
    Status {
        code_key: &'static str,
        code: SimpleValue,
        description: SimpleValue,
    },

    /// Accepts the request and never answers
    Silent,
}

impl Reply {
    pub fn ok() -> Self {
        Self::status(200, "Successful")
    }

    pub fn status(code: i32, description: &str) -> Self {
        Reply::Status {
            code_key: "statusCode",
            code: SimpleValue::Int(code),
            description: SimpleValue::String(description.to_string()),
        }
    }
}

struct NodeState {
    address: String,
    reply: Reply,
    sessions: Mutex<Vec<Session>>,
    receivers: Mutex<Vec<MessageReceiver>>,
    // Response links by the address they deliver to
    senders: Mutex<HashMap<String, MessageSender>>,
    requests: Mutex<Vec<Message>>,
}

/// An in-process management node
///
/// Links on any address are accepted. Requests sent to an address other than the
/// node's own are rejected.
pub struct MockNode {
    pub connection: Connection,
    state: Arc<NodeState>,
}

struct NodeConnection(Arc<NodeState>);
struct NodeSession(Arc<NodeState>);
struct NodeReceiver {
    state: Arc<NodeState>,
    address: String,
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

fn target_address(attach: &Attach) -> String {
    attach
        .target
        .as_ref()
        .and_then(|t| Target::try_from((**t).clone()).ok())
        .and_then(|t| t.address)
        .unwrap_or_default()
}

impl SessionEvents for NodeSession {
    fn on_link_attached(&self, session: &Session, endpoint: LinkEndpoint, attach: &Attach) -> bool {
        match attach.role {
            Role::Sender => {
                let address = target_address(attach);
                let events = Arc::new(NodeReceiver {
                    state: self.0.clone(),
                    address,
                });
                let receiver = assert_ok!(MessageReceiver::from_endpoint(
                    session,
                    endpoint,
                    MessageReceiverOptions::default(),
                    Some(events),
                ));
                assert_ok!(receiver.attach());
                self.0.receivers.lock().push(receiver);
            }
            // Responses are routed by the receiver's target address
            Role::Receiver => {
                let address = target_address(attach);
                let sender = assert_ok!(MessageSender::from_endpoint(
                    session,
                    endpoint,
                    MessageSenderOptions::default(),
                    None,
                ));
                assert_ok!(sender.attach());
                self.0.senders.lock().insert(address, sender);
            }
        }
        true
    }
}

impl MessageReceiverEvents for NodeReceiver {
    fn on_message_received(&self, delivery: &Delivery) -> Outcome {
        let message = delivery.message();
        if self.address != self.state.address {
            return Outcome::Rejected(Rejected { error: None });
        }
        self.state.requests.lock().push(message.clone());

        let (code_key, code, description) = match &self.state.reply {
            Reply::Status {
                code_key,
                code,
                description,
            } => (*code_key, code.clone(), description.clone()),
            Reply::Silent => return Outcome::Accepted(Accepted {}),
        };

        // The correlation-id of the response is the correlation-id of the request if
        // present, else its message-id
        let correlation_id = message
            .correlation_id()
            .or_else(|| message.message_id())
            .cloned();
        let reply_to = message
            .properties
            .as_ref()
            .and_then(|p| p.reply_to.clone())
            .unwrap_or_default();

        let mut response = Message::value(Value::Null);
        response.properties_mut().correlation_id = correlation_id;
        let properties = response.application_properties_mut();
        properties.insert(String::from(code_key), code);
        properties.insert(String::from("statusDescription"), description);

        let sender = self.state.senders.lock().get(&reply_to).cloned();
        if let Some(sender) = sender {
            let _ = sender.send_async(&response, |_, _| {});
        }
        Outcome::Accepted(Accepted {})
    }
}

impl MockNode {
    pub fn start(transport: MemoryTransport, address: &str, reply: Reply) -> Self {
        let state = Arc::new(NodeState {
            address: address.to_string(),
            reply,
            sessions: Mutex::new(Vec::new()),
            receivers: Mutex::new(Vec::new()),
            senders: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        });
        let connection = assert_ok!(Connection::builder()
            .container_id("mock-node")
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

/// Opens a connection to a fresh mock node and begins a session on it
pub async fn connect(address: &str, reply: Reply) -> (Connection, Session, MockNode) {
    let (client, server) = MemoryTransport::pair();
    let node = MockNode::start(server, address, reply);
    let connection = assert_ok!(Connection::builder()
        .container_id("management-client")
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
