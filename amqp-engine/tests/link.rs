//! Tests sending and receiving messages against an in-process broker

mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use amqp_engine::{
    definitions::{self, AmqpError, ErrorCondition, ReceiverSettleMode, Role, SenderSettleMode},
    frames::amqp::FrameBody,
    link::LinkError,
    messaging::SimpleValue,
    ConnectionEvents, Context, DeliveryState, LinkState, Message, MessageExt, MessageReceiver,
    MessageReceiverOptions, MessageSender, MessageSenderEvents, MessageSenderOptions, SendStatus,
    Session, SessionOptions,
};
use common::{begin_session, connect, connect_with_events, ctx, wait_until, BrokerConfig, FrameRecorder};
use parking_lot::Mutex;
use serde_amqp::Value;
use tokio_test::{assert_err, assert_ok};

fn text(s: &str) -> Message {
    Message::value(Value::String(s.to_string()))
}

#[tokio::test]
async fn sender_open_send_close() {
    let (connection, broker) = connect(BrokerConfig::default()).await;
    let session = begin_session(&connection).await;

    let sender = assert_ok!(MessageSender::new(&session, "q1", MessageSenderOptions::default(), None));
    assert_eq!(sender.state(), LinkState::Idle);
    assert_ok!(sender.open(&ctx()).await);
    assert_eq!(sender.state(), LinkState::Open);

    let (status, state) = assert_ok!(sender.send(&text("hello"), &ctx()).await);
    assert_eq!(status, SendStatus::Ok);
    assert!(matches!(state, Some(DeliveryState::Accepted(_))));

    assert_ok!(sender.close(&ctx()).await);
    assert_eq!(sender.state(), LinkState::Idle);
    let received = broker.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].body, text("hello").body);

    // Closing again is not allowed
    let err = assert_err!(sender.close(&ctx()).await);
    assert!(matches!(err, LinkError::IllegalState(LinkState::Idle)));

    // A detached link can be attached again
    assert_ok!(sender.open(&ctx()).await);
    assert_ok!(sender.close(&ctx()).await);

    assert_ok!(connection.close(&ctx()).await);
}

#[tokio::test]
async fn send_and_receive() {
    let (connection, _broker) = connect(BrokerConfig::default()).await;
    let session = begin_session(&connection).await;

    let receiver =
        assert_ok!(MessageReceiver::new(&session, "q2", MessageReceiverOptions::default(), None));
    assert_ok!(receiver.open(&ctx()).await);
    let sender = assert_ok!(MessageSender::new(&session, "q2", MessageSenderOptions::default(), None));
    assert_ok!(sender.open(&ctx()).await);

    for i in 0..3 {
        let (status, _) = assert_ok!(sender.send(&text(&format!("message {}", i)), &ctx()).await);
        assert_eq!(status, SendStatus::Ok);
    }
    let mut ids = Vec::new();
    for i in 0..3 {
        let delivery = receiver
            .wait_for_incoming_message(&ctx())
            .await
            .expect("message arrives");
        assert_eq!(delivery.message().body, text(&format!("message {}", i)).body);
        assert!(!delivery.delivery_tag().is_empty());
        ids.push(delivery.delivery_id());
    }
    assert_eq!(ids, vec![ids[0], ids[0].wrapping_add(1), ids[0].wrapping_add(2)]);

    assert_ok!(receiver.close(&ctx()).await);
    assert_ok!(sender.close(&ctx()).await);
    assert_ok!(connection.close(&ctx()).await);
}

#[tokio::test]
async fn large_message_is_split_into_frames() {
    let (connection, _broker) = connect(BrokerConfig::default()).await;
    let session = begin_session(&connection).await;

    let receiver =
        assert_ok!(MessageReceiver::new(&session, "big", MessageReceiverOptions::default(), None));
    assert_ok!(receiver.open(&ctx()).await);
    let sender = assert_ok!(MessageSender::new(&session, "big", MessageSenderOptions::default(), None));
    assert_ok!(sender.open(&ctx()).await);

    let body = "test-message".repeat(100_000);
    let (status, _) = assert_ok!(sender.send(&text(&body), &ctx()).await);
    assert_eq!(status, SendStatus::Ok);

    let delivery = receiver
        .wait_for_incoming_message(&ctx())
        .await
        .expect("message arrives");
    assert_eq!(delivery.message().body, text(&body).body);
}

#[tokio::test]
async fn presettled_send_completes_without_outcome() {
    let (connection, broker) = connect(BrokerConfig::default()).await;
    let session = begin_session(&connection).await;

    let options = MessageSenderOptions {
        settle_mode: SenderSettleMode::Settled,
        ..Default::default()
    };
    let sender = assert_ok!(MessageSender::new(&session, "q3", options, None));
    assert_ok!(sender.open(&ctx()).await);

    let (status, state) = assert_ok!(sender.send(&text("fire and forget"), &ctx()).await);
    assert_eq!(status, SendStatus::Ok);
    assert!(state.is_none());

    wait_until(&connection, || broker.received().len() == 1).await;
}

#[tokio::test]
async fn rejected_message_reports_error() {
    let (connection, _broker) = connect(BrokerConfig::default()).await;
    let session = begin_session(&connection).await;
    let sender = assert_ok!(MessageSender::new(&session, "q4", MessageSenderOptions::default(), None));
    assert_ok!(sender.open(&ctx()).await);

    let mut message = text("bad");
    message
        .application_properties_mut()
        .insert(String::from("outcome"), SimpleValue::String(String::from("reject")));
    let (status, state) = assert_ok!(sender.send(&message, &ctx()).await);
    assert_eq!(status, SendStatus::Error);
    assert!(matches!(state, Some(DeliveryState::Rejected(_))));
}

#[tokio::test]
async fn send_async_invokes_callback() {
    let (connection, _broker) = connect(BrokerConfig::default()).await;
    let session = begin_session(&connection).await;
    let sender = assert_ok!(MessageSender::new(&session, "q5", MessageSenderOptions::default(), None));
    assert_ok!(sender.open(&ctx()).await);

    let completed = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let completed = completed.clone();
        assert_ok!(sender.send_async(&text("async"), move |status, _| {
            if status == SendStatus::Ok {
                completed.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    wait_until(&connection, || completed.load(Ordering::SeqCst) == 5).await;
}

#[tokio::test]
async fn send_on_idle_link_fails() {
    let (connection, _broker) = connect(BrokerConfig::default()).await;
    let session = begin_session(&connection).await;
    let sender = assert_ok!(MessageSender::new(&session, "q6", MessageSenderOptions::default(), None));

    let err = assert_err!(sender.send_async(&text("too early"), |_, _| {}));
    assert!(matches!(err, LinkError::IllegalState(LinkState::Idle)));
}

#[tokio::test]
async fn cancelled_send_reports_cancelled() {
    let (connection, _broker) = connect(BrokerConfig::default()).await;
    let session = begin_session(&connection).await;
    let sender = assert_ok!(MessageSender::new(&session, "q7", MessageSenderOptions::default(), None));
    assert_ok!(sender.open(&ctx()).await);

    let cancelled = ctx();
    cancelled.cancel();
    let (status, state) = assert_ok!(sender.send(&text("never mind"), &cancelled).await);
    assert_eq!(status, SendStatus::Cancelled);
    assert!(state.is_none());
}

#[derive(Default)]
struct StateRecorder {
    transitions: Mutex<Vec<(LinkState, LinkState)>>,
    detached: Mutex<Vec<Option<definitions::Error>>>,
}

impl MessageSenderEvents for StateRecorder {
    fn on_state_changed(&self, new_state: LinkState, old_state: LinkState) {
        self.transitions.lock().push((old_state, new_state));
    }

    fn on_detached(&self, error: Option<&definitions::Error>) {
        self.detached.lock().push(error.cloned());
    }
}

#[tokio::test]
async fn sender_events_follow_state_machine() {
    let (connection, _broker) = connect(BrokerConfig::default()).await;
    let session = begin_session(&connection).await;

    let recorder = Arc::new(StateRecorder::default());
    let sender = assert_ok!(MessageSender::new(
        &session,
        "q8",
        MessageSenderOptions::default(),
        Some(recorder.clone()),
    ));
    assert_ok!(sender.open(&ctx()).await);
    assert_ok!(sender.close(&ctx()).await);

    assert_eq!(
        *recorder.transitions.lock(),
        vec![
            (LinkState::Idle, LinkState::Opening),
            (LinkState::Opening, LinkState::Open),
            (LinkState::Open, LinkState::Closing),
            (LinkState::Closing, LinkState::Idle),
        ]
    );
    // Our own DETACH is not reported as a peer detach
    assert!(recorder.detached.lock().is_empty());
}

#[tokio::test]
async fn peer_detach_with_error_moves_link_to_error() {
    let (connection, broker) = connect(BrokerConfig::default()).await;
    let session = begin_session(&connection).await;

    let recorder = Arc::new(StateRecorder::default());
    let sender = assert_ok!(MessageSender::new(
        &session,
        "doomed",
        MessageSenderOptions::default(),
        Some(recorder.clone()),
    ));
    assert_ok!(sender.open(&ctx()).await);
    let broker_end = broker.receivers().pop().expect("broker attached its end");

    // The client must answer the broker's DETACH while the broker waits for it
    let _worker = connection.spawn_worker();
    let error = definitions::Error::new(
        AmqpError::ResourceLimitExceeded,
        Some(String::from("too many links")),
        None,
    );
    assert_ok!(broker_end.close_with_error(error, &ctx()).await);

    wait_until(&connection, || sender.state() == LinkState::Error).await;
    let expected = ErrorCondition::AmqpError(AmqpError::ResourceLimitExceeded);
    let remote = sender.remote_error().expect("error is kept");
    assert_eq!(remote.condition, expected);
    assert_eq!(remote.description.as_deref(), Some("too many links"));

    wait_until(&connection, || !recorder.detached.lock().is_empty()).await;
    let detached = recorder.detached.lock().clone();
    assert_eq!(detached.len(), 1);
    assert_eq!(detached[0].as_ref().map(|e| &e.condition), Some(&expected));
    assert_eq!(
        recorder.transitions.lock().last(),
        Some(&(LinkState::Open, LinkState::Error))
    );

    // Sending on a link in error fails right away
    let err = assert_err!(sender.send_async(&text("late"), |_, _| {}));
    assert!(matches!(err, LinkError::IllegalState(LinkState::Error)));
}

#[tokio::test]
async fn link_refused_without_session_events() {
    let config = BrokerConfig {
        accept_links: false,
        ..Default::default()
    };
    let (connection, _broker) = connect(config).await;
    let session = begin_session(&connection).await;
    let sender =
        assert_ok!(MessageSender::new(&session, "nowhere", MessageSenderOptions::default(), None));

    let err = assert_err!(sender.open(&ctx()).await);
    match err {
        LinkError::Remote(error) => assert_eq!(
            error.condition,
            ErrorCondition::AmqpError(AmqpError::NotAllowed)
        ),
        other => panic!("unexpected error {:?}", other),
    }
    wait_until(&connection, || sender.state() == LinkState::Error).await;
}

#[tokio::test]
async fn open_against_a_silent_peer_times_out() {
    let config = BrokerConfig {
        answer_links: false,
        ..Default::default()
    };
    let (connection, _broker) = connect(config).await;
    let session = begin_session(&connection).await;
    let sender =
        assert_ok!(MessageSender::new(&session, "silent", MessageSenderOptions::default(), None));

    let err = assert_err!(sender.open(&Context::with_timeout(Duration::from_millis(100))).await);
    assert!(matches!(err, LinkError::Timeout), "got {:?}", err);
    assert_eq!(sender.state(), LinkState::Opening);

    let receiver =
        assert_ok!(MessageReceiver::new(&session, "silent", MessageReceiverOptions::default(), None));
    let cancelled = ctx();
    cancelled.cancel();
    let err = assert_err!(receiver.open(&cancelled).await);
    assert!(matches!(err, LinkError::Cancelled), "got {:?}", err);
}

#[tokio::test]
async fn duplicated_link_name_is_rejected() {
    let (connection, _broker) = connect(BrokerConfig::default()).await;
    let session = assert_ok!(Session::new(&connection, SessionOptions::default(), None));
    let options = MessageSenderOptions {
        name: Some(String::from("same")),
        ..Default::default()
    };
    let _first = assert_ok!(MessageSender::new(&session, "a", options.clone(), None));
    let err = assert_err!(MessageSender::new(&session, "b", options, None));
    assert!(matches!(err, amqp_engine::session::Error::DuplicatedLinkName));
}

#[tokio::test]
async fn second_settle_mode_waits_for_the_sender_to_settle() {
    let recorder = Arc::new(FrameRecorder::default());
    let events: Arc<dyn ConnectionEvents> = recorder.clone();
    let (connection, _broker) = connect_with_events(BrokerConfig::default(), Some(events)).await;
    let session = begin_session(&connection).await;

    let options = MessageReceiverOptions {
        settle_mode: ReceiverSettleMode::Second,
        ..Default::default()
    };
    let receiver = assert_ok!(MessageReceiver::new(&session, "twice", options, None));
    assert_ok!(receiver.open(&ctx()).await);
    let sender = assert_ok!(MessageSender::new(&session, "twice", MessageSenderOptions::default(), None));
    assert_ok!(sender.open(&ctx()).await);

    let (status, _) = assert_ok!(sender.send(&text("settle twice"), &ctx()).await);
    assert_eq!(status, SendStatus::Ok);
    let delivery = receiver
        .wait_for_incoming_message(&ctx())
        .await
        .expect("message arrives");
    assert_eq!(delivery.message().body, text("settle twice").body);

    // The receiver's unsettled DISPOSITION makes the broker's sender settle
    let settled_by_sender = || {
        recorder.frames.lock().iter().any(|frame| match frame.body() {
            FrameBody::Disposition(d) => {
                d.role == Role::Sender
                    && d.settled
                    && d.first == delivery.delivery_id()
                    && matches!(d.state, Some(DeliveryState::Accepted(_)))
            }
            _ => false,
        })
    };
    wait_until(&connection, settled_by_sender).await;
}

#[tokio::test]
async fn dynamic_addresses_are_assigned_by_the_peer() {
    let (connection, _broker) = connect(BrokerConfig::default()).await;
    let session = begin_session(&connection).await;

    let options = MessageReceiverOptions {
        dynamic_address: true,
        ..Default::default()
    };
    let receiver = assert_ok!(MessageReceiver::new(&session, "unused", options, None));
    assert_ok!(receiver.open(&ctx()).await);
    let source = receiver.source_address().expect("source address assigned");
    assert!(source.starts_with("dynamic-"), "got {}", source);

    let options = MessageSenderOptions {
        dynamic_address: true,
        ..Default::default()
    };
    let dynamic_sender = assert_ok!(MessageSender::new(&session, "unused", options, None));
    assert_ok!(dynamic_sender.open(&ctx()).await);
    let target = dynamic_sender.target_address().expect("target address assigned");
    assert!(target.starts_with("dynamic-"), "got {}", target);
    assert_ne!(target, source);

    // The assigned source is a real node
    let sender =
        assert_ok!(MessageSender::new(&session, source.clone(), MessageSenderOptions::default(), None));
    assert_ok!(sender.open(&ctx()).await);
    let (status, _) = assert_ok!(sender.send(&text("to a dynamic node"), &ctx()).await);
    assert_eq!(status, SendStatus::Ok);
    let delivery = receiver
        .wait_for_incoming_message(&ctx())
        .await
        .expect("message arrives");
    assert_eq!(delivery.message().body, text("to a dynamic node").body);
}

#[tokio::test]
async fn receiver_can_reopen_after_close() {
    let (connection, _broker) = connect(BrokerConfig::default()).await;
    let session = begin_session(&connection).await;

    let receiver =
        assert_ok!(MessageReceiver::new(&session, "again", MessageReceiverOptions::default(), None));
    assert_ok!(receiver.open(&ctx()).await);
    assert_ok!(receiver.close(&ctx()).await);
    assert_eq!(receiver.state(), LinkState::Idle);

    assert_ok!(receiver.open(&ctx()).await);
    assert_eq!(receiver.state(), LinkState::Open);

    let sender = assert_ok!(MessageSender::new(&session, "again", MessageSenderOptions::default(), None));
    assert_ok!(sender.open(&ctx()).await);
    let (status, _) = assert_ok!(sender.send(&text("after reopen"), &ctx()).await);
    assert_eq!(status, SendStatus::Ok);

    let delivery = receiver
        .wait_for_incoming_message(&ctx())
        .await
        .expect("reopened receiver gets credit again");
    assert_eq!(delivery.message().body, text("after reopen").body);

    assert_ok!(receiver.close(&ctx()).await);
    assert_ok!(connection.close(&ctx()).await);
}
