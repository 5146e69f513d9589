//! Work produced while the engine lock is held and carried out after it is released

use std::sync::{Arc, Weak};

use crate::{
    definitions,
    frames::amqp::{Frame, FrameBody},
    link::{
        Delivery, LinkEndpoint, LinkListener, LinkState, MessageReceiverEvents, SendCallback,
        SendStatus,
    },
    messaging::DeliveryState,
    performatives::Attach,
    session::{SessionEvents, SessionShared},
};

use super::{ConnectionState, Error};

/// A callback to invoke once the engine lock is released
pub(crate) enum Notification {
    ConnectionStateChanged {
        new_state: ConnectionState,
        old_state: ConnectionState,
    },
    IoError(Error),
    FrameReceived(Frame),
    NewEndpoint(usize),
    LinkAttached {
        listener: Arc<dyn SessionEvents>,
        session: Weak<SessionShared>,
        endpoint: LinkEndpoint,
        attach: Attach,
    },
    LinkStateChanged {
        listener: LinkListener,
        new_state: LinkState,
        old_state: LinkState,
    },
    LinkDetached {
        listener: LinkListener,
        error: Option<definitions::Error>,
    },
    MessageReceived {
        listener: Arc<dyn MessageReceiverEvents>,
        session: usize,
        link: usize,
        delivery: Delivery,
    },
    SendComplete {
        callback: SendCallback,
        status: SendStatus,
        state: Option<DeliveryState>,
    },
}

/// Frames, notifications and dropped endpoints collected during one engine call
///
/// Anything that may own a user handle is dropped only after the lock is
/// released, through [`discard`](Self::discard).
#[derive(Default)]
pub(crate) struct Outbox {
    frames: Vec<Frame>,
    notifications: Vec<Notification>,
    discarded: Vec<Box<dyn Send>>,
}

impl Outbox {
    pub(crate) fn send(&mut self, channel: u16, body: FrameBody) {
        self.frames.push(Frame::new(channel, body));
    }

    pub(crate) fn notify(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    pub(crate) fn discard<T: Send + 'static>(&mut self, value: T) {
        self.discarded.push(Box::new(value));
    }

    pub(crate) fn take_frames(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.frames)
    }

    pub(crate) fn take(&mut self) -> (Vec<Frame>, Vec<Notification>, Vec<Box<dyn Send>>) {
        (
            std::mem::take(&mut self.frames),
            std::mem::take(&mut self.notifications),
            std::mem::take(&mut self.discarded),
        )
    }
}
