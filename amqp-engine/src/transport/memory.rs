//! In-process transport pair

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use super::{Error, Transport, TransportCallbacks};

#[derive(Debug, Default)]
struct Endpoint {
    callbacks: Option<TransportCallbacks>,
    pending: Vec<Bytes>,
    closed: bool,
}

/// One end of an in-process byte pipe
///
/// Bytes sent before the other end is opened are buffered and delivered once it
/// opens. Closing either end reports `Closed` to both.
#[derive(Debug)]
pub struct MemoryTransport {
    local: Arc<Mutex<Endpoint>>,
    remote: Arc<Mutex<Endpoint>>,
}

impl MemoryTransport {
    /// Creates two connected transports
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(Mutex::new(Endpoint::default()));
        let b = Arc::new(Mutex::new(Endpoint::default()));
        (
            Self {
                local: a.clone(),
                remote: b.clone(),
            },
            Self {
                local: b,
                remote: a,
            },
        )
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, callbacks: TransportCallbacks) -> Result<(), Error> {
        let mut local = self.local.lock();
        if local.callbacks.is_some() {
            return Err(Error::Io(std::io::ErrorKind::AlreadyExists.into()));
        }
        callbacks.on_open_complete();
        for bytes in local.pending.drain(..) {
            callbacks.on_bytes_received(bytes);
        }
        if local.closed {
            callbacks.on_close_complete();
        }
        local.callbacks = Some(callbacks);
        Ok(())
    }

    fn send(&mut self, bytes: Bytes) -> Result<(), Error> {
        let callbacks = self.local.lock().callbacks.clone().ok_or(Error::NotOpen)?;
        {
            let mut remote = self.remote.lock();
            if remote.closed {
                return Err(Error::Closed);
            }
            match &remote.callbacks {
                Some(peer) => peer.on_bytes_received(bytes),
                None => remote.pending.push(bytes),
            }
        }
        callbacks.on_send_complete();
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        let callbacks = {
            let mut local = self.local.lock();
            if local.closed {
                return Ok(());
            }
            local.closed = true;
            local.callbacks.clone()
        };
        {
            let mut remote = self.remote.lock();
            remote.closed = true;
            if let Some(peer) = &remote.callbacks {
                peer.on_close_complete();
            }
        }
        if let Some(callbacks) = callbacks {
            callbacks.on_close_complete();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::{mpsc, Notify};
    use tokio_test::assert_ok;

    use crate::transport::TransportEvent;

    use super::*;

    fn callbacks() -> (TransportCallbacks, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TransportCallbacks::new(tx, Arc::new(Notify::new())), rx)
    }

    #[test]
    fn bytes_sent_before_peer_opens_are_buffered() {
        let (mut a, mut b) = MemoryTransport::pair();
        let (a_callbacks, mut a_events) = callbacks();
        assert_ok!(a.open(a_callbacks));
        assert_ok!(a.send(Bytes::from_static(b"early")));

        let (b_callbacks, mut b_events) = callbacks();
        assert_ok!(b.open(b_callbacks));

        assert!(matches!(a_events.try_recv(), Ok(TransportEvent::Opened)));
        assert!(matches!(a_events.try_recv(), Ok(TransportEvent::SendComplete)));
        assert!(matches!(b_events.try_recv(), Ok(TransportEvent::Opened)));
        match b_events.try_recv() {
            Ok(TransportEvent::BytesReceived(bytes)) => assert_eq!(&bytes[..], b"early"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn close_is_seen_by_both_ends() {
        let (mut a, mut b) = MemoryTransport::pair();
        let (a_callbacks, mut a_events) = callbacks();
        let (b_callbacks, mut b_events) = callbacks();
        assert_ok!(a.open(a_callbacks));
        assert_ok!(b.open(b_callbacks));

        assert_ok!(a.close());
        assert!(matches!(a_events.try_recv(), Ok(TransportEvent::Opened)));
        assert!(matches!(a_events.try_recv(), Ok(TransportEvent::Closed)));
        assert!(matches!(b_events.try_recv(), Ok(TransportEvent::Opened)));
        assert!(matches!(b_events.try_recv(), Ok(TransportEvent::Closed)));
        assert!(matches!(b.send(Bytes::from_static(b"late")), Err(Error::Closed)));
    }
}
