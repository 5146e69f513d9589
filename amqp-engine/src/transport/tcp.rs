//! TCP transport driven by a background task

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    runtime::Handle,
    sync::mpsc,
    task::JoinHandle,
};

use super::{Error, Transport, TransportCallbacks};

const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// A TCP client transport
///
/// `open` spawns a task on the current tokio runtime that connects, then pumps
/// bytes in both directions until `close` is called or the peer disconnects.
#[derive(Debug)]
pub struct TcpTransport {
    host: String,
    port: u16,
    outgoing: Option<mpsc::UnboundedSender<Bytes>>,
    task: Option<JoinHandle<()>>,
}

impl TcpTransport {
    /// Creates a transport that connects to `host:port` when opened
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            outgoing: None,
            task: None,
        }
    }
}

impl Transport for TcpTransport {
    fn open(&mut self, callbacks: TransportCallbacks) -> Result<(), Error> {
        let handle = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = format!("{}:{}", self.host, self.port);
        self.outgoing = Some(tx);
        self.task = Some(handle.spawn(pump(addr, rx, callbacks)));
        Ok(())
    }

    fn send(&mut self, bytes: Bytes) -> Result<(), Error> {
        match &self.outgoing {
            Some(outgoing) => outgoing.send(bytes).map_err(|_| Error::Closed),
            None => Err(Error::NotOpen),
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        // Dropping the sender ends the write half, which shuts the socket down
        match self.outgoing.take() {
            Some(_) => Ok(()),
            None => Err(Error::NotOpen),
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            if self.outgoing.is_some() {
                task.abort();
            }
        }
    }
}

async fn pump(
    addr: String,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
    callbacks: TransportCallbacks,
) {
    let stream = match TcpStream::connect(&addr).await {
        Ok(stream) => stream,
        Err(error) => {
            #[cfg(feature = "tracing")]
            tracing::error!(%addr, ?error, "tcp connect failed");
            #[cfg(feature = "log")]
            log::error!("tcp connect to {} failed: {:?}", addr, error);
            callbacks.on_error(error);
            return;
        }
    };
    callbacks.on_open_complete();

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    loop {
        tokio::select! {
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    callbacks.on_close_complete();
                    break;
                }
                Ok(_) => callbacks.on_bytes_received(buf.split().freeze()),
                Err(error) => {
                    callbacks.on_error(error);
                    break;
                }
            },
            bytes = outgoing.recv() => match bytes {
                Some(bytes) => match writer.write_all(&bytes).await {
                    Ok(()) => callbacks.on_send_complete(),
                    Err(error) => {
                        callbacks.on_error(error);
                        break;
                    }
                },
                None => {
                    let _ = writer.shutdown().await;
                    callbacks.on_close_complete();
                    break;
                }
            },
        }
    }
}
