//! Connection builder

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use url::Url;

use crate::{
    definitions::{AmqpError, Fields, MIN_MAX_FRAME_SIZE},
    transport::{TcpTransport, Transport, TransportCallbacks},
};

use super::{engine::ConnectionEngine, Connection, ConnectionCore, ConnectionEvents, Error};

/// Default AMQP port
pub const DEFAULT_PORT: u16 = 5672;

/// Default max-frame-size
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 256 * 1024;

/// Default channel-max
pub const DEFAULT_CHANNEL_MAX: u16 = 255;

/// Default idle timeout
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Options of a [`Connection`]
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Container id sent in OPEN, a random UUID by default
    pub container_id: String,

    /// Host name sent in OPEN and used by the default TCP transport
    pub host_name: Option<String>,

    /// Port used by the default TCP transport
    pub port: u16,

    /// Longest silence accepted from the peer, `None` disables the check
    pub idle_timeout: Option<Duration>,

    /// Largest frame this end accepts
    pub max_frame_size: u32,

    /// Highest channel number this end accepts
    pub max_channel_count: u16,

    /// Connection properties sent in OPEN
    pub properties: Option<Fields>,

    /// Trace every frame sent and received
    pub enable_trace: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            container_id: uuid::Uuid::new_v4().to_string(),
            host_name: None,
            port: DEFAULT_PORT,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_channel_count: DEFAULT_CHANNEL_MAX,
            properties: None,
            enable_trace: false,
        }
    }
}

/// Builder of [`Connection`]
#[derive(Default)]
pub struct Builder {
    options: ConnectionOptions,
    transport: Option<Box<dyn Transport>>,
    events: Option<Arc<dyn ConnectionEvents>>,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("options", &self.options)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl Builder {
    /// Creates a builder with default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every option
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Container id
    pub fn container_id(mut self, id: impl Into<String>) -> Self {
        self.options.container_id = id.into();
        self
    }

    /// Host name
    pub fn host_name(mut self, host_name: impl Into<String>) -> Self {
        self.options.host_name = Some(host_name.into());
        self
    }

    /// Port
    pub fn port(mut self, port: u16) -> Self {
        self.options.port = port;
        self
    }

    /// Sets host name and port from an `amqp://host[:port]` url
    pub fn url(mut self, url: &str) -> Result<Self, Error> {
        let url = Url::parse(url)?;
        if url.scheme() != "amqp" {
            return Err(Error::amqp_error(
                AmqpError::NotImplemented,
                format!("unsupported scheme {}", url.scheme()),
            ));
        }
        let host = url.host_str().ok_or_else(|| {
            Error::amqp_error(AmqpError::InvalidField, String::from("url has no host"))
        })?;
        self.options.host_name = Some(host.to_string());
        self.options.port = url.port().unwrap_or(DEFAULT_PORT);
        Ok(self)
    }

    /// Local idle timeout, `None` disables it
    pub fn idle_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.options.idle_timeout = timeout.into();
        self
    }

    /// Largest frame this end accepts, at least 512
    pub fn max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.options.max_frame_size = max_frame_size.max(MIN_MAX_FRAME_SIZE as u32);
        self
    }

    /// Highest channel number this end accepts
    pub fn channel_max(mut self, channel_max: u16) -> Self {
        self.options.max_channel_count = channel_max;
        self
    }

    /// Connection properties
    pub fn properties(mut self, properties: Fields) -> Self {
        self.options.properties = Some(properties);
        self
    }

    /// Trace every frame
    pub fn enable_trace(mut self, enable: bool) -> Self {
        self.options.enable_trace = enable;
        self
    }

    /// Carries the connection over `transport` instead of TCP
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Connection events
    pub fn events(mut self, events: Arc<dyn ConnectionEvents>) -> Self {
        self.events = Some(events);
        self
    }

    /// Builds the connection. Nothing is sent until it is opened.
    pub fn build(self) -> Result<Connection, Error> {
        let options = self.options;
        let transport = match self.transport {
            Some(transport) => transport,
            None => {
                let host = options.host_name.clone().ok_or_else(|| {
                    Error::amqp_error(
                        AmqpError::InvalidField,
                        String::from("a host name or a transport is required"),
                    )
                })?;
                Box::new(TcpTransport::new(host, options.port))
            }
        };

        let notify = Arc::new(Notify::new());
        let (sender, receiver) = mpsc::unbounded_channel();
        let callbacks = TransportCallbacks::new(sender, notify.clone());
        let container_id = options.container_id.clone();
        let engine = ConnectionEngine::new(
            options,
            transport,
            receiver,
            callbacks,
            self.events.is_some(),
        );

        Ok(Connection::from_core(Arc::new(ConnectionCore {
            engine: Mutex::new(engine),
            notify,
            container_id,
            listener: self.events,
        })))
    }
}
