use std::io;

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// The peer sent something other than a protocol header
    #[error("Protocol header mismatch {0:?}")]
    ProtocolHeaderMismatch([u8; 8]),

    /// `send` was called before `open`
    #[error("Transport is not open")]
    NotOpen,

    /// The transport was closed
    #[error("Transport is closed")]
    Closed,

    /// No tokio runtime is available to drive the transport
    #[error("No tokio runtime available")]
    NoRuntime,
}
