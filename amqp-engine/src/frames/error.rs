use std::io;

/// Frame level errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// The frame body could not be decoded
    #[error("Decode Error {0}")]
    Decode(serde_amqp::Error),

    /// A performative could not be encoded
    #[error("Encode Error {0}")]
    Encode(serde_amqp::Error),

    /// The frame violates the framing rules
    #[error("Framing Error: {0}")]
    FramingError(&'static str),

    /// The frame type or header layout is not supported
    #[error("AmqpError: NotImplemented")]
    NotImplemented,
}

impl From<serde_amqp::Error> for Error {
    fn from(err: serde_amqp::Error) -> Self {
        Self::Encode(err)
    }
}
