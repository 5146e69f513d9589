//! AMQP frames and the codec between frames and bytes

pub mod amqp;
mod error;

pub use error::Error;

/// Frame type code of AMQP frames
pub const FRAME_TYPE_AMQP: u8 = 0x00;

/// Frame type code of SASL frames
pub const FRAME_TYPE_SASL: u8 = 0x01;

/// Size of the fixed frame header in bytes
pub const FRAME_HEADER_SIZE: usize = 8;
