//! The 8-byte protocol header exchanged before any frame

use std::convert::TryFrom;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::definitions::{MAJOR, MINOR, REVISION};

use super::Error;

const PROTOCOL_HEADER_PREFIX: &[u8; 4] = b"AMQP";

/// Length of a protocol header in bytes
pub const PROTOCOL_HEADER_SIZE: usize = 8;

/// Protocol header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolHeader {
    /// Protocol ID
    pub id: ProtocolId,

    /// Major number
    pub major: u8,

    /// Minor number
    pub minor: u8,

    /// Revision number
    pub revision: u8,
}

impl Default for ProtocolHeader {
    fn default() -> Self {
        Self::amqp()
    }
}

impl ProtocolHeader {
    /// The AMQP 1.0.0 header, `"AMQP" 0 1 0 0`
    pub fn amqp() -> Self {
        Self {
            id: ProtocolId::Amqp,
            major: MAJOR,
            minor: MINOR,
            revision: REVISION,
        }
    }

    /// Whether the header announces plain AMQP at the version this engine speaks
    pub fn is_supported(&self) -> bool {
        *self == Self::amqp()
    }
}

impl From<ProtocolHeader> for [u8; PROTOCOL_HEADER_SIZE] {
    fn from(value: ProtocolHeader) -> Self {
        let [a, m, q, p] = *PROTOCOL_HEADER_PREFIX;
        [a, m, q, p, value.id as u8, value.major, value.minor, value.revision]
    }
}

impl From<ProtocolHeader> for Bytes {
    fn from(header: ProtocolHeader) -> Self {
        let bytes: [u8; PROTOCOL_HEADER_SIZE] = header.into();
        Bytes::copy_from_slice(&bytes)
    }
}

impl TryFrom<[u8; PROTOCOL_HEADER_SIZE]> for ProtocolHeader {
    type Error = [u8; PROTOCOL_HEADER_SIZE];

    fn try_from(v: [u8; PROTOCOL_HEADER_SIZE]) -> Result<Self, Self::Error> {
        if &v[..4] != PROTOCOL_HEADER_PREFIX {
            return Err(v);
        }
        let id = ProtocolId::try_from(v[4]).map_err(|_| v)?;
        Ok(Self {
            id,
            major: v[5],
            minor: v[6],
            revision: v[7],
        })
    }
}

/// Protocol ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolId {
    /// AMQP
    Amqp = 0x0,

    /// TLS
    Tls = 0x2,

    /// SASL
    Sasl = 0x3,
}

impl TryFrom<u8> for ProtocolId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Amqp),
            0x2 => Ok(Self::Tls),
            0x3 => Ok(Self::Sasl),
            _ => Err(value),
        }
    }
}

/// Encoder and Decoder for protocol headers
#[derive(Debug, Clone, Default)]
pub struct ProtocolHeaderCodec {}

impl ProtocolHeaderCodec {
    /// Creates a new protocol header codec
    pub fn new() -> Self {
        Self {}
    }
}

impl Encoder<ProtocolHeader> for ProtocolHeaderCodec {
    type Error = Error;

    fn encode(&mut self, item: ProtocolHeader, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let buf: [u8; PROTOCOL_HEADER_SIZE] = item.into();
        dst.put_slice(&buf);
        Ok(())
    }
}

impl Decoder for ProtocolHeaderCodec {
    type Item = ProtocolHeader;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PROTOCOL_HEADER_SIZE {
            return Ok(None);
        }
        let mut buf = [0u8; PROTOCOL_HEADER_SIZE];
        buf.copy_from_slice(&src.split_to(PROTOCOL_HEADER_SIZE));
        ProtocolHeader::try_from(buf)
            .map(Some)
            .map_err(Error::ProtocolHeaderMismatch)
    }
}
