//! AMQP frame type and corresponding encoder and decoder

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_amqp::{de::Deserializer, read::IoReader, ser::Serializer};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::{
    definitions::MIN_MAX_FRAME_SIZE,
    performatives::{
        Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Performative, Transfer,
    },
};

use super::{Error, FRAME_HEADER_SIZE, FRAME_TYPE_AMQP, FRAME_TYPE_SASL};

/// AMQP frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// AMQP frame channel
    pub channel: u16,

    /// AMQP frame body
    pub body: FrameBody,
}

impl Frame {
    /// Creates a new AMQP frame
    pub fn new(channel: impl Into<u16>, body: FrameBody) -> Self {
        Self {
            channel: channel.into(),
            body,
        }
    }

    /// Get the channel of the frame
    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// Get the body of the frame
    pub fn body(&self) -> &FrameBody {
        &self.body
    }

    /// Consume the frame to get the frame body
    pub fn into_body(self) -> FrameBody {
        self.body
    }

    /// Creates an empty frame, which only resets the remote idle timer
    pub fn empty() -> Self {
        Self {
            channel: 0,
            body: FrameBody::Empty,
        }
    }
}

/// AMQP frame body
#[derive(Clone)]
pub enum FrameBody {
    /// Open performative
    Open(Open),

    /// Begin performative
    Begin(Begin),

    /// Attach performative
    Attach(Attach),

    /// Flow performative
    Flow(Flow),

    /// Transfer performative and payload
    Transfer {
        /// Transfer performative
        performative: Transfer,

        /// Binary payload
        payload: Bytes,
    },

    /// Disposition performative
    Disposition(Disposition),

    /// Detach performative
    Detach(Detach),

    /// End performative
    End(End),

    /// Close performative
    Close(Close),

    /// An empty frame used only for resetting idle timeout
    Empty,
}

impl FrameBody {
    /// Name of the carried performative, `EMPTY` for a heartbeat
    pub fn name(&self) -> &'static str {
        match self {
            FrameBody::Open(_) => "OPEN",
            FrameBody::Begin(_) => "BEGIN",
            FrameBody::Attach(_) => "ATTACH",
            FrameBody::Flow(_) => "FLOW",
            FrameBody::Transfer { .. } => "TRANSFER",
            FrameBody::Disposition(_) => "DISPOSITION",
            FrameBody::Detach(_) => "DETACH",
            FrameBody::End(_) => "END",
            FrameBody::Close(_) => "CLOSE",
            FrameBody::Empty => "EMPTY",
        }
    }
}

impl std::fmt::Debug for FrameBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(arg0) => f.debug_tuple("Open").field(arg0).finish(),
            Self::Begin(arg0) => f.debug_tuple("Begin").field(arg0).finish(),
            Self::Attach(arg0) => f.debug_tuple("Attach").field(arg0).finish(),
            Self::Flow(arg0) => f.debug_tuple("Flow").field(arg0).finish(),
            Self::Transfer {
                performative,
                payload,
            } => f
                .debug_struct("Transfer")
                .field("performative", performative)
                .field("payload.len", &payload.len())
                .finish(),
            Self::Disposition(arg0) => f.debug_tuple("Disposition").field(arg0).finish(),
            Self::Detach(arg0) => f.debug_tuple("Detach").field(arg0).finish(),
            Self::End(arg0) => f.debug_tuple("End").field(arg0).finish(),
            Self::Close(arg0) => f.debug_tuple("Close").field(arg0).finish(),
            Self::Empty => write!(f, "Empty"),
        }
    }
}

impl From<Performative> for FrameBody {
    fn from(performative: Performative) -> Self {
        match performative {
            Performative::Open(p) => FrameBody::Open(p),
            Performative::Begin(p) => FrameBody::Begin(p),
            Performative::Attach(p) => FrameBody::Attach(p),
            Performative::Flow(p) => FrameBody::Flow(p),
            Performative::Transfer(performative) => FrameBody::Transfer {
                performative,
                payload: Bytes::new(),
            },
            Performative::Disposition(p) => FrameBody::Disposition(p),
            Performative::Detach(p) => FrameBody::Detach(p),
            Performative::End(p) => FrameBody::End(p),
            Performative::Close(p) => FrameBody::Close(p),
        }
    }
}

/// Encoder and decoder of AMQP frames
///
/// Outgoing frames are bounded by the peer's max-frame-size and incoming frames by
/// the local one. Deliveries larger than a frame are split by the sending link, so
/// every transfer handed to the encoder must already fit.
#[derive(Debug)]
pub struct FrameCodec {
    length_codec: LengthDelimitedCodec,
    remote_max_frame_size: usize,
}

fn length_codec(local_max_frame_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .big_endian()
        .length_field_length(4)
        .length_adjustment(-4)
        .max_frame_length(local_max_frame_size - 4)
        .new_codec()
}

fn write_header(dst: &mut BytesMut, size: usize, channel: u16) {
    dst.reserve(size);
    dst.put_u32(size as u32);
    // AMQP frames carry no extended header, thus doff is always 2
    dst.put_u8(2);
    dst.put_u8(FRAME_TYPE_AMQP);
    dst.put_u16(channel);
}

/// Number of bytes `performative` occupies in a frame body
pub(crate) fn performative_size(performative: &Performative) -> Result<usize, Error> {
    let mut buf = BytesMut::new();
    let mut serializer = Serializer::from((&mut buf).writer());
    performative.serialize(&mut serializer)?;
    Ok(buf.len())
}

impl FrameCodec {
    /// Creates a codec. Both limits start at `max_frame_size` until the peer's OPEN
    /// is seen.
    pub fn new(max_frame_size: u32) -> Self {
        let max_frame_size = (max_frame_size as usize).max(MIN_MAX_FRAME_SIZE);
        Self {
            length_codec: length_codec(max_frame_size),
            remote_max_frame_size: max_frame_size,
        }
    }

    /// Sets the largest frame the peer accepts
    pub fn set_remote_max_frame_size(&mut self, max_frame_size: u32) {
        self.remote_max_frame_size = (max_frame_size as usize).max(MIN_MAX_FRAME_SIZE);
    }

    /// The largest frame the peer accepts
    pub fn remote_max_frame_size(&self) -> usize {
        self.remote_max_frame_size
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (performative, payload) = match item.body {
            FrameBody::Open(p) => (Performative::Open(p), None),
            FrameBody::Begin(p) => (Performative::Begin(p), None),
            FrameBody::Attach(p) => (Performative::Attach(p), None),
            FrameBody::Flow(p) => (Performative::Flow(p), None),
            FrameBody::Transfer {
                performative,
                payload,
            } => (Performative::Transfer(performative), Some(payload)),
            FrameBody::Disposition(p) => (Performative::Disposition(p), None),
            FrameBody::Detach(p) => (Performative::Detach(p), None),
            FrameBody::End(p) => (Performative::End(p), None),
            FrameBody::Close(p) => (Performative::Close(p), None),
            FrameBody::Empty => {
                write_header(dst, FRAME_HEADER_SIZE, item.channel);
                return Ok(());
            }
        };

        let mut body = BytesMut::new();
        let mut serializer = Serializer::from((&mut body).writer());
        performative.serialize(&mut serializer)?;
        if let Some(payload) = payload {
            body.put(payload);
        }

        let size = FRAME_HEADER_SIZE + body.len();
        if size > self.remote_max_frame_size {
            return Err(Error::FramingError("frame exceeds max-frame-size"));
        }
        write_header(dst, size, item.channel);
        dst.put(body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut src = match self.length_codec.decode(src) {
            Ok(Some(src)) => src,
            Ok(None) => return Ok(None),
            Err(_) => return Err(Error::FramingError("frame size out of bounds")),
        };

        if src.len() < FRAME_HEADER_SIZE - 4 {
            return Err(Error::FramingError("frame shorter than its header"));
        }
        let doff = src.get_u8() as usize;
        let ftype = src.get_u8();
        let channel = src.get_u16();

        match ftype {
            FRAME_TYPE_AMQP => {}
            FRAME_TYPE_SASL => return Err(Error::NotImplemented),
            _ => return Err(Error::FramingError("unknown frame type")),
        }

        // doff counts 4-byte words including the 8 byte fixed header
        let extended = (doff * 4)
            .checked_sub(FRAME_HEADER_SIZE)
            .ok_or(Error::FramingError("data offset smaller than the frame header"))?;
        if extended > src.len() {
            return Err(Error::FramingError("data offset beyond frame end"));
        }
        src.advance(extended);

        let body = if src.is_empty() {
            FrameBody::Empty
        } else {
            let reader = IoReader::new((&mut src).reader());
            let mut deserializer = Deserializer::new(reader);
            let performative: Performative =
                Deserialize::deserialize(&mut deserializer).map_err(Error::Decode)?;

            match performative {
                Performative::Transfer(performative) => FrameBody::Transfer {
                    performative,
                    payload: src.split().freeze(),
                },
                other => FrameBody::from(other),
            }
        };

        Ok(Some(Frame { channel, body }))
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use serde_bytes::ByteBuf;
    use tokio_test::{assert_err, assert_ok};
    use tokio_util::codec::{Decoder, Encoder};

    use crate::{
        definitions::Handle,
        performatives::{Close, Transfer},
    };

    use super::*;

    fn transfer(delivery_id: u32) -> Transfer {
        Transfer {
            handle: Handle(0),
            delivery_id: Some(delivery_id),
            delivery_tag: Some(ByteBuf::from(vec![0, 0, 0, 1])),
            message_format: Some(0),
            settled: Some(false),
            more: false,
            rcv_settle_mode: None,
            state: None,
            resume: false,
            aborted: false,
            batchable: false,
        }
    }

    #[test]
    fn empty_frame_is_a_bare_header() {
        let mut codec = FrameCodec::new(512);
        let mut dst = BytesMut::new();
        assert_ok!(codec.encode(Frame::empty(), &mut dst));
        assert_eq!(&dst[..], &[0x00, 0x00, 0x00, 0x08, 0x02, 0x00, 0x00, 0x00]);

        let frame = assert_ok!(codec.decode(&mut dst)).expect("a whole frame");
        assert!(matches!(frame.body, FrameBody::Empty));
        assert!(dst.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = FrameCodec::new(512);
        let mut full = BytesMut::new();
        assert_ok!(codec.encode(Frame::new(3u16, FrameBody::Close(Close::new(None))), &mut full));

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(assert_ok!(codec.decode(&mut partial)).is_none());
        partial.extend_from_slice(&full[full.len() - 1..]);
        let frame = assert_ok!(codec.decode(&mut partial)).expect("a whole frame");
        assert_eq!(frame.channel, 3);
        assert!(matches!(frame.body, FrameBody::Close(Close { error: None })));
    }

    #[test]
    fn transfer_payload_follows_the_performative() {
        let mut codec = FrameCodec::new(512);
        let payload: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        let mut dst = BytesMut::new();
        assert_ok!(codec.encode(
            Frame::new(
                1u16,
                FrameBody::Transfer {
                    performative: transfer(7),
                    payload: Bytes::from(payload.clone()),
                },
            ),
            &mut dst,
        ));

        let frame = assert_ok!(codec.decode(&mut dst)).expect("a whole frame");
        assert!(dst.is_empty());
        match frame.body {
            FrameBody::Transfer {
                performative,
                payload: received,
            } => {
                assert_eq!(performative.handle, Handle(0));
                assert_eq!(performative.delivery_id, Some(7));
                assert!(!performative.more);
                assert_eq!(&received[..], &payload[..]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn oversized_transfer_is_not_encoded() {
        let mut codec = FrameCodec::new(512);
        let mut dst = BytesMut::new();
        let result = codec.encode(
            Frame::new(
                0u16,
                FrameBody::Transfer {
                    performative: transfer(0),
                    payload: Bytes::from(vec![0u8; 1000]),
                },
            ),
            &mut dst,
        );
        assert!(matches!(result, Err(Error::FramingError(_))));
        assert!(dst.is_empty());
    }

    #[test]
    fn frame_larger_than_local_limit_is_rejected() {
        let mut sender = FrameCodec::new(4096);
        let mut dst = BytesMut::new();
        assert_ok!(sender.encode(
            Frame::new(
                0u16,
                FrameBody::Transfer {
                    performative: transfer(0),
                    payload: Bytes::from(vec![0u8; 1000]),
                },
            ),
            &mut dst,
        ));

        let mut receiver = FrameCodec::new(512);
        assert!(matches!(
            receiver.decode(&mut dst),
            Err(Error::FramingError(_))
        ));
    }

    #[test]
    fn frame_body_of_zero_bytes_is_a_decode_error() {
        let body_len = 200_000;
        let mut codec = FrameCodec::new(1 << 20);
        let mut src = BytesMut::new();
        write_header(&mut src, FRAME_HEADER_SIZE + body_len, 0);
        src.put_bytes(0x00, body_len);

        let result = codec.decode(&mut src);
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn truncated_performative_is_a_decode_error() {
        let mut codec = FrameCodec::new(512);
        let mut full = BytesMut::new();
        assert_ok!(codec.encode(Frame::new(0u16, FrameBody::Close(Close::new(None))), &mut full));

        // Rewrite the size so the frame ends in the middle of the performative
        let cut = full.len() - 1;
        let mut src = BytesMut::new();
        src.put_u32(cut as u32);
        src.put_slice(&full[4..cut]);
        assert_err!(codec.decode(&mut src));
    }

    #[test]
    fn sasl_frames_are_not_supported() {
        let mut codec = FrameCodec::new(512);
        let mut src = BytesMut::from(&[0x00, 0x00, 0x00, 0x08, 0x02, 0x01, 0x00, 0x00][..]);
        assert!(matches!(codec.decode(&mut src), Err(Error::NotImplemented)));
    }
}
