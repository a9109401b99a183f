//! Framed codec for control-channel messages.
//!
//! Frame format:
//! ```text
//! +--------+--------+------------------+
//! | Magic  | Length |     Payload      |
//! | "TREC" | u32 LE |  (JSON, Length)  |
//! +--------+--------+------------------+
//! | 4 bytes| 4 bytes|   Length bytes   |
//! ```

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::messages::Envelope;

/// Magic bytes for the frame header.
pub const MAGIC: [u8; 4] = *b"TREC";

/// Frame header size: 4 (magic) + 4 (length) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum frame payload size (1 MB). Control messages are small;
/// anything larger is a corrupt stream.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Codec for [`Envelope`] frames, usable with `tokio_util::codec::Framed`.
#[derive(Debug, Default)]
pub struct ControlCodec {
    _private: (),
}

impl ControlCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder<Envelope> for ControlCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;
        if payload.len() as u32 > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(
                payload.len() as u32,
                MAX_FRAME_SIZE,
            ));
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&MAGIC);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for ControlCodec {
    type Item = Envelope;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&src[0..4]);
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let len = u32::from_le_bytes([src[4], src[5], src[6], src[7]]);
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(len, MAX_FRAME_SIZE));
        }

        let total = HEADER_SIZE + len as usize;
        if src.len() < total {
            // Not enough data yet; reserve what we still expect.
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(len as usize);
        let msg: Envelope = serde_json::from_slice(&payload)?;
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Request, RequestOp};

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();

        let msg = Envelope::Request(Request {
            id: 9,
            op: RequestOp::DeleteRecorded { recorded_id: 21 },
        });

        codec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(&buf[0..4], b"TREC");

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_frame() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();

        let msg = Envelope::Notification(crate::messages::Notification::ClientStateChanged);
        codec.encode(msg.clone(), &mut buf).unwrap();

        // Feed the frame one byte short; decode must wait for more data.
        let full = buf.clone();
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.put_u8(full[full.len() - 1]);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), msg);
    }

    #[test]
    fn test_decode_bad_magic() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::from(&b"XXXX\x00\x00\x00\x00"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::InvalidMagic(_))
        ));
    }
}
