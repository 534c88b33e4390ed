//! Message framing for the shuffle wire protocol.
//!
//! Every record on a connection is `[magic][length][payload]`: an 8-byte
//! magic, a big-endian u32 payload length, then a protobuf-encoded
//! [`Packets`] envelope. The codec works over any `AsyncRead`/`AsyncWrite`
//! via `FramedRead`/`FramedWrite`, and over the WebSocket path by feeding
//! binary frame payloads through [`ShuffleCodec::decode`] directly.

use bytes::{Buf, BufMut, BytesMut};
use prost::Message as _;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::proto::Packets;

/// Bytes starting each framed record.
pub const MAGIC_BYTES: [u8; 8] = [0x42, 0xBC, 0xC3, 0x26, 0x69, 0x46, 0x78, 0x73];

/// Magic plus the 4-byte length word.
pub const HEADER_LENGTH: usize = 12;

/// Upper bound on a single payload.
pub const MAX_MESSAGE_LENGTH: usize = 64 * 1024;

/// Framing and decode failures. All of these are fatal to the connection.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid magic")]
    InvalidMagic,
    #[error("invalid message length: {0}")]
    InvalidLength(usize),
    #[error("protobuf decode failed: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("protobuf encode failed: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// Stateless codec for framed [`Packets`] envelopes.
#[derive(Debug, Default)]
pub struct ShuffleCodec;

impl Decoder for ShuffleCodec {
    type Item = Packets;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packets>, FrameError> {
        if src.len() < HEADER_LENGTH {
            return Ok(None);
        }

        if src[..MAGIC_BYTES.len()] != MAGIC_BYTES {
            return Err(FrameError::InvalidMagic);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[MAGIC_BYTES.len()..HEADER_LENGTH]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len == 0 || len > MAX_MESSAGE_LENGTH {
            return Err(FrameError::InvalidLength(len));
        }

        if src.len() < HEADER_LENGTH + len {
            src.reserve(HEADER_LENGTH + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LENGTH);
        let payload = src.split_to(len);

        Ok(Some(Packets::decode(&payload[..])?))
    }
}

impl Encoder<&Packets> for ShuffleCodec {
    type Error = FrameError;

    fn encode(&mut self, msg: &Packets, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = msg.encoded_len();
        if len == 0 || len > MAX_MESSAGE_LENGTH {
            return Err(FrameError::InvalidLength(len));
        }

        dst.reserve(HEADER_LENGTH + len);
        dst.put_slice(&MAGIC_BYTES);
        dst.put_u32(len as u32);
        msg.encode(dst)?;

        Ok(())
    }
}

/// Encode one envelope into a standalone buffer, for transports that send
/// whole records rather than a byte stream (the WebSocket binary path).
pub fn encode_frame(msg: &Packets) -> Result<Vec<u8>, FrameError> {
    let mut buf = BytesMut::new();
    ShuffleCodec.encode(msg, &mut buf)?;
    Ok(buf.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Packet, Signed, VerificationKey};

    fn sample_envelope(key: &str) -> Packets {
        Packets {
            packet: vec![Signed {
                packet: Some(Packet {
                    session: b"sessionsessionsession1".to_vec(),
                    number: 1,
                    from_key: Some(VerificationKey { key: key.into() }),
                    ..Default::default()
                }),
                signature: None,
            }],
        }
    }

    #[test]
    fn roundtrip_through_codec() {
        let envelope = sample_envelope("vk1");
        let mut buf = BytesMut::new();
        ShuffleCodec.encode(&envelope, &mut buf).unwrap();

        let decoded = ShuffleCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, envelope);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_complete_header() {
        let envelope = sample_envelope("vk1");
        let mut full = BytesMut::new();
        ShuffleCodec.encode(&envelope, &mut full).unwrap();

        // Feed the frame one byte at a time; no partial read may produce a
        // message or an error.
        let mut partial = BytesMut::new();
        let total = full.len();
        for (i, byte) in full.iter().enumerate() {
            partial.put_u8(*byte);
            let result = ShuffleCodec.decode(&mut partial).unwrap();
            if i + 1 < total {
                assert!(result.is_none(), "decoded early at byte {}", i);
            } else {
                assert_eq!(result.unwrap(), envelope);
            }
        }
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0u8; HEADER_LENGTH]);
        assert!(matches!(
            ShuffleCodec.decode(&mut buf),
            Err(FrameError::InvalidMagic)
        ));
    }

    #[test]
    fn zero_length_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u32(0);
        assert!(matches!(
            ShuffleCodec.decode(&mut buf),
            Err(FrameError::InvalidLength(0))
        ));
    }

    #[test]
    fn oversize_length_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u32(MAX_MESSAGE_LENGTH as u32 + 1);
        assert!(matches!(
            ShuffleCodec.decode(&mut buf),
            Err(FrameError::InvalidLength(_))
        ));
    }

    #[test]
    fn garbage_payload_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u32(4);
        // A lone group-end tag can never be valid Packets.
        buf.put_slice(&[0x0c, 0x0c, 0x0c, 0x0c]);
        assert!(matches!(
            ShuffleCodec.decode(&mut buf),
            Err(FrameError::Decode(_))
        ));
    }

    #[test]
    fn two_frames_back_to_back() {
        let first = sample_envelope("vk1");
        let second = sample_envelope("vk2");

        let mut buf = BytesMut::new();
        ShuffleCodec.encode(&first, &mut buf).unwrap();
        ShuffleCodec.encode(&second, &mut buf).unwrap();

        assert_eq!(ShuffleCodec.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(ShuffleCodec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(ShuffleCodec.decode(&mut buf).unwrap().is_none());
    }
}
