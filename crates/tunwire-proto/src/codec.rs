//! Codec for framing control-channel messages on a byte stream
//!
//! Format: `[length: u32be][cmd: u8][id: u8][payload]`, where `length` counts
//! everything after the length field.

use crate::messages::{Message, ProtocolError};
use crate::{DEFAULT_MAX_MESSAGE_SIZE, MESSAGE_HEADER_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const LENGTH_FIELD_SIZE: usize = 4;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Length-prefixed message codec
#[derive(Debug, Clone)]
pub struct ChannelCodec {
    max_message_size: usize,
}

impl ChannelCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Default for ChannelCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Decoder for ChannelCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if src.len() < LENGTH_FIELD_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_FIELD_SIZE];
        length_bytes.copy_from_slice(&src[..LENGTH_FIELD_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_message_size {
            return Err(CodecError::MessageTooLarge(length));
        }
        if length < MESSAGE_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                what: "message header",
                len: length,
            }
            .into());
        }

        if src.len() < LENGTH_FIELD_SIZE + length {
            src.reserve(LENGTH_FIELD_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_SIZE);
        let body = src.split_to(length).freeze();

        Ok(Some(Message::decode(body)?))
    }
}

impl Encoder<Message> for ChannelCodec {
    type Error = CodecError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let length = message.encoded_len();
        if length > self.max_message_size {
            return Err(CodecError::MessageTooLarge(length));
        }

        dst.reserve(LENGTH_FIELD_SIZE + length);
        dst.put_u32(length as u32);
        message.encode_into(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Command;
    use bytes::Bytes;

    fn encoded(message: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        ChannelCodec::default().encode(message, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_encode_layout() {
        let buf = encoded(Message::data(0x07, Bytes::from_static(b"abc")));
        assert_eq!(&buf[..], &[0, 0, 0, 5, 0x02, 0x07, b'a', b'b', b'c']);
    }

    #[test]
    fn test_decode_incomplete() {
        let full = encoded(Message::close(0x11));
        let mut codec = ChannelCodec::default();

        // Only the length header
        let mut buf = BytesMut::from(&full[..4]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[4..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, Command::Close);
        assert_eq!(msg.id, 0x11);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_multiple() {
        let mut buf = encoded(Message::ping());
        buf.extend_from_slice(&encoded(Message::data(1, Bytes::from_static(b"x"))));

        let mut codec = ChannelCodec::default();
        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(first.command, Command::Ping);
        assert_eq!(second.command, Command::Data);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frames_rejected() {
        let mut codec = ChannelCodec::new(16);

        let mut buf = BytesMut::new();
        buf.put_u32(17);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::MessageTooLarge(17))
        ));

        let big = Message::data(1, Bytes::from(vec![0u8; 32]));
        assert!(matches!(
            codec.encode(big, &mut BytesMut::new()),
            Err(CodecError::MessageTooLarge(34))
        ));
    }
}
