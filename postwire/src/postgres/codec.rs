//! Incremental packet framing.
use bytes::{Buf, Bytes, BytesMut};

use super::{BackendMessage, BackendProtocol, EncodeError, FrontendMessage, ProtocolError};

/// Backend message header, 1 byte message type and 4 bytes length.
pub const HEADER_LEN: usize = 5;

/// Upper bound of buffer reserved ahead for a partially received frame.
const MAX_RESERVE: usize = 64 * 1024;

/// Split backend messages out of a byte stream.
///
/// Bytes can be fed in arbitrary chunk, message is only decoded when
/// the whole frame is available.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buf: BytesMut,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: BytesMut::with_capacity(capacity) }
    }

    /// Append bytes received from the backend.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Underlying buffer, used for reading directly from io.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Number of bytes not yet decoded.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discard all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Returns the message type and body of the next complete frame.
    ///
    /// Returns `Ok(None)` if more bytes are required.
    pub fn decode_frame(&mut self) -> Result<Option<(u8, Bytes)>, ProtocolError> {
        let Some(mut header) = self.buf.get(..HEADER_LEN) else {
            return Ok(None);
        };

        let msgtype = header.get_u8();
        let len = header.get_i32();

        // length includes itself
        if len < 4 {
            return Err(ProtocolError::InvalidLength { msgtype, len });
        }

        let frame_len = len as usize + 1;
        if self.buf.len() < frame_len {
            // length is untrusted until the bytes arrive
            self.buf.reserve((frame_len - self.buf.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        let mut frame = self.buf.split_to(frame_len).freeze();
        frame.advance(HEADER_LEN);

        Ok(Some((msgtype, frame)))
    }

    /// Decode next complete message.
    ///
    /// Returns `Ok(None)` if more bytes are required. Partially received
    /// message is left untouched in the buffer.
    pub fn decode(&mut self) -> Result<Option<BackendMessage>, ProtocolError> {
        match self.decode_frame()? {
            Some((msgtype, body)) => BackendMessage::decode(msgtype, body).map(Some),
            None => Ok(None),
        }
    }
}

/// Buffer frontend messages to be written in one go.
#[derive(Debug, Default)]
pub struct PacketEncoder {
    buf: BytesMut,
}

impl PacketEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message.
    ///
    /// On error, buffer is left unchanged.
    pub fn encode<'a>(&mut self, message: impl Into<FrontendMessage<'a>>) -> Result<(), EncodeError> {
        message.into().write(&mut self.buf)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take all encoded bytes.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;

    use super::*;
    use crate::postgres::{
        backend::{CommandComplete, DataRow, ParseComplete, ReadyForQuery, ReadyState},
        frontend::{Execute, Sync},
    };

    fn script(messages: &[BackendMessage]) -> BytesMut {
        let mut buf = BytesMut::new();
        for message in messages {
            message.write(&mut buf);
        }
        buf
    }

    #[test]
    fn large_frame_reserve_is_bounded() {
        let mut decoder = PacketDecoder::new();
        decoder.feed(&[b'D', 0x7f, 0xff, 0xff, 0xf0, 0, 1]);

        assert!(decoder.decode().unwrap().is_none());
        assert_eq!(decoder.len(), 7);
        assert!(decoder.buffer_mut().capacity() <= MAX_RESERVE + 64, "{}", decoder.buffer_mut().capacity());
    }

    #[test]
    fn decode_across_chunks() {
        let bytes = script(&[
            ParseComplete.into(),
            DataRow { values: vec![Some(Bytes::from_static(b"hello"))] }.into(),
            CommandComplete { tag: "SELECT 1".into() }.into(),
            ReadyForQuery { state: ReadyState::Idle }.into(),
        ]);

        // every split point must yield the same messages
        for chunk in 1..bytes.len() {
            let mut decoder = PacketDecoder::new();
            let mut messages = vec![];
            for part in bytes.chunks(chunk) {
                decoder.feed(part);
                while let Some(message) = decoder.decode().unwrap() {
                    messages.push(message);
                }
            }
            assert!(decoder.is_empty());
            assert_eq!(messages.len(), 4);
            assert_eq!(messages[0], BackendMessage::ParseComplete(ParseComplete));
            assert_eq!(messages[3], ReadyForQuery { state: ReadyState::Idle }.into());
        }
    }

    #[test]
    fn partial_frame_untouched() {
        let bytes = script(&[CommandComplete { tag: "BEGIN".into() }.into()]);
        let mut decoder = PacketDecoder::new();
        decoder.feed(&bytes[..3]);
        assert!(decoder.decode().unwrap().is_none());
        assert_eq!(decoder.len(), 3);

        decoder.feed(&bytes[3..bytes.len() - 1]);
        assert!(decoder.decode().unwrap().is_none());
        assert_eq!(decoder.len(), bytes.len() - 1);

        decoder.feed(&bytes[bytes.len() - 1..]);
        let message = decoder.decode().unwrap().unwrap();
        assert_eq!(message, CommandComplete { tag: "BEGIN".into() }.into());
    }

    #[test]
    fn invalid_length() {
        let mut decoder = PacketDecoder::new();
        decoder.feed(&[b'Z', 0, 0, 0, 3, b'I']);
        let err = decoder.decode().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidLength { msgtype: b'Z', len: 3 }));
    }

    #[test]
    fn truncated_body() {
        // ReadyForQuery with empty body
        let mut decoder = PacketDecoder::new();
        decoder.feed(&[b'Z', 0, 0, 0, 4]);
        let err = decoder.decode().unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated));
        assert!(decoder.is_empty());
    }

    #[test]
    fn encoder_batch() {
        let mut encoder = PacketEncoder::new();
        encoder.encode(Execute { portal_name: "", max_row: 0 }).unwrap();
        encoder.encode(Sync).unwrap();
        let bytes = encoder.take();
        assert_eq!(&bytes[..], b"E\0\0\0\x09\0\0\0\0\0S\0\0\0\x04");
        assert!(encoder.is_empty());
    }
}
