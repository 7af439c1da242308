//! Delimiter-terminated framing (`...\r\n`, `...\n`, or any byte string).

use bytes::{Bytes, BytesMut};

use crate::codec::{find, Decoder, Encoder, Payload};

/// Reads frames terminated by a fixed, non-empty delimiter. The frame is
/// everything before the delimiter; an empty frame is valid.
pub struct LineDecoder<P> {
    delimiter: Vec<u8>,
    payload: P,
}

impl<P> LineDecoder<P> {
    pub fn new(payload: P, delimiter: impl Into<Vec<u8>>) -> Self {
        let delimiter = delimiter.into();
        assert!(!delimiter.is_empty(), "line delimiter must not be empty");
        Self { delimiter, payload }
    }
}

impl<P: Payload> Decoder for LineDecoder<P> {
    type Message = P::Message;

    fn try_parse(&mut self, buf: &[u8]) -> (usize, Option<Bytes>) {
        match find(buf, &self.delimiter) {
            Some(at) => (
                at + self.delimiter.len(),
                Some(Bytes::copy_from_slice(&buf[..at])),
            ),
            None => (0, None),
        }
    }

    fn convert(&mut self, frame: Bytes) -> Self::Message {
        self.payload.decode(&frame)
    }
}

/// Writes one payload plus the fixed delimiter per message.
pub struct LineEncoder<P> {
    delimiter: Vec<u8>,
    payload: P,
}

impl<P> LineEncoder<P> {
    pub fn new(payload: P, delimiter: impl Into<Vec<u8>>) -> Self {
        let delimiter = delimiter.into();
        assert!(!delimiter.is_empty(), "line delimiter must not be empty");
        Self { delimiter, payload }
    }
}

impl<P: Payload> Encoder for LineEncoder<P> {
    type Message = P::Message;

    fn write_message(&mut self, message: &Self::Message, buf: &mut BytesMut) -> bool {
        if !self.payload.encode(message, buf) {
            return false;
        }
        buf.extend_from_slice(&self.delimiter);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::StringPayload;

    #[test]
    fn frames_split_on_delimiter() {
        let mut dec = LineDecoder::new(StringPayload, "\r\n");
        let (consumed, frame) = dec.try_parse(b"Message 1\r\nMessage 2\r\n");
        assert_eq!(consumed, 11);
        assert_eq!(frame.as_deref(), Some(b"Message 1".as_ref()));
    }

    #[test]
    fn partial_frame_consumes_nothing() {
        let mut dec = LineDecoder::new(StringPayload, "\r\n");
        // Delimiter split across reads: the first half must stay put.
        let (consumed, frame) = dec.try_parse(b"half a line\r");
        assert_eq!(consumed, 0);
        assert!(frame.is_none());

        let (consumed, frame) = dec.try_parse(b"half a line\r\n");
        assert_eq!(consumed, 13);
        assert_eq!(frame.as_deref(), Some(b"half a line".as_ref()));
    }

    #[test]
    fn empty_frame_is_a_valid_message() {
        let mut dec = LineDecoder::new(StringPayload, "\n");
        let (consumed, frame) = dec.try_parse(b"\nrest");
        assert_eq!(consumed, 1);
        assert_eq!(frame.as_deref(), Some(b"".as_ref()));
    }

    #[test]
    fn encoder_appends_delimiter() {
        let mut enc = LineEncoder::new(StringPayload, "\r\n");
        let mut buf = BytesMut::new();
        assert!(enc.write_message(&"hello".to_string(), &mut buf));
        assert_eq!(&buf[..], b"hello\r\n");
    }

    #[test]
    fn round_trip_preserves_order() {
        let mut enc = LineEncoder::new(StringPayload, "\r\n");
        let mut dec = LineDecoder::new(StringPayload, "\r\n");

        let mut wire = BytesMut::new();
        let messages = ["Message 1", "Message 2", "", "Message 4"];
        for m in messages {
            assert!(enc.write_message(&m.to_string(), &mut wire));
        }

        let mut offset = 0;
        let mut decoded = Vec::new();
        loop {
            let (consumed, frame) = dec.try_parse(&wire[offset..]);
            offset += consumed;
            match frame {
                Some(f) => decoded.push(dec.convert(f)),
                None => break,
            }
        }
        assert_eq!(decoded, messages);
    }
}
