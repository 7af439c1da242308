//! Framing contracts.
//!
//! A [`Decoder`] isolates one frame per [`try_parse`](Decoder::try_parse)
//! match and materializes the caller-visible message with
//! [`convert`](Decoder::convert). An [`Encoder`] formats one message per
//! [`write_message`](Encoder::write_message) call. Both are byte-level;
//! the [`Payload`] trait plugs the message type into the line and
//! delimited framer families without duplicating their scanning logic.

use bytes::{Bytes, BytesMut};

/// Converts between a raw frame body and the user message type.
pub trait Payload: Send {
    type Message: Send + 'static;

    /// Materialize a message from one frame body.
    fn decode(&mut self, frame: &[u8]) -> Self::Message;

    /// Append the message body to `buf`. Returning `false` aborts the
    /// enclosing frame write.
    fn encode(&mut self, message: &Self::Message, buf: &mut BytesMut) -> bool;
}

/// Pull-side framer.
pub trait Decoder: Send {
    type Message: Send + 'static;

    /// Scan `buf` for one frame. Returns how many leading bytes were
    /// consumed (frame bytes, delimiters, and discarded noise) and the
    /// isolated frame, if one was complete. Returning `(n, None)` with
    /// `n > 0` drops noise without emitting a frame.
    fn try_parse(&mut self, buf: &[u8]) -> (usize, Option<Bytes>);

    /// Materialize the caller-visible message.
    fn convert(&mut self, frame: Bytes) -> Self::Message;
}

/// Push-side framer.
pub trait Encoder: Send {
    type Message: Send + 'static;

    /// Format one frame. Returning `false` aborts the write; the caller
    /// discards whatever was appended.
    fn write_message(&mut self, message: &Self::Message, buf: &mut BytesMut) -> bool;
}

/// Locate `needle` in `haystack`.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() == 1 {
        let b = needle[0];
        return haystack.iter().position(|x| *x == b);
    }
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
