//! String message payloads and the common string framer aliases.

use bytes::BytesMut;

use crate::codec::Payload;
use crate::delimited::{DelimitedDecoder, DelimitedEncoder};
use crate::line::{LineDecoder, LineEncoder};

/// UTF-8 text payload. Decoding is lossy: a frame is whatever the peer
/// sent, replacement characters included.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringPayload;

impl Payload for StringPayload {
    type Message = String;

    fn decode(&mut self, frame: &[u8]) -> String {
        String::from_utf8_lossy(frame).into_owned()
    }

    fn encode(&mut self, message: &String, buf: &mut BytesMut) -> bool {
        buf.extend_from_slice(message.as_bytes());
        true
    }
}

pub type StringLineDecoder = LineDecoder<StringPayload>;
pub type StringLineEncoder = LineEncoder<StringPayload>;
pub type StringDelimitedDecoder = DelimitedDecoder<StringPayload>;
pub type StringDelimitedEncoder = DelimitedEncoder<StringPayload>;

impl StringLineDecoder {
    /// Line-framed strings with the given delimiter.
    pub fn strings(delimiter: impl Into<Vec<u8>>) -> Self {
        LineDecoder::new(StringPayload, delimiter)
    }
}

impl StringLineEncoder {
    pub fn strings(delimiter: impl Into<Vec<u8>>) -> Self {
        LineEncoder::new(StringPayload, delimiter)
    }
}

impl StringDelimitedDecoder {
    pub fn strings(start: u8, end: impl Into<Vec<u8>>, remove_delimiters: bool) -> Self {
        DelimitedDecoder::new(StringPayload, start, end, remove_delimiters)
    }
}

impl StringDelimitedEncoder {
    pub fn strings(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        DelimitedEncoder::new(StringPayload, start, end)
    }
}
