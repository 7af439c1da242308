//! Start-byte / end-sequence framing with noise rejection.
//!
//! Frames look like `S payload E` where `S` is a single start byte and
//! `E` one or more end bytes. Anything between frames is noise and is
//! dropped; a fresh start byte inside a half-open frame discards the
//! garbled start and begins again. The reader's `in_message` state
//! persists across reads, so a frame may arrive byte by byte.

use bytes::{Bytes, BytesMut};

use crate::codec::{find, Decoder, Encoder, Payload};

/// Reads `S payload E` frames, dropping inter-frame noise.
pub struct DelimitedDecoder<P> {
    start: u8,
    end: Vec<u8>,
    /// Emit the bare payload (`true`) or the whole delimited frame.
    remove_delimiters: bool,
    in_message: bool,
    payload: P,
}

impl<P> DelimitedDecoder<P> {
    /// The last end byte must differ from the start byte, otherwise the
    /// scanner could mistake a frame start for an end anchor.
    pub fn new(
        payload: P,
        start: u8,
        end: impl Into<Vec<u8>>,
        remove_delimiters: bool,
    ) -> Self {
        let end = end.into();
        assert!(!end.is_empty(), "end delimiter must not be empty");
        assert!(
            *end.last().expect("non-empty") != start,
            "the last end byte must differ from the start byte"
        );
        Self {
            start,
            end,
            remove_delimiters,
            in_message: false,
            payload,
        }
    }
}

impl<P: Payload> Decoder for DelimitedDecoder<P> {
    type Message = P::Message;

    fn try_parse(&mut self, buf: &[u8]) -> (usize, Option<Bytes>) {
        let mut offset = 0;
        loop {
            let window = &buf[offset..];
            if !self.in_message {
                match window.iter().position(|b| *b == self.start) {
                    // Pure noise: drop the whole buffer.
                    None => return (buf.len(), None),
                    Some(at) => {
                        offset += at;
                        self.in_message = true;
                    }
                }
                continue;
            }

            // window[0] is the start byte. Find the end anchor after it.
            match find(&window[1..], &self.end) {
                None => return (offset, None),
                Some(rel) => {
                    let end_at = 1 + rel;
                    let after = end_at + self.end.len();
                    // A fresh start byte inside the half-open frame means
                    // the earlier start was garbled; restart the window.
                    if let Some(restart) = window[1..end_at].iter().position(|b| *b == self.start)
                    {
                        offset += 1 + restart;
                        continue;
                    }
                    let frame = if self.remove_delimiters {
                        &window[1..end_at]
                    } else {
                        &window[..after]
                    };
                    let frame = Bytes::copy_from_slice(frame);
                    self.in_message = false;
                    return (offset + after, Some(frame));
                }
            }
        }
    }

    fn convert(&mut self, frame: Bytes) -> Self::Message {
        self.payload.decode(&frame)
    }
}

/// Writes `start payload end` per message.
///
/// Unlike the reader, start and end may share bytes: the sender knows
/// exactly where each frame begins.
pub struct DelimitedEncoder<P> {
    start: Vec<u8>,
    end: Vec<u8>,
    payload: P,
}

impl<P> DelimitedEncoder<P> {
    pub fn new(payload: P, start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            payload,
        }
    }
}

impl<P: Payload> Encoder for DelimitedEncoder<P> {
    type Message = P::Message;

    fn write_message(&mut self, message: &Self::Message, buf: &mut BytesMut) -> bool {
        buf.extend_from_slice(&self.start);
        if !self.payload.encode(message, buf) {
            return false;
        }
        buf.extend_from_slice(&self.end);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::StringPayload;

    fn drain(dec: &mut DelimitedDecoder<StringPayload>, input: &[u8]) -> (usize, Vec<String>) {
        let mut offset = 0;
        let mut frames = Vec::new();
        loop {
            let (consumed, frame) = dec.try_parse(&input[offset..]);
            offset += consumed;
            match frame {
                Some(f) => frames.push(dec.convert(f)),
                None => return (offset, frames),
            }
        }
    }

    #[test]
    fn extracts_frames_from_noise() {
        let mut dec = DelimitedDecoder::new(StringPayload, b'#', ";", true);
        let input = b" garbage #Message 0; other garbage... g#a#rbage# #Message 1; ;other garbage;...;";
        let (_, frames) = drain(&mut dec, input);
        assert_eq!(frames, ["Message 0", "Message 1"]);
    }

    #[test]
    fn trailing_noise_is_fully_consumed() {
        let mut dec = DelimitedDecoder::new(StringPayload, b'#', ";", true);
        let input = b"#ok; trailing junk without frames";
        let (consumed, frames) = drain(&mut dec, input);
        assert_eq!(frames, ["ok"]);
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn half_open_frame_survives_across_calls() {
        let mut dec = DelimitedDecoder::new(StringPayload, b'$', "\r\n", true);
        let (consumed, frame) = dec.try_parse(b"noise $par");
        assert!(frame.is_none());
        // Noise before the start byte is consumed; the open frame stays.
        assert_eq!(consumed, 6);

        let (consumed, frame) = dec.try_parse(b"$partial\r\n");
        assert_eq!(frame.as_deref(), Some(b"partial".as_ref()));
        assert_eq!(consumed, 10);
    }

    #[test]
    fn fresh_start_discards_garbled_prefix() {
        let mut dec = DelimitedDecoder::new(StringPayload, b'#', ";", true);
        let (_, frames) = drain(&mut dec, b"#gar#real;");
        assert_eq!(frames, ["real"]);
    }

    #[test]
    fn delimiters_can_be_kept() {
        let mut dec = DelimitedDecoder::new(StringPayload, b'#', ";", false);
        let (_, frames) = drain(&mut dec, b"x#msg;y");
        assert_eq!(frames, ["#msg;"]);
    }

    #[test]
    fn end_bytes_in_noise_do_not_fabricate_frames() {
        let mut dec = DelimitedDecoder::new(StringPayload, b'#', ";", true);
        let (_, frames) = drain(&mut dec, b";;;#a;;;#b;;");
        assert_eq!(frames, ["a", "b"]);
    }

    #[test]
    fn multi_byte_end_anchor() {
        let mut dec = DelimitedDecoder::new(StringPayload, b'<', "]>", true);
        let (_, frames) = drain(&mut dec, b"..<one]>..<two]>");
        assert_eq!(frames, ["one", "two"]);
    }

    #[test]
    #[should_panic(expected = "last end byte must differ")]
    fn start_equal_to_end_anchor_is_rejected() {
        let _ = DelimitedDecoder::new(StringPayload, b'#', "#", true);
    }

    #[test]
    fn encoder_wraps_payload() {
        let mut enc = DelimitedEncoder::new(StringPayload, "#", ";");
        let mut buf = BytesMut::new();
        assert!(enc.write_message(&"body".to_string(), &mut buf));
        assert_eq!(&buf[..], b"#body;");
    }

    #[test]
    fn round_trip_with_noise_between_frames() {
        let mut enc = DelimitedEncoder::new(StringPayload, "#", ";");
        let mut dec = DelimitedDecoder::new(StringPayload, b'#', ";", true);

        let mut wire = BytesMut::new();
        wire.extend_from_slice(b"pre-noise ");
        for m in ["a", "b", "c"] {
            assert!(enc.write_message(&m.to_string(), &mut wire));
            wire.extend_from_slice(b" mid noise ");
        }

        let (_, frames) = drain(&mut dec, &wire);
        assert_eq!(frames, ["a", "b", "c"]);
    }
}
