#![deny(unsafe_code)]

//! Framed message I/O over stable pipes.
//!
//! [`MessageReader`] pulls whole messages out of a byte stream through a
//! [`Decoder`]; [`MessageWriter`] pushes one framed message per call
//! through an [`Encoder`]; [`MessagePump`] turns the pull side into
//! push-style delivery with idle and handling timeouts.
//!
//! Two framer families ship in the box: line framing (frame = bytes
//! before a fixed delimiter) and delimited framing (start byte + end
//! sequence, with noise rejection between frames). Both are generic over
//! a [`Payload`] that maps frame bytes to the user message type;
//! [`StringPayload`] covers the common text case.

mod codec;
mod delimited;
mod dump;
mod error;
mod handler;
mod line;
mod reader;
mod text;
mod writer;

pub use codec::{Decoder, Encoder, Payload};
pub use delimited::{DelimitedDecoder, DelimitedEncoder};
pub use dump::dump_bytes;
pub use error::MessageError;
pub use handler::{MessageHook, MessagePump, StopReason};
pub use line::{LineDecoder, LineEncoder};
pub use reader::MessageReader;
pub use text::{
    StringDelimitedDecoder, StringDelimitedEncoder, StringLineDecoder, StringLineEncoder,
    StringPayload,
};
pub use writer::MessageWriter;

pub use async_trait::async_trait;
