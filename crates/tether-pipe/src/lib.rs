#![deny(unsafe_code)]

//! Stable byte-pipe decorators.
//!
//! A transport connection is a pair of byte pipes: a [`ByteSource`] and a
//! [`ByteSink`]. This crate wraps them in [`StableReader`] and
//! [`StableWriter`]: decorators whose inner pipe can be swapped or closed
//! atomically while reads and flushes are in flight, so the code looping
//! over them never has to rebuild its loop when the transport underneath
//! is replaced.
//!
//! How an operation reacts to an inner-pipe error, cancel, or completion
//! is decided by the installed [`PipeBehavior`]; a connection supervisor
//! typically installs one that swallows transport errors and swaps in a
//! fresh pipe, while timeouts and caller cancels always stay visible to
//! the caller.

mod behavior;
mod error;
mod pipe;
mod reader;
mod stream;
mod writer;

pub use behavior::{CompletionAction, DefaultBehavior, ErrorAction, PipeBehavior};
pub use error::PipeError;
pub use pipe::{ByteSink, ByteSource, FlushResult, ReadResult};
pub use reader::StableReader;
pub use stream::{StreamSink, StreamSource};
pub use writer::{DataWrittenFn, StableWriter};
