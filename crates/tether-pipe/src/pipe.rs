//! Byte-level pipe contracts consumed by the stable decorators.
//!
//! A [`ByteSource`] hands out snapshots of its internal buffer and retains
//! unconsumed bytes across reads; the caller reports how much it consumed
//! and how far it looked via [`ByteSource::advance_to`]. A [`ByteSink`]
//! accepts bytes and makes them durable on [`ByteSink::flush`]. Transports
//! produce one of each per connection.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;

/// Outcome of one [`ByteSource::read`].
#[derive(Debug, Clone, Default)]
pub struct ReadResult {
    /// All currently-buffered, unconsumed bytes.
    pub buffer: Bytes,
    /// The pending operation was canceled. Transient per-operation flag;
    /// does not imply completion.
    pub is_canceled: bool,
    /// The source will yield no more data.
    pub is_completed: bool,
}

impl ReadResult {
    /// A result carrying no data and signaling completion.
    pub fn completed() -> Self {
        ReadResult {
            buffer: Bytes::new(),
            is_canceled: false,
            is_completed: true,
        }
    }

    /// A result carrying no data and signaling a canceled operation.
    pub fn canceled(is_completed: bool) -> Self {
        ReadResult {
            buffer: Bytes::new(),
            is_canceled: true,
            is_completed,
        }
    }
}

/// Outcome of one [`ByteSink::flush`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushResult {
    /// The pending operation was canceled.
    pub is_canceled: bool,
    /// The sink accepts no more data.
    pub is_completed: bool,
}

/// A readable byte pipe with examined/consumed watermark semantics.
///
/// `read` waits until data beyond the examined watermark is available (or
/// the source completes) and returns a snapshot of everything buffered and
/// unconsumed. The caller then calls `advance_to(consumed, examined)` with
/// offsets into that snapshot: the first `consumed` bytes are dropped, and
/// the next `read` blocks until bytes beyond `examined` arrive.
#[async_trait]
pub trait ByteSource: Send {
    /// Wait for data past the examined watermark, completion, or failure.
    async fn read(&mut self) -> io::Result<ReadResult>;

    /// Non-blocking variant: `None` when nothing new is buffered.
    fn try_read(&mut self) -> io::Result<Option<ReadResult>>;

    /// Report consumption. `consumed <= examined <= buffer.len()` relative
    /// to the last returned snapshot.
    fn advance_to(&mut self, consumed: usize, examined: usize) -> io::Result<()>;

    /// Mark the source as finished; subsequent reads yield a completed
    /// result. Dropping the source releases its resources either way.
    fn complete(&mut self);
}

/// A writable byte pipe.
#[async_trait]
pub trait ByteSink: Send {
    /// Queue bytes for transmission.
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Make everything written so far durable.
    async fn flush(&mut self) -> io::Result<FlushResult>;

    /// Mark the sink as finished. Dropping the sink releases its resources
    /// either way.
    fn complete(&mut self);
}
