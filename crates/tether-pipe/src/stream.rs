//! [`ByteSource`]/[`ByteSink`] adapters over any `AsyncRead`/`AsyncWrite`.
//!
//! These are the workhorses for socket-backed transports: the source
//! accumulates incoming bytes into a growable buffer and re-presents
//! unconsumed data on every read, so framers can wait for a delimiter that
//! straddles several socket reads.

use std::io;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::pipe::{ByteSink, ByteSource, FlushResult, ReadResult};

const READ_CHUNK: usize = 4096;

/// Buffering [`ByteSource`] over an `AsyncRead`.
pub struct StreamSource<R> {
    reader: R,
    pending: BytesMut,
    /// Offset into `pending` the caller has already looked at. A read
    /// blocks until bytes past this watermark arrive.
    examined: usize,
    eof: bool,
    completed: bool,
}

impl<R> StreamSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: BytesMut::with_capacity(READ_CHUNK),
            examined: 0,
            eof: false,
            completed: false,
        }
    }

    fn snapshot(&self) -> ReadResult {
        ReadResult {
            buffer: Bytes::copy_from_slice(&self.pending),
            is_canceled: false,
            is_completed: self.eof || self.completed,
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> ByteSource for StreamSource<R> {
    async fn read(&mut self) -> io::Result<ReadResult> {
        loop {
            if self.completed {
                return Ok(ReadResult::completed());
            }
            if self.pending.len() > self.examined || self.eof {
                return Ok(self.snapshot());
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.pending.extend_from_slice(&chunk[..n]);
            }
        }
    }

    fn try_read(&mut self) -> io::Result<Option<ReadResult>> {
        if self.completed {
            return Ok(Some(ReadResult::completed()));
        }
        if self.pending.len() > self.examined || self.eof {
            return Ok(Some(self.snapshot()));
        }
        Ok(None)
    }

    fn advance_to(&mut self, consumed: usize, examined: usize) -> io::Result<()> {
        if consumed > examined || examined > self.pending.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "advance_to out of bounds: consumed {consumed}, examined {examined}, \
                     buffered {}",
                    self.pending.len()
                ),
            ));
        }
        self.pending.advance(consumed);
        self.examined = examined - consumed;
        Ok(())
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

/// [`ByteSink`] over an `AsyncWrite`.
///
/// `write` only queues into an internal buffer; `flush` pushes it to the
/// underlying writer. A flush interrupted mid-transmission resumes from
/// where it stopped on the next call, so retries never duplicate bytes.
pub struct StreamSink<W> {
    writer: W,
    pending: Vec<u8>,
    /// How much of `pending` already reached the underlying writer.
    sent: usize,
    completed: bool,
}

impl<W> StreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            pending: Vec::new(),
            sent: 0,
            completed: false,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ByteSink for StreamSink<W> {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.completed {
            return Ok(());
        }
        self.pending.extend_from_slice(bytes);
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<FlushResult> {
        if self.completed {
            return Ok(FlushResult {
                is_canceled: false,
                is_completed: true,
            });
        }
        while self.sent < self.pending.len() {
            let n = self.writer.write(&self.pending[self.sent..]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "stream refused further bytes",
                ));
            }
            self.sent += n;
        }
        self.writer.flush().await?;
        self.pending.clear();
        self.sent = 0;
        Ok(FlushResult::default())
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}
