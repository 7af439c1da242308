//! Byte pipes over in-process unbounded channels.

use std::io;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tether_pipe::{ByteSink, ByteSource, FlushResult, ReadResult};

/// Read half of an in-memory pair.
///
/// Severing the endpoint (deallocation) completes the source, but bytes
/// already queued are drained and delivered first.
pub struct MemorySource {
    rx: mpsc::UnboundedReceiver<Bytes>,
    sever: CancellationToken,
    pending: BytesMut,
    examined: usize,
    eof: bool,
    completed: bool,
}

impl MemorySource {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Bytes>, sever: CancellationToken) -> Self {
        Self {
            rx,
            sever,
            pending: BytesMut::new(),
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

    fn drain_queued(&mut self) {
        while let Ok(chunk) = self.rx.try_recv() {
            self.pending.extend_from_slice(&chunk);
        }
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn read(&mut self) -> io::Result<ReadResult> {
        loop {
            if self.completed {
                return Ok(ReadResult::completed());
            }
            if self.pending.len() > self.examined || self.eof {
                return Ok(self.snapshot());
            }
            tokio::select! {
                chunk = self.rx.recv() => match chunk {
                    Some(chunk) => self.pending.extend_from_slice(&chunk),
                    None => self.eof = true,
                },
                _ = self.sever.cancelled() => {
                    self.drain_queued();
                    self.eof = true;
                }
            }
        }
    }

    fn try_read(&mut self) -> io::Result<Option<ReadResult>> {
        if self.completed {
            return Ok(Some(ReadResult::completed()));
        }
        self.drain_queued();
        if self.sever.is_cancelled() {
            self.eof = true;
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

/// Write half of an in-memory pair. A flush moves the staged bytes to
/// the peer as one chunk; a severed or departed peer is reported as a
/// completed sink, not an error.
pub struct MemorySink {
    tx: mpsc::UnboundedSender<Bytes>,
    sever: CancellationToken,
    staged: BytesMut,
    completed: bool,
}

impl MemorySink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Bytes>, sever: CancellationToken) -> Self {
        Self {
            tx,
            sever,
            staged: BytesMut::new(),
            completed: false,
        }
    }
}

#[async_trait]
impl ByteSink for MemorySink {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.completed {
            return Ok(());
        }
        self.staged.extend_from_slice(bytes);
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<FlushResult> {
        if self.completed {
            return Ok(FlushResult {
                is_canceled: false,
                is_completed: true,
            });
        }
        if self.sever.is_cancelled() || self.tx.is_closed() {
            return Ok(FlushResult {
                is_canceled: false,
                is_completed: true,
            });
        }
        if !self.staged.is_empty() {
            let chunk = self.staged.split().freeze();
            if self.tx.send(chunk).is_err() {
                return Ok(FlushResult {
                    is_canceled: false,
                    is_completed: true,
                });
            }
        }
        Ok(FlushResult::default())
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (MemorySource, MemorySink, CancellationToken) {
        let sever = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemorySource::new(rx, sever.clone()),
            MemorySink::new(tx, sever.clone()),
            sever,
        )
    }

    #[tokio::test]
    async fn flushed_bytes_arrive_as_one_chunk() {
        let (mut source, mut sink, _sever) = pair();
        sink.write(b"hello ").await.unwrap();
        sink.write(b"world").await.unwrap();
        sink.flush().await.unwrap();

        let r = source.read().await.unwrap();
        assert_eq!(&r.buffer[..], b"hello world");
        assert!(!r.is_completed);
    }

    #[tokio::test]
    async fn sever_drains_queued_bytes_before_completion() {
        let (mut source, mut sink, sever) = pair();
        sink.write(b"queued").await.unwrap();
        sink.flush().await.unwrap();
        sever.cancel();

        let r = source.read().await.unwrap();
        assert_eq!(&r.buffer[..], b"queued");
        assert!(r.is_completed);

        source.advance_to(6, 6).unwrap();
        let r = source.read().await.unwrap();
        assert!(r.is_completed && r.buffer.is_empty());
    }

    #[tokio::test]
    async fn severed_sink_reports_completed() {
        let (_source, mut sink, sever) = pair();
        sever.cancel();
        sink.write(b"x").await.unwrap();
        assert!(sink.flush().await.unwrap().is_completed);
    }

    #[tokio::test]
    async fn dropped_reader_completes_the_sink() {
        let (source, mut sink, _sever) = pair();
        drop(source);
        sink.write(b"x").await.unwrap();
        assert!(sink.flush().await.unwrap().is_completed);
    }

    #[tokio::test]
    async fn dropped_sink_completes_the_source() {
        let (mut source, sink, _sever) = pair();
        drop(sink);
        let r = source.read().await.unwrap();
        assert!(r.is_completed);
    }
}
