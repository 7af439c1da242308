//! One-frame-per-call framed writer.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use tether_pipe::{PipeError, StableWriter};

use crate::codec::Encoder;
use crate::dump::dump_bytes;
use crate::error::MessageError;

const NO_TIMEOUT: i64 = -1;

/// Writes one framed message per call over a [`StableWriter`].
///
/// By default concurrent writes are a contract violation
/// ([`PipeError::AlreadyWriting`]); constructed with
/// [`with_multiple_writers`](MessageWriter::with_multiple_writers), calls
/// serialize on an internal lock instead, honoring the caller's cancel
/// and timeout while waiting.
pub struct MessageWriter<E: Encoder> {
    shared: Arc<Inner<E>>,
}

impl<E: Encoder> Clone for MessageWriter<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Inner<E> {
    pipe: StableWriter,
    encoder: Mutex<E>,
    writing: AtomicBool,
    write_lock: Option<tokio::sync::Mutex<()>>,
    default_timeout_ms: AtomicI64,
    last_sent: Mutex<Option<Instant>>,
    log_tag: Mutex<Option<String>>,
}

impl<E: Encoder> MessageWriter<E> {
    pub fn new(pipe: StableWriter, encoder: E) -> Self {
        Self::build(pipe, encoder, false)
    }

    /// Allow concurrent callers, serialized internally.
    pub fn with_multiple_writers(pipe: StableWriter, encoder: E) -> Self {
        Self::build(pipe, encoder, true)
    }

    fn build(pipe: StableWriter, encoder: E, multiple_writers: bool) -> Self {
        Self {
            shared: Arc::new(Inner {
                pipe,
                encoder: Mutex::new(encoder),
                writing: AtomicBool::new(false),
                write_lock: multiple_writers.then(|| tokio::sync::Mutex::new(())),
                default_timeout_ms: AtomicI64::new(NO_TIMEOUT),
                last_sent: Mutex::new(None),
                log_tag: Mutex::new(None),
            }),
        }
    }

    /// The stable pipe underneath.
    pub fn pipe(&self) -> &StableWriter {
        &self.shared.pipe
    }

    /// Default timeout for writes made without a caller token.
    pub fn set_default_timeout(&self, timeout: Option<Duration>) {
        let ms = timeout.map_or(NO_TIMEOUT, |d| d.as_millis() as i64);
        self.shared.default_timeout_ms.store(ms, Ordering::Relaxed);
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        match self.shared.default_timeout_ms.load(Ordering::Relaxed) {
            ms if ms > 0 => Some(Duration::from_millis(ms as u64)),
            _ => None,
        }
    }

    /// Tag under which sent frames are dumped at trace level.
    pub fn set_log_tag(&self, tag: Option<String>) {
        *self.shared.log_tag.lock().unwrap_or_else(|e| e.into_inner()) = tag;
    }

    pub fn is_completed(&self) -> bool {
        self.shared.pipe.is_completed()
    }

    /// When the last frame went out, if any has.
    pub fn last_sent(&self) -> Option<Instant> {
        *self.shared.last_sent.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write one message. Returns `false` when the writer has completed
    /// or the encoder aborted the frame; `true` once the frame was
    /// flushed to the then-current sink.
    pub async fn write(
        &self,
        message: &E::Message,
        cancel: Option<&CancellationToken>,
    ) -> Result<bool, MessageError> {
        self.write_with(message, cancel, None).await
    }

    /// Write with a per-call timeout overriding the default.
    pub async fn write_with(
        &self,
        message: &E::Message,
        cancel: Option<&CancellationToken>,
        timeout: Option<Duration>,
    ) -> Result<bool, MessageError> {
        if self.shared.pipe.is_completed() {
            return Ok(false);
        }
        let effective = timeout.or_else(|| self.default_timeout());

        // Serialize: either the concurrent-writer lock (bounded by the
        // caller's cancel/timeout) or the single-writer flag.
        let _permit = match &self.shared.write_lock {
            Some(lock) => {
                let acquire = lock.lock();
                tokio::pin!(acquire);
                let guard = match (cancel, effective) {
                    (Some(token), _) => tokio::select! {
                        g = &mut acquire => g,
                        _ = token.cancelled() => {
                            return Err(PipeError::Canceled.into())
                        }
                    },
                    (None, Some(t)) => tokio::select! {
                        g = &mut acquire => g,
                        _ = tokio::time::sleep(t) => {
                            return Err(MessageError::FrameTimeout { elapsed: t })
                        }
                    },
                    (None, None) => acquire.await,
                };
                Permit::Lock(guard)
            }
            None => {
                if self.shared.writing.swap(true, Ordering::AcqRel) {
                    return Err(PipeError::AlreadyWriting.into());
                }
                Permit::Flag(FlagGuard {
                    flag: &self.shared.writing,
                })
            }
        };

        // Format the frame straight into the pipe's buffer; an aborted
        // or failed format leaves the buffer untouched.
        let mut dump: Option<Vec<u8>> = None;
        let log_enabled = self
            .shared
            .log_tag
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some();
        let formatted = self.shared.pipe.with_buffer(|buf| {
            let start = buf.len();
            let ok = {
                let mut encoder = self
                    .shared
                    .encoder
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                encoder.write_message(message, buf)
            };
            if !ok {
                buf.truncate(start);
                return false;
            }
            if log_enabled {
                dump = Some(buf[start..].to_vec());
            }
            true
        });
        match formatted {
            None | Some(false) => return Ok(false),
            Some(true) => {}
        }
        if let Some(bytes) = dump {
            let tag = self.shared.log_tag.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(tag) = tag.as_deref() {
                tracing::trace!(tag, frame = %dump_bytes(&bytes), "sending frame");
            }
        }

        // The stable writer owns the whole timeout/retry/behavior dance;
        // a timeout error surfacing here was already behavior-approved.
        let result = match cancel {
            Some(token) => self.shared.pipe.flush(Some(token)).await,
            None => self.shared.pipe.flush_with(None, effective).await,
        };
        match result {
            Ok(flush) => {
                if !flush.is_canceled && !flush.is_completed {
                    *self
                        .shared
                        .last_sent
                        .lock()
                        .unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
                }
                Ok(!flush.is_completed)
            }
            Err(PipeError::Timeout { elapsed }) => Err(MessageError::FrameTimeout { elapsed }),
            Err(e) => Err(e.into()),
        }
    }
}

enum Permit<'a> {
    #[allow(dead_code)]
    Lock(tokio::sync::MutexGuard<'a, ()>),
    #[allow(dead_code)]
    Flag(FlagGuard<'a>),
}

struct FlagGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::StringLineEncoder;
    use tether_pipe::StreamSink;
    use tokio::io::{duplex, AsyncReadExt};

    fn line_writer(
        tx: tokio::io::DuplexStream,
    ) -> MessageWriter<StringLineEncoder> {
        let pipe = StableWriter::new();
        pipe.set_inner(Box::new(StreamSink::new(tx)), true);
        MessageWriter::new(pipe, StringLineEncoder::strings("\r\n"))
    }

    async fn read_all(mut rx: tokio::io::DuplexStream, n: usize) -> Vec<u8> {
        let mut out = vec![0u8; n];
        rx.read_exact(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn writes_framed_messages_in_order() {
        let (tx, rx) = duplex(256);
        let writer = line_writer(tx);

        assert!(writer.write(&"one".into(), None).await.unwrap());
        assert!(writer.write(&"two".into(), None).await.unwrap());
        assert!(writer.last_sent().is_some());

        let wire = read_all(rx, 10).await;
        assert_eq!(&wire, b"one\r\ntwo\r\n");
    }

    #[tokio::test]
    async fn completed_writer_returns_false() {
        let (tx, _rx) = duplex(256);
        let writer = line_writer(tx);
        writer.pipe().close(true);
        assert!(!writer.write(&"nope".into(), None).await.unwrap());
    }

    #[tokio::test]
    async fn timeout_without_sink_surfaces_frame_timeout() {
        let pipe = StableWriter::new();
        let writer = MessageWriter::new(pipe.clone(), StringLineEncoder::strings("\r\n"));

        // No sink attached and a writer-level timeout: the flush cannot
        // finish, and the buffered frame survives for a retry.
        let err = writer
            .write_with(&"stuck".into(), None, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, MessageError::FrameTimeout { .. }));
        assert_eq!(pipe.pending(), 7);
    }

    #[tokio::test]
    async fn concurrent_writers_serialize_when_enabled() {
        let (tx, rx) = duplex(4096);
        let pipe = StableWriter::new();
        pipe.set_inner(Box::new(StreamSink::new(tx)), true);
        let writer = Arc::new(MessageWriter::with_multiple_writers(
            pipe,
            StringLineEncoder::strings("\n"),
        ));

        let mut tasks = Vec::new();
        for i in 0..16 {
            let writer = Arc::clone(&writer);
            tasks.push(tokio::spawn(async move {
                writer.write(&format!("m{i}"), None).await.unwrap()
            }));
        }
        for t in tasks {
            assert!(t.await.unwrap());
        }

        // Every frame arrives whole, one per line.
        let mut rx = rx;
        let mut wire = Vec::new();
        let mut buf = [0u8; 256];
        while wire.iter().filter(|b| **b == b'\n').count() < 16 {
            let n = rx.read(&mut buf).await.unwrap();
            wire.extend_from_slice(&buf[..n]);
        }
        let mut lines: Vec<&str> = std::str::from_utf8(&wire)
            .unwrap()
            .lines()
            .collect();
        lines.sort_unstable();
        assert_eq!(lines.len(), 16);
        for i in 0..16 {
            assert!(lines.contains(&format!("m{i}").as_str()));
        }
    }

    #[tokio::test]
    async fn plain_writer_rejects_concurrent_calls() {
        let pipe = StableWriter::new();
        let writer = MessageWriter::new(pipe.clone(), StringLineEncoder::strings("\n"));

        // No sink: the first write parks in flush waiting for attach.
        let task = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.write(&"first".into(), None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = writer.write(&"second".into(), None).await.unwrap_err();
        assert!(matches!(
            err,
            MessageError::Pipe(PipeError::AlreadyWriting)
        ));

        pipe.close(true);
        let _ = task.await.unwrap();
    }

    struct AbortingEncoder;
    impl Encoder for AbortingEncoder {
        type Message = String;
        fn write_message(
            &mut self,
            _message: &String,
            _buf: &mut bytes::BytesMut,
        ) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn aborted_format_leaves_buffer_untouched() {
        let (tx, _rx) = duplex(256);
        let pipe = StableWriter::new();
        pipe.set_inner(Box::new(StreamSink::new(tx)), true);
        let writer = MessageWriter::new(pipe.clone(), AbortingEncoder);

        assert!(!writer.write(&"anything".into(), None).await.unwrap());
        assert_eq!(pipe.pending(), 0);
    }
}
