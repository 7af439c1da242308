//! Pull-based framed reader.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tether_pipe::{ErrorAction, PipeError, StableReader};

use crate::codec::Decoder;
use crate::dump::dump_bytes;
use crate::error::MessageError;

const NO_TIMEOUT: i64 = -1;

/// Reads whole messages from a [`StableReader`] through a [`Decoder`].
///
/// `read_next` returns `Ok(None)`, the empty message, when the read was
/// canceled, when the reader has completed, or when an armed pending
/// cancel was consumed. For string framers that sentinel is distinct from
/// an empty string, which is a valid frame.
pub struct MessageReader<D: Decoder> {
    shared: Arc<Inner<D>>,
}

impl<D: Decoder> Clone for MessageReader<D> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Inner<D> {
    pipe: StableReader,
    decoder: Mutex<D>,
    receiving: AtomicBool,
    /// Armed by a cancel issued while idle; the next read consumes it and
    /// returns the empty message once.
    cancel_armed: AtomicBool,
    completed: AtomicBool,
    default_timeout_ms: AtomicI64,
    log_tag: Mutex<Option<String>>,
}

impl<D: Decoder> MessageReader<D> {
    pub fn new(pipe: StableReader, decoder: D) -> Self {
        Self {
            shared: Arc::new(Inner {
                pipe,
                decoder: Mutex::new(decoder),
                receiving: AtomicBool::new(false),
                cancel_armed: AtomicBool::new(false),
                completed: AtomicBool::new(false),
                default_timeout_ms: AtomicI64::new(NO_TIMEOUT),
                log_tag: Mutex::new(None),
            }),
        }
    }

    /// The stable pipe underneath.
    pub fn pipe(&self) -> &StableReader {
        &self.shared.pipe
    }

    /// Default timeout for reads made without a caller token.
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

    /// Tag under which received frames are dumped at trace level.
    pub fn set_log_tag(&self, tag: Option<String>) {
        *self.shared.log_tag.lock().unwrap_or_else(|e| e.into_inner()) = tag;
    }

    pub fn is_completed(&self) -> bool {
        self.shared.completed.load(Ordering::Acquire) || self.shared.pipe.is_completed()
    }

    /// Cancel the next (or current) read.
    ///
    /// Idle: arms, so the next `read_next` returns the empty message once.
    /// In flight: forwards to the stable reader, whose pending read wakes
    /// with a canceled result.
    pub fn cancel_pending_read(&self) {
        if self.shared.receiving.load(Ordering::Acquire) {
            self.shared.pipe.cancel_pending_read();
        } else {
            self.shared.cancel_armed.store(true, Ordering::Release);
        }
    }

    /// Read the next message.
    pub async fn read_next(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<D::Message>, MessageError> {
        self.read_next_with(cancel, None, |_| true).await
    }

    /// Read the next message with a per-call timeout and a filter.
    ///
    /// Messages the filter rejects are consumed and skipped. With a
    /// caller token, timeout responsibility is the caller's; otherwise
    /// the per-call (or default) timeout arms, and its expiry is routed
    /// through the pipe's behavior before surfacing as
    /// [`MessageError::FrameTimeout`].
    pub async fn read_next_with(
        &self,
        cancel: Option<&CancellationToken>,
        timeout: Option<Duration>,
        filter: impl Fn(&D::Message) -> bool,
    ) -> Result<Option<D::Message>, MessageError> {
        if self.is_completed() {
            return Ok(None);
        }
        if self.shared.cancel_armed.swap(false, Ordering::AcqRel) {
            return Ok(None);
        }
        if self.shared.receiving.swap(true, Ordering::AcqRel) {
            return Err(PipeError::AlreadyReading.into());
        }
        let _busy = ReceivingGuard {
            flag: &self.shared.receiving,
        };

        let effective = timeout.or_else(|| self.default_timeout());
        loop {
            let result = match cancel {
                Some(token) => self.shared.pipe.read(Some(token)).await,
                None => match effective {
                    Some(t) => {
                        let internal = CancellationToken::new();
                        let read = self.shared.pipe.read(Some(&internal));
                        tokio::pin!(read);
                        tokio::select! {
                            r = &mut read => r,
                            _ = tokio::time::sleep(t) => {
                                internal.cancel();
                                // Unconsumed bytes stay in the source;
                                // nothing is lost by discarding this.
                                let _ = read.await;
                                Err(PipeError::Timeout { elapsed: t })
                            }
                        }
                    }
                    None => self.shared.pipe.read(None).await,
                },
            };

            let result = match result {
                Ok(r) => r,
                Err(PipeError::Timeout { elapsed }) if cancel.is_none() && effective.is_some() => {
                    let err = PipeError::Timeout { elapsed };
                    match self.shared.pipe.behavior().on_error(&err) {
                        ErrorAction::Retry => continue,
                        ErrorAction::Cancel => return Ok(None),
                        ErrorAction::Propagate => {
                            return Err(MessageError::FrameTimeout { elapsed })
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            };

            if result.is_canceled {
                return Ok(None);
            }

            let parsed = {
                let mut decoder = self
                    .shared
                    .decoder
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                decoder.try_parse(&result.buffer)
            };
            match parsed {
                (consumed, Some(frame)) => {
                    self.shared.pipe.advance_to(consumed)?;
                    if result.is_completed {
                        self.shared.completed.store(true, Ordering::Release);
                    }
                    self.log_frame(&frame);
                    let message = {
                        let mut decoder = self
                            .shared
                            .decoder
                            .lock()
                            .unwrap_or_else(|e| e.into_inner());
                        decoder.convert(frame)
                    };
                    if !filter(&message) {
                        if result.is_completed {
                            return Ok(None);
                        }
                        continue;
                    }
                    return Ok(Some(message));
                }
                (consumed, None) => {
                    self.shared
                        .pipe
                        .advance_to_examined(consumed, result.buffer.len())?;
                    if result.is_completed {
                        self.shared.completed.store(true, Ordering::Release);
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn log_frame(&self, frame: &[u8]) {
        let tag = self.shared.log_tag.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tag) = tag.as_deref() {
            tracing::trace!(tag, frame = %dump_bytes(frame), "received frame");
        }
    }
}

struct ReceivingGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ReceivingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
