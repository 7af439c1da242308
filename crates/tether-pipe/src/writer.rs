//! Stable decorator over a [`ByteSink`].
//!
//! A [`StableWriter`] accumulates writes into a private buffer and hands
//! the whole buffer to the attached sink on flush. Each flush is atomic
//! from the sender's point of view: either the entire pending buffer
//! reached the then-current sink, or none of it did and the buffer is
//! retained for the next attempt, including across a sink swap.

use std::sync::atomic::{AtomicI64, AtomicI8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::behavior::{CompletionAction, DefaultBehavior, ErrorAction, PipeBehavior};
use crate::error::PipeError;
use crate::pipe::{ByteSink, FlushResult};

const IDLE: i8 = 0;
const BUSY: i8 = 1;
const COMPLETED_IDLE: i8 = -1;

const NO_TIMEOUT: i64 = -1;

/// Callback raised after every flush that actually transmitted, with the
/// exact bytes that went out.
pub type DataWrittenFn = Box<dyn Fn(&[u8]) + Send + Sync>;

/// A hot-swappable, buffering writer over a [`ByteSink`].
///
/// Cheap to clone; all clones share the same state. At most one flush may
/// be in flight at a time ([`PipeError::AlreadyWriting`] otherwise).
#[derive(Clone)]
pub struct StableWriter {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    state_change: Notify,
    writing: AtomicI8,
    behavior: Mutex<Arc<dyn PipeBehavior>>,
    default_timeout_ms: AtomicI64,
    /// Additional flush attempts on an internal timeout, per flush call.
    retry_write_count: AtomicU32,
    on_data_written: Mutex<Option<DataWrittenFn>>,
}

struct State {
    slot: Slot,
    generation: u64,
    completed: bool,
    complete_error: Option<String>,
    op_cancel: CancellationToken,
    /// Everything written since the last successful flush. Retained
    /// across transport swaps; discarded on success or terminal failure.
    buffer: BytesMut,
    /// Sink generation the buffer prefix below was already delivered to,
    /// so a retry on the same sink does not re-deliver bytes.
    flushed_generation: Option<u64>,
    flushed_pos: usize,
}

enum Slot {
    Empty,
    Attached(Attachment),
    Taken(TakenMeta),
}

struct Attachment {
    sink: Box<dyn ByteSink>,
    complete_when_done: bool,
    detach: CancellationToken,
    ident: usize,
}

struct TakenMeta {
    complete_when_done: bool,
    detach: CancellationToken,
    ident: usize,
}

fn ident_of(sink: &dyn ByteSink) -> usize {
    sink as *const dyn ByteSink as *const () as usize
}

enum Outcome {
    Inner(std::io::Result<FlushResult>),
    External,
    OpCancel,
    Detach,
    Timeout,
}

impl Default for StableWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl StableWriter {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    slot: Slot::Empty,
                    generation: 0,
                    completed: false,
                    complete_error: None,
                    op_cancel: CancellationToken::new(),
                    buffer: BytesMut::new(),
                    flushed_generation: None,
                    flushed_pos: 0,
                }),
                state_change: Notify::new(),
                writing: AtomicI8::new(IDLE),
                behavior: Mutex::new(Arc::new(DefaultBehavior)),
                default_timeout_ms: AtomicI64::new(NO_TIMEOUT),
                retry_write_count: AtomicU32::new(0),
                on_data_written: Mutex::new(None),
            }),
        }
    }

    pub fn set_behavior(&self, behavior: Arc<dyn PipeBehavior>) {
        *self.shared.behavior.lock().unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    pub fn behavior(&self) -> Arc<dyn PipeBehavior> {
        self.shared
            .behavior
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Default timeout applied to flushes made without a caller token.
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

    /// Additional attempts per flush when the internal timeout fires.
    /// Effective only when a default timeout is set.
    pub fn set_retry_write_count(&self, count: u32) {
        self.shared.retry_write_count.store(count, Ordering::Relaxed);
    }

    pub fn retry_write_count(&self) -> u32 {
        self.shared.retry_write_count.load(Ordering::Relaxed)
    }

    /// Install the callback raised with the transmitted bytes after every
    /// successful flush.
    pub fn set_on_data_written(&self, callback: Option<DataWrittenFn>) {
        *self
            .shared
            .on_data_written
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = callback;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    pub fn has_inner(&self) -> bool {
        !matches!(self.lock().slot, Slot::Empty)
    }

    /// Bytes accumulated and not yet flushed.
    pub fn pending(&self) -> usize {
        self.lock().buffer.len()
    }

    /// Append bytes to the pending buffer. Returns `false` (and appends
    /// nothing) once the writer has completed.
    pub fn write(&self, bytes: &[u8]) -> bool {
        let mut st = self.lock();
        if st.completed {
            return false;
        }
        st.buffer.extend_from_slice(bytes);
        true
    }

    /// Run an encoder directly against the pending buffer. Returns `None`
    /// once the writer has completed.
    pub fn with_buffer<R>(&self, f: impl FnOnce(&mut BytesMut) -> R) -> Option<R> {
        let mut st = self.lock();
        if st.completed {
            return None;
        }
        Some(f(&mut st.buffer))
    }

    /// Attach a sink, replacing the current one. Semantics mirror
    /// [`StableReader::set_inner`](crate::StableReader::set_inner);
    /// the pending buffer survives the swap.
    pub fn set_inner(&self, sink: Box<dyn ByteSink>, complete_when_done: bool) -> bool {
        let mut st = self.lock();
        if st.completed {
            return false;
        }
        let ident = ident_of(&*sink);
        if let Slot::Attached(att) = &mut st.slot {
            if att.ident == ident {
                att.complete_when_done = complete_when_done;
                return true;
            }
        }
        let prev = std::mem::replace(
            &mut st.slot,
            Slot::Attached(Attachment {
                sink,
                complete_when_done,
                detach: CancellationToken::new(),
                ident,
            }),
        );
        st.generation = st.generation.wrapping_add(1);
        drop(st);
        dispose_previous(prev);
        self.shared.state_change.notify_waiters();
        true
    }

    /// Detach the current sink; with `complete` the writer transitions to
    /// completed and the pending buffer is discarded.
    pub fn close(&self, complete: bool) -> bool {
        let mut st = self.lock();
        if st.completed {
            return false;
        }
        let prev = std::mem::replace(&mut st.slot, Slot::Empty);
        st.generation = st.generation.wrapping_add(1);
        if complete {
            st.completed = true;
            st.buffer.clear();
            let _ = self.shared.writing.compare_exchange(
                IDLE,
                COMPLETED_IDLE,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        drop(st);
        dispose_previous(prev);
        self.shared.state_change.notify_waiters();
        true
    }

    /// Terminal close, optionally recording the error that caused it.
    pub fn complete(&self, error: Option<PipeError>) -> bool {
        if let Some(e) = error {
            let mut st = self.lock();
            if st.complete_error.is_none() {
                st.complete_error = Some(e.to_string());
            }
        }
        self.close(true)
    }

    pub fn complete_error(&self) -> Option<String> {
        self.lock().complete_error.clone()
    }

    /// Make the in-flight flush, if any, return a canceled result. The
    /// pending buffer is retained so the caller may retry.
    pub fn cancel_pending_flush(&self) {
        if self.shared.writing.load(Ordering::Acquire) != BUSY {
            return;
        }
        let st = self.lock();
        if !st.completed && matches!(st.slot, Slot::Taken(_)) {
            st.op_cancel.cancel();
        }
    }

    /// Flush the pending buffer to the attached sink.
    ///
    /// Timeout rules mirror [`StableReader::read`](crate::StableReader::read),
    /// with one addition: when `retry_write_count > 0`, an internal
    /// timeout retries the flush that many extra times before the timeout
    /// is surfaced to the behavior.
    pub async fn flush(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<FlushResult, PipeError> {
        self.flush_with(cancel, None).await
    }

    /// Flush with a per-call timeout overriding the default.
    pub async fn flush_with(
        &self,
        cancel: Option<&CancellationToken>,
        timeout: Option<Duration>,
    ) -> Result<FlushResult, PipeError> {
        {
            let st = self.lock();
            if st.buffer.is_empty() {
                return Ok(FlushResult {
                    is_canceled: false,
                    is_completed: st.completed,
                });
            }
        }
        match self
            .shared
            .writing
            .compare_exchange(IDLE, BUSY, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(COMPLETED_IDLE) => {
                return Ok(FlushResult {
                    is_canceled: false,
                    is_completed: true,
                })
            }
            Err(_) => return Err(PipeError::AlreadyWriting),
        }
        let _busy = BusyGuard { shared: &self.shared };
        self.flush_loop(cancel, timeout).await
    }

    async fn flush_loop(
        &self,
        cancel: Option<&CancellationToken>,
        timeout_override: Option<Duration>,
    ) -> Result<FlushResult, PipeError> {
        let mut attempts_left = self.retry_write_count();
        loop {
            let timeout_ms = timeout_override.map_or_else(
                || self.shared.default_timeout_ms.load(Ordering::Relaxed),
                |d| d.as_millis() as i64,
            );
            // Zero-retry flushes defer timeout responsibility to a caller
            // token when one is present; with retries configured, the
            // internal timeout arms alongside the caller token.
            let timeout_armed =
                timeout_ms > 0 && (cancel.is_none() || self.retry_write_count() > 0);

            // Wait for an attached sink, bounded by the internal timeout
            // so callers are not parked past it during a transport swap.
            let taken = loop {
                let notified = self.shared.state_change.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let mut st = self.lock();
                    if st.completed {
                        return Ok(FlushResult {
                            is_canceled: false,
                            is_completed: true,
                        });
                    }
                    if matches!(st.slot, Slot::Attached(_)) {
                        let Slot::Attached(att) = std::mem::replace(&mut st.slot, Slot::Empty)
                        else {
                            unreachable!()
                        };
                        st.slot = Slot::Taken(TakenMeta {
                            complete_when_done: att.complete_when_done,
                            detach: att.detach.clone(),
                            ident: att.ident,
                        });
                        break Some((att, st.generation, st.op_cancel.clone()));
                    }
                }
                match cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = notified => {}
                            _ = token.cancelled() => {
                                self.behavior().on_cancel();
                                return Err(PipeError::Canceled);
                            }
                        }
                    }
                    None if timeout_armed => {
                        tokio::select! {
                            _ = notified => {}
                            _ = tokio::time::sleep(Duration::from_millis(timeout_ms as u64)) => {
                                break None;
                            }
                        }
                    }
                    None => notified.await,
                }
            };

            // `attempt_bytes` is what this attempt pushed, kept for the
            // data-written callback and the post-success discard.
            let (outcome, attempt_bytes) = match taken {
                None => (Outcome::Timeout, Bytes::new()),
                Some((att, generation, op_cancel)) => {
                    let mut sink = att.sink;
                    let complete_when_done = att.complete_when_done;
                    let detach = att.detach;

                    // Snapshot the buffer and record the delivery
                    // watermark before the await, so a retry on the same
                    // sink resumes rather than re-delivering.
                    let (bytes, start) = {
                        let mut st = self.lock();
                        let start = if st.flushed_generation == Some(generation) {
                            st.flushed_pos.min(st.buffer.len())
                        } else {
                            0
                        };
                        let bytes = Bytes::copy_from_slice(&st.buffer[..]);
                        st.flushed_generation = Some(generation);
                        st.flushed_pos = bytes.len();
                        (bytes, start)
                    };

                    let outcome = {
                        let fut = async {
                            sink.write(&bytes[start..]).await?;
                            sink.flush().await
                        };
                        tokio::pin!(fut);
                        match (cancel, timeout_armed) {
                            (Some(token), true) => tokio::select! {
                                r = &mut fut => Outcome::Inner(r),
                                _ = token.cancelled() => Outcome::External,
                                _ = tokio::time::sleep(Duration::from_millis(timeout_ms as u64)) => {
                                    Outcome::Timeout
                                }
                                _ = op_cancel.cancelled() => Outcome::OpCancel,
                                _ = detach.cancelled() => Outcome::Detach,
                            },
                            (Some(token), false) => tokio::select! {
                                r = &mut fut => Outcome::Inner(r),
                                _ = token.cancelled() => Outcome::External,
                                _ = op_cancel.cancelled() => Outcome::OpCancel,
                                _ = detach.cancelled() => Outcome::Detach,
                            },
                            (None, true) => tokio::select! {
                                r = &mut fut => Outcome::Inner(r),
                                _ = tokio::time::sleep(Duration::from_millis(timeout_ms as u64)) => {
                                    Outcome::Timeout
                                }
                                _ = op_cancel.cancelled() => Outcome::OpCancel,
                                _ = detach.cancelled() => Outcome::Detach,
                            },
                            (None, false) => tokio::select! {
                                r = &mut fut => Outcome::Inner(r),
                                _ = op_cancel.cancelled() => Outcome::OpCancel,
                                _ = detach.cancelled() => Outcome::Detach,
                            },
                        }
                    };
                    self.put_back(sink, generation, complete_when_done);
                    let outcome = match outcome {
                        Outcome::Inner(Err(io_err))
                            if self.lock().generation != generation =>
                        {
                            self.behavior()
                                .on_swallowed(&PipeError::Transport(io_err));
                            continue;
                        }
                        other => other,
                    };
                    (outcome, bytes)
                }
            };

            let behavior = self.behavior();
            match outcome {
                Outcome::External => {
                    behavior.on_cancel();
                    return Err(PipeError::Canceled);
                }
                Outcome::OpCancel => {
                    let mut st = self.lock();
                    st.op_cancel = CancellationToken::new();
                    let completed = st.completed;
                    drop(st);
                    let result = FlushResult {
                        is_canceled: true,
                        is_completed: completed,
                    };
                    if behavior.return_inner_canceled() {
                        return Ok(result);
                    }
                    continue;
                }
                Outcome::Detach => {
                    if behavior.return_inner_canceled() {
                        return Ok(FlushResult {
                            is_canceled: true,
                            is_completed: self.is_completed(),
                        });
                    }
                    continue;
                }
                Outcome::Timeout => {
                    if attempts_left > 0 {
                        attempts_left -= 1;
                        continue;
                    }
                    let err = PipeError::Timeout {
                        elapsed: Duration::from_millis(timeout_ms as u64),
                    };
                    match behavior.on_error(&err) {
                        ErrorAction::Retry => {
                            attempts_left = self.retry_write_count();
                            continue;
                        }
                        ErrorAction::Cancel => {
                            return Ok(FlushResult {
                                is_canceled: true,
                                is_completed: self.is_completed(),
                            })
                        }
                        ErrorAction::Propagate => return Err(err),
                    }
                }
                Outcome::Inner(Err(io_err)) => {
                    let err = PipeError::Transport(io_err);
                    match behavior.on_error(&err) {
                        ErrorAction::Retry => continue,
                        ErrorAction::Cancel => {
                            return Ok(FlushResult {
                                is_canceled: true,
                                is_completed: self.is_completed(),
                            })
                        }
                        ErrorAction::Propagate => return Err(err),
                    }
                }
                Outcome::Inner(Ok(result)) => {
                    if result.is_completed {
                        match behavior.on_inner_completed() {
                            CompletionAction::Retry => {
                                self.close(false);
                                continue;
                            }
                            CompletionAction::Propagate => return Err(PipeError::SinkCompleted),
                            CompletionAction::Complete => {
                                self.close(true);
                                return Ok(FlushResult {
                                    is_canceled: false,
                                    is_completed: true,
                                });
                            }
                        }
                    }
                    if result.is_canceled {
                        if behavior.return_inner_canceled() {
                            return Ok(result);
                        }
                        continue;
                    }

                    // Delivered: discard exactly the snapshot, keeping any
                    // bytes appended since, and report what went out.
                    {
                        let mut st = self.lock();
                        let delivered = attempt_bytes.len().min(st.buffer.len());
                        st.buffer.advance(delivered);
                        st.flushed_pos = 0;
                    }
                    if let Some(cb) = self
                        .shared
                        .on_data_written
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .as_ref()
                    {
                        cb(&attempt_bytes);
                    }
                    return Ok(FlushResult {
                        is_canceled: false,
                        is_completed: false,
                    });
                }
            }
        }
    }

    fn put_back(&self, sink: Box<dyn ByteSink>, generation: u64, complete_when_done: bool) {
        let mut st = self.lock();
        if st.generation == generation {
            if let Slot::Taken(meta) = &st.slot {
                let (complete_when_done, detach, ident) =
                    (meta.complete_when_done, meta.detach.clone(), meta.ident);
                st.slot = Slot::Attached(Attachment {
                    sink,
                    complete_when_done,
                    detach,
                    ident,
                });
                return;
            }
        }
        drop(st);
        let mut sink = sink;
        if complete_when_done {
            sink.complete();
        }
    }
}

fn dispose_previous(prev: Slot) {
    match prev {
        Slot::Empty => {}
        Slot::Attached(mut att) => {
            att.detach.cancel();
            if att.complete_when_done {
                att.sink.complete();
            }
        }
        Slot::Taken(meta) => meta.detach.cancel(),
    }
}

struct BusyGuard<'a> {
    shared: &'a Shared,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let completed = self
            .shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .completed;
        let next = if completed { COMPLETED_IDLE } else { IDLE };
        self.shared.writing.store(next, Ordering::Release);
    }
}
