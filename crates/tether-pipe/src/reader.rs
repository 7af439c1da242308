//! Stable decorator over a [`ByteSource`].
//!
//! A [`StableReader`] keeps the read side of a connection usable while the
//! transport underneath it is swapped or torn down. The attached source
//! can be replaced atomically while a read is in flight; the read either
//! rides over to the replacement or reports a canceled result, depending
//! on the installed [`PipeBehavior`].

use std::sync::atomic::{AtomicI64, AtomicI8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::behavior::{CompletionAction, DefaultBehavior, ErrorAction, PipeBehavior};
use crate::error::PipeError;
use crate::pipe::{ByteSource, ReadResult};

const IDLE: i8 = 0;
const BUSY: i8 = 1;
const COMPLETED_IDLE: i8 = -1;

/// Timeout disabled sentinel for the millisecond fields.
const NO_TIMEOUT: i64 = -1;

/// A hot-swappable, cancel-aware reader over a [`ByteSource`].
///
/// Cheap to clone; all clones share the same state. At most one read may
/// be in flight at a time across all clones ([`PipeError::AlreadyReading`]
/// otherwise).
#[derive(Clone)]
pub struct StableReader {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    /// Signaled on every attach, detach, and completion.
    state_change: Notify,
    /// IDLE / BUSY / COMPLETED_IDLE; excludes concurrent reads and carries
    /// completion observed while no read was in flight.
    reading: AtomicI8,
    behavior: Mutex<Arc<dyn PipeBehavior>>,
    default_timeout_ms: AtomicI64,
}

struct State {
    slot: Slot,
    /// Bumped on every attach and detach; used to detect that the source
    /// a read was driving is no longer the current one.
    generation: u64,
    completed: bool,
    complete_error: Option<String>,
    /// Cancels the in-flight read with a canceled *result* (not an error).
    op_cancel: CancellationToken,
    /// Generation at the time of the last successful read; `advance_to`
    /// applies only while this is still current.
    last_read_generation: Option<u64>,
}

enum Slot {
    Empty,
    Attached(Attachment),
    /// The source is out with the in-flight read.
    Taken(TakenMeta),
}

struct Attachment {
    source: Box<dyn ByteSource>,
    complete_when_done: bool,
    /// Canceled when this attachment is replaced or detached.
    detach: CancellationToken,
    /// Identity of the boxed source, for same-inner detection.
    ident: usize,
}

struct TakenMeta {
    complete_when_done: bool,
    detach: CancellationToken,
    ident: usize,
}

fn ident_of(source: &dyn ByteSource) -> usize {
    source as *const dyn ByteSource as *const () as usize
}

enum Outcome {
    Inner(std::io::Result<ReadResult>),
    External,
    OpCancel,
    Detach,
    Timeout,
}

impl Default for StableReader {
    fn default() -> Self {
        Self::new()
    }
}

impl StableReader {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    slot: Slot::Empty,
                    generation: 0,
                    completed: false,
                    complete_error: None,
                    op_cancel: CancellationToken::new(),
                    last_read_generation: None,
                }),
                state_change: Notify::new(),
                reading: AtomicI8::new(IDLE),
                behavior: Mutex::new(Arc::new(DefaultBehavior)),
                default_timeout_ms: AtomicI64::new(NO_TIMEOUT),
            }),
        }
    }

    /// Install the behavior consulted on errors and inner completion.
    pub fn set_behavior(&self, behavior: Arc<dyn PipeBehavior>) {
        *self.shared.behavior.lock().unwrap_or_else(|e| e.into_inner()) = behavior;
    }

    /// The currently-installed behavior.
    pub fn behavior(&self) -> Arc<dyn PipeBehavior> {
        self.shared
            .behavior
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Default timeout applied to reads made without a caller token.
    /// `None` disables the internal timeout.
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

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    pub fn has_inner(&self) -> bool {
        !matches!(self.lock().slot, Slot::Empty)
    }

    /// Attach a source, replacing the current one. Returns `false` if the
    /// reader has already completed.
    ///
    /// Re-setting the source that is already attached only updates
    /// `complete_when_done`; no state change fires. Otherwise the previous
    /// attachment's pending operation is canceled, and the previous source
    /// is completed iff its own `complete_when_done` was set.
    pub fn set_inner(&self, source: Box<dyn ByteSource>, complete_when_done: bool) -> bool {
        let mut st = self.lock();
        if st.completed {
            return false;
        }
        let ident = ident_of(&*source);
        if let Slot::Attached(att) = &mut st.slot {
            if att.ident == ident {
                att.complete_when_done = complete_when_done;
                return true;
            }
        }
        let prev = std::mem::replace(
            &mut st.slot,
            Slot::Attached(Attachment {
                source,
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

    /// Detach the current source; with `complete` the reader itself
    /// transitions to completed and every later operation reports a
    /// completed result. Returns `false` if already completed.
    pub fn close(&self, complete: bool) -> bool {
        let mut st = self.lock();
        if st.completed {
            return false;
        }
        let prev = std::mem::replace(&mut st.slot, Slot::Empty);
        st.generation = st.generation.wrapping_add(1);
        if complete {
            st.completed = true;
            let _ = self.shared.reading.compare_exchange(
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

    /// Error recorded by the first [`complete`](Self::complete) call.
    pub fn complete_error(&self) -> Option<String> {
        self.lock().complete_error.clone()
    }

    /// Make the in-flight read, if any, return a canceled result instead
    /// of data. No-op when idle or when no source is attached.
    pub fn cancel_pending_read(&self) {
        if self.shared.reading.load(Ordering::Acquire) != BUSY {
            return;
        }
        let st = self.lock();
        if !st.completed && matches!(st.slot, Slot::Taken(_)) {
            st.op_cancel.cancel();
        }
    }

    /// Synchronous read attempt: `None` when nothing new is buffered.
    pub fn try_read(&self) -> Result<Option<ReadResult>, PipeError> {
        let mut st = self.lock();
        if st.completed {
            return Ok(Some(ReadResult::completed()));
        }
        let st = &mut *st;
        match &mut st.slot {
            Slot::Attached(att) => {
                let read = att.source.try_read().map_err(PipeError::Transport)?;
                if read.is_some() {
                    st.last_read_generation = Some(st.generation);
                }
                Ok(read)
            }
            _ => Ok(None),
        }
    }

    /// Report consumption of the buffer returned by the last read.
    /// Equivalent to `advance_to_examined(consumed, consumed)`.
    pub fn advance_to(&self, consumed: usize) -> Result<(), PipeError> {
        self.advance_to_examined(consumed, consumed)
    }

    /// Report consumption and examination of the last returned buffer.
    ///
    /// Applies to the source the last read was served from; if the inner
    /// has been swapped since, the call is swallowed through the behavior
    /// and succeeds as a no-op.
    pub fn advance_to_examined(&self, consumed: usize, examined: usize) -> Result<(), PipeError> {
        let mut st = self.lock();
        if st.completed {
            return Ok(());
        }
        if st.last_read_generation != Some(st.generation) {
            drop(st);
            self.behavior().on_swallowed(&PipeError::Transport(std::io::Error::other(
                "inner source changed since the last read; advance ignored",
            )));
            return Ok(());
        }
        match &mut st.slot {
            Slot::Attached(att) => att
                .source
                .advance_to(consumed, examined)
                .map_err(PipeError::Transport),
            _ => {
                drop(st);
                self.behavior().on_swallowed(&PipeError::Transport(
                    std::io::Error::other("no attached source; advance ignored"),
                ));
                Ok(())
            }
        }
    }

    /// Wait for the next chunk of data from the attached source.
    ///
    /// With a caller token, timeout responsibility is the caller's: the
    /// internal default timeout does not arm, and a triggered token
    /// surfaces as [`PipeError::Canceled`]. Without one, the default
    /// timeout (if set) synthesizes [`PipeError::Timeout`] routed through
    /// the behavior.
    pub async fn read(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<ReadResult, PipeError> {
        match self
            .shared
            .reading
            .compare_exchange(IDLE, BUSY, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(COMPLETED_IDLE) => return Ok(ReadResult::completed()),
            Err(_) => return Err(PipeError::AlreadyReading),
        }
        let _busy = BusyGuard { shared: &self.shared };
        self.read_loop(cancel).await
    }

    async fn read_loop(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<ReadResult, PipeError> {
        loop {
            let timeout_ms = self.shared.default_timeout_ms.load(Ordering::Relaxed);

            // Wait until a source is attached, taking it out for the
            // duration of the await so no lock is held across I/O. The
            // internal timeout bounds this wait too, so a caller is never
            // parked longer than the configured timeout while the
            // transport is being replaced.
            let taken = loop {
                let notified = self.shared.state_change.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let mut st = self.lock();
                    if st.completed {
                        return Ok(ReadResult::completed());
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
                        st.last_read_generation = Some(st.generation);
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
                    None if timeout_ms > 0 => {
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

            let outcome = match taken {
                None => Outcome::Timeout,
                Some((att, generation, op_cancel)) => {
                    let mut source = att.source;
                    let complete_when_done = att.complete_when_done;
                    let detach = att.detach;
                    let outcome = {
                        let fut = source.read();
                        tokio::pin!(fut);
                        if let Some(token) = cancel {
                            tokio::select! {
                                r = &mut fut => Outcome::Inner(r),
                                _ = token.cancelled() => Outcome::External,
                                _ = op_cancel.cancelled() => Outcome::OpCancel,
                                _ = detach.cancelled() => Outcome::Detach,
                            }
                        } else if timeout_ms > 0 {
                            tokio::select! {
                                r = &mut fut => Outcome::Inner(r),
                                _ = tokio::time::sleep(Duration::from_millis(timeout_ms as u64)) => {
                                    Outcome::Timeout
                                }
                                _ = op_cancel.cancelled() => Outcome::OpCancel,
                                _ = detach.cancelled() => Outcome::Detach,
                            }
                        } else {
                            tokio::select! {
                                r = &mut fut => Outcome::Inner(r),
                                _ = op_cancel.cancelled() => Outcome::OpCancel,
                                _ = detach.cancelled() => Outcome::Detach,
                            }
                        }
                    };
                    self.put_back(source, generation, complete_when_done);
                    match outcome {
                        // An error raced with a swap belongs to a pipe
                        // that is no longer ours.
                        Outcome::Inner(Err(io_err))
                            if self.lock().generation != generation =>
                        {
                            self.behavior()
                                .on_swallowed(&PipeError::Transport(io_err));
                            continue;
                        }
                        other => other,
                    }
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
                    return Ok(ReadResult::canceled(completed));
                }
                Outcome::Detach => {
                    if behavior.return_inner_canceled() {
                        return Ok(ReadResult::canceled(self.is_completed()));
                    }
                    continue;
                }
                Outcome::Timeout => {
                    let err = PipeError::Timeout {
                        elapsed: Duration::from_millis(timeout_ms as u64),
                    };
                    match behavior.on_error(&err) {
                        ErrorAction::Retry => continue,
                        ErrorAction::Cancel => {
                            return Ok(ReadResult::canceled(self.is_completed()))
                        }
                        ErrorAction::Propagate => return Err(err),
                    }
                }
                Outcome::Inner(Err(io_err)) => {
                    let err = PipeError::Transport(io_err);
                    match behavior.on_error(&err) {
                        ErrorAction::Retry => continue,
                        ErrorAction::Cancel => {
                            return Ok(ReadResult::canceled(self.is_completed()))
                        }
                        ErrorAction::Propagate => return Err(err),
                    }
                }
                Outcome::Inner(Ok(result)) => {
                    if self.is_completed() {
                        return Ok(ReadResult {
                            buffer: result.buffer,
                            is_canceled: false,
                            is_completed: true,
                        });
                    }
                    if result.is_completed {
                        match behavior.on_inner_completed() {
                            CompletionAction::Retry => {
                                self.close(false);
                                if !result.buffer.is_empty() {
                                    return Ok(ReadResult {
                                        buffer: result.buffer,
                                        is_canceled: false,
                                        is_completed: false,
                                    });
                                }
                                continue;
                            }
                            CompletionAction::Propagate => {
                                return Err(PipeError::SourceCompleted)
                            }
                            CompletionAction::Complete => {
                                self.close(true);
                                return Ok(ReadResult {
                                    buffer: result.buffer,
                                    is_canceled: false,
                                    is_completed: true,
                                });
                            }
                        }
                    }
                    if result.buffer.is_empty()
                        && (!result.is_canceled || !behavior.return_inner_canceled())
                    {
                        continue;
                    }
                    return Ok(result);
                }
            }
        }
    }

    /// Return the source after the await, or dispose it if the attachment
    /// was replaced while it was out.
    fn put_back(&self, source: Box<dyn ByteSource>, generation: u64, complete_when_done: bool) {
        let mut st = self.lock();
        if st.generation == generation {
            if let Slot::Taken(meta) = &st.slot {
                let (complete_when_done, detach, ident) =
                    (meta.complete_when_done, meta.detach.clone(), meta.ident);
                st.slot = Slot::Attached(Attachment {
                    source,
                    complete_when_done,
                    detach,
                    ident,
                });
                return;
            }
        }
        drop(st);
        let mut source = source;
        if complete_when_done {
            source.complete();
        }
    }
}

fn dispose_previous(prev: Slot) {
    match prev {
        Slot::Empty => {}
        Slot::Attached(mut att) => {
            att.detach.cancel();
            if att.complete_when_done {
                att.source.complete();
            }
        }
        // The in-flight read owns the source; it observes the canceled
        // detach token and disposes it via its recorded flag.
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
        self.shared.reading.store(next, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamSource;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{duplex, AsyncWriteExt};

    /// Source scripted from a queue of canned outcomes.
    struct Scripted {
        steps: std::collections::VecDeque<ScriptStep>,
        advances: Arc<AtomicUsize>,
    }

    enum ScriptStep {
        Data(&'static [u8]),
        Error(io::ErrorKind),
        Completed,
        Pend,
    }

    impl Scripted {
        fn new(steps: Vec<ScriptStep>) -> Self {
            Self {
                steps: steps.into(),
                advances: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait::async_trait]
    impl ByteSource for Scripted {
        async fn read(&mut self) -> io::Result<ReadResult> {
            match self.steps.pop_front() {
                Some(ScriptStep::Data(d)) => Ok(ReadResult {
                    buffer: bytes::Bytes::from_static(d),
                    is_canceled: false,
                    is_completed: false,
                }),
                Some(ScriptStep::Error(kind)) => Err(io::Error::from(kind)),
                Some(ScriptStep::Completed) | None => Ok(ReadResult::completed()),
                Some(ScriptStep::Pend) => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        fn try_read(&mut self) -> io::Result<Option<ReadResult>> {
            Ok(None)
        }

        fn advance_to(&mut self, _consumed: usize, _examined: usize) -> io::Result<()> {
            self.advances.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn complete(&mut self) {}
    }

    #[tokio::test]
    async fn read_returns_data_from_attached_source() {
        let reader = StableReader::new();
        reader.set_inner(
            Box::new(Scripted::new(vec![ScriptStep::Data(b"abc")])),
            false,
        );
        let r = reader.read(None).await.unwrap();
        assert_eq!(&r.buffer[..], b"abc");
        assert!(!r.is_completed);
    }

    #[tokio::test]
    async fn read_waits_for_attach() {
        let reader = StableReader::new();
        let clone = reader.clone();
        let task = tokio::spawn(async move { clone.read(None).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        reader.set_inner(
            Box::new(Scripted::new(vec![ScriptStep::Data(b"late")])),
            false,
        );
        let r = task.await.unwrap().unwrap();
        assert_eq!(&r.buffer[..], b"late");
    }

    #[tokio::test]
    async fn completed_reader_short_circuits() {
        let reader = StableReader::new();
        reader.close(true);
        let r = reader.read(None).await.unwrap();
        assert!(r.is_completed);
        assert!(!reader.set_inner(
            Box::new(Scripted::new(vec![ScriptStep::Data(b"x")])),
            false
        ));
    }

    #[tokio::test]
    async fn concurrent_read_is_rejected() {
        let reader = StableReader::new();
        reader.set_inner(Box::new(Scripted::new(vec![ScriptStep::Pend])), false);
        let clone = reader.clone();
        let task = tokio::spawn(async move { clone.read(None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = reader.read(None).await.unwrap_err();
        assert!(matches!(err, PipeError::AlreadyReading));

        reader.close(true);
        let r = task.await.unwrap().unwrap();
        assert!(r.is_canceled || r.is_completed);
    }

    #[tokio::test]
    async fn default_timeout_propagates_with_default_behavior() {
        let reader = StableReader::new();
        reader.set_default_timeout(Some(Duration::from_millis(50)));
        reader.set_inner(Box::new(Scripted::new(vec![ScriptStep::Pend])), false);

        let started = std::time::Instant::now();
        let err = reader.read(None).await.unwrap_err();
        assert!(matches!(err, PipeError::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn caller_token_suppresses_internal_timeout() {
        let reader = StableReader::new();
        reader.set_default_timeout(Some(Duration::from_millis(10)));
        reader.set_inner(Box::new(Scripted::new(vec![ScriptStep::Pend])), false);

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            cancel.cancel();
        });
        // The 10ms internal timeout must not fire; the external token does.
        let err = reader.read(Some(&token)).await.unwrap_err();
        assert!(matches!(err, PipeError::Canceled));
    }

    #[tokio::test]
    async fn cancel_pending_read_yields_canceled_result() {
        let reader = StableReader::new();
        reader.set_inner(Box::new(Scripted::new(vec![ScriptStep::Pend])), false);
        let clone = reader.clone();
        let task = tokio::spawn(async move { clone.read(None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        reader.cancel_pending_read();
        let r = task.await.unwrap().unwrap();
        assert!(r.is_canceled);
        assert!(!r.is_completed);
        assert!(!reader.is_completed());
    }

    #[tokio::test]
    async fn swap_during_read_returns_canceled_result_by_default() {
        let reader = StableReader::new();
        reader.set_inner(Box::new(Scripted::new(vec![ScriptStep::Pend])), false);
        let clone = reader.clone();
        let task = tokio::spawn(async move { clone.read(None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        reader.set_inner(
            Box::new(Scripted::new(vec![ScriptStep::Data(b"next")])),
            false,
        );
        let r = task.await.unwrap().unwrap();
        assert!(r.is_canceled);

        // The replacement serves the following read.
        let r = reader.read(None).await.unwrap();
        assert_eq!(&r.buffer[..], b"next");
    }

    struct RideOver;
    impl PipeBehavior for RideOver {
        fn return_inner_canceled(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn swap_during_read_rides_over_when_behavior_suppresses() {
        let reader = StableReader::new();
        reader.set_behavior(Arc::new(RideOver));
        reader.set_inner(Box::new(Scripted::new(vec![ScriptStep::Pend])), false);
        let clone = reader.clone();
        let task = tokio::spawn(async move { clone.read(None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        reader.set_inner(
            Box::new(Scripted::new(vec![ScriptStep::Data(b"swapped")])),
            false,
        );
        let r = task.await.unwrap().unwrap();
        assert_eq!(&r.buffer[..], b"swapped");
    }

    #[tokio::test]
    async fn inner_completion_completes_reader_by_default() {
        let reader = StableReader::new();
        reader.set_inner(
            Box::new(Scripted::new(vec![ScriptStep::Completed])),
            false,
        );
        let r = reader.read(None).await.unwrap();
        assert!(r.is_completed);
        assert!(reader.is_completed());
    }

    struct RetryOnError {
        retries: AtomicUsize,
    }
    impl PipeBehavior for RetryOnError {
        fn on_error(&self, _error: &PipeError) -> ErrorAction {
            self.retries.fetch_add(1, Ordering::SeqCst);
            ErrorAction::Retry
        }
    }

    #[tokio::test]
    async fn transport_error_retries_per_behavior() {
        let reader = StableReader::new();
        let behavior = Arc::new(RetryOnError {
            retries: AtomicUsize::new(0),
        });
        reader.set_behavior(behavior.clone());
        reader.set_inner(
            Box::new(Scripted::new(vec![
                ScriptStep::Error(io::ErrorKind::ConnectionReset),
                ScriptStep::Data(b"recovered"),
            ])),
            false,
        );
        let r = reader.read(None).await.unwrap();
        assert_eq!(&r.buffer[..], b"recovered");
        assert_eq!(behavior.retries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn advance_after_swap_is_swallowed() {
        let (mut tx, rx) = duplex(64);
        let reader = StableReader::new();
        reader.set_inner(Box::new(StreamSource::new(rx)), false);

        tx.write_all(b"data").await.unwrap();
        let r = reader.read(None).await.unwrap();
        assert_eq!(&r.buffer[..], b"data");

        // Swap between the read returning and the advance call.
        let (_tx2, rx2) = duplex(64);
        reader.set_inner(Box::new(StreamSource::new(rx2)), false);
        assert!(reader.advance_to(4).is_ok());
    }

    #[tokio::test]
    async fn advance_applies_to_current_source() {
        let (mut tx, rx) = duplex(64);
        let reader = StableReader::new();
        reader.set_inner(Box::new(StreamSource::new(rx)), false);

        tx.write_all(b"one two").await.unwrap();
        let r = reader.read(None).await.unwrap();
        assert_eq!(&r.buffer[..], b"one two");
        reader.advance_to(4).unwrap();

        let r = reader.read(None).await.unwrap();
        assert_eq!(&r.buffer[..], b"two");
    }

    #[tokio::test]
    async fn close_wakes_pending_read_with_completion() {
        let reader = StableReader::new();
        reader.set_inner(Box::new(Scripted::new(vec![ScriptStep::Pend])), false);
        let clone = reader.clone();
        let task = tokio::spawn(async move { clone.read(None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        reader.close(true);
        let r = task.await.unwrap().unwrap();
        assert!(r.is_canceled || r.is_completed);
        let r = reader.read(None).await.unwrap();
        assert!(r.is_completed);
    }

    #[tokio::test]
    async fn resetting_same_source_does_not_signal() {
        let reader = StableReader::new();
        let src = Box::new(Scripted::new(vec![ScriptStep::Data(b"x")]));
        // Identity is by boxed pointer, so setting twice requires the same
        // allocation; exercised here via the returned bool only.
        assert!(reader.set_inner(src, false));
        assert!(reader.has_inner());
    }
}
