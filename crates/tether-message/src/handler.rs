//! Pull-to-push adapter: a loop that reads messages and hands them to a
//! hook, with a dynamically adjustable idle-read timeout and an optional
//! per-message handling timeout.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use tether_pipe::PipeError;

use crate::codec::Decoder;
use crate::error::MessageError;
use crate::reader::MessageReader;

/// Why the read loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop` was called.
    StoppedLoop,
    /// The hook declined a message.
    ProcessMessage,
    /// The configured message limit was reached.
    MaxMessageNumber,
    /// The reader completed.
    ReaderCompleted,
    /// The idle-read timeout fired and the hook did not absorb it.
    ReadTimeout,
    /// An error the hook did not absorb.
    UnhandledError,
}

/// User callbacks driven by a [`MessagePump`].
///
/// Only [`handle`](MessageHook::handle) is required. The remaining hooks
/// default to continuing the loop.
#[async_trait]
pub trait MessageHook<T: Send + 'static>: Send {
    /// Process one message; `None` is a consumed cancel (delivered only
    /// when the pump is configured to hand those through). Returning
    /// `false` stops the loop with [`StopReason::ProcessMessage`].
    async fn handle(&mut self, message: Option<T>, cancel: &CancellationToken) -> bool;

    fn on_loop_start(&mut self) {}

    fn on_loop_stop(&mut self, reason: StopReason) {
        let _ = reason;
    }

    /// The idle-read timeout fired. Return `false` to stop the loop with
    /// [`StopReason::ReadTimeout`].
    fn on_read_timeout(&mut self) -> bool {
        true
    }

    /// The per-message handling timeout fired (the handler was canceled
    /// and has returned). Return `false` to stop the loop.
    fn on_handling_timeout(&mut self) -> bool {
        true
    }

    /// A read error the loop would otherwise stop on. Return `false` to
    /// stop with [`StopReason::UnhandledError`].
    fn on_error(&mut self, error: &MessageError) -> bool {
        let _ = error;
        false
    }
}

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;

/// Drives a [`MessageReader`] and pushes each message into a
/// [`MessageHook`].
pub struct MessagePump<D: Decoder> {
    reader: MessageReader<D>,
    hook: Arc<tokio::sync::Mutex<Box<dyn MessageHook<D::Message>>>>,
    shared: Arc<PumpShared>,
}

struct PumpShared {
    state: AtomicU8,
    stop: Mutex<CancellationToken>,
    /// Effective idle-read timeout in ms; `<= 0` means suspended.
    timeout_tx: watch::Sender<i64>,
    stopped_tx: watch::Sender<Option<StopReason>>,
    default_read_timeout_ms: AtomicI64,
    handling_timeout_ms: AtomicI64,
    auto_apply_timeout: AtomicBool,
    handle_cancel_messages: AtomicBool,
}

impl PumpShared {
    fn handling_timeout(&self) -> Option<Duration> {
        match self.handling_timeout_ms.load(Ordering::Relaxed) {
            ms if ms > 0 => Some(Duration::from_millis(ms as u64)),
            _ => None,
        }
    }
}

impl<D> MessagePump<D>
where
    D: Decoder + 'static,
{
    pub fn new(reader: MessageReader<D>, hook: Box<dyn MessageHook<D::Message>>) -> Self {
        let (timeout_tx, _) = watch::channel(-1i64);
        let (stopped_tx, _) = watch::channel(None);
        Self {
            reader,
            hook: Arc::new(tokio::sync::Mutex::new(hook)),
            shared: Arc::new(PumpShared {
                state: AtomicU8::new(STATE_IDLE),
                stop: Mutex::new(CancellationToken::new()),
                timeout_tx,
                stopped_tx,
                default_read_timeout_ms: AtomicI64::new(-1),
                handling_timeout_ms: AtomicI64::new(-1),
                auto_apply_timeout: AtomicBool::new(true),
                handle_cancel_messages: AtomicBool::new(false),
            }),
        }
    }

    pub fn reader(&self) -> &MessageReader<D> {
        &self.reader
    }

    /// Idle-read timeout applied at the top of each cycle while
    /// auto-apply is on.
    pub fn set_default_read_timeout(&self, timeout: Option<Duration>) {
        let ms = timeout.map_or(-1, |d| d.as_millis() as i64);
        self.shared
            .default_read_timeout_ms
            .store(ms, Ordering::Relaxed);
    }

    /// Bound each hook invocation; the hook's token fires on expiry.
    pub fn set_handling_timeout(&self, timeout: Option<Duration>) {
        let ms = timeout.map_or(-1, |d| d.as_millis() as i64);
        self.shared.handling_timeout_ms.store(ms, Ordering::Relaxed);
    }

    /// Whether each cycle re-arms the default read timeout (on by
    /// default). Off, the caller re-arms per cycle via
    /// [`set_read_timeout`](Self::set_read_timeout).
    pub fn set_auto_apply_timeout(&self, enabled: bool) {
        self.shared
            .auto_apply_timeout
            .store(enabled, Ordering::Relaxed);
    }

    /// Whether consumed cancels (empty messages) reach the hook.
    pub fn set_handle_cancel_messages(&self, enabled: bool) {
        self.shared
            .handle_cancel_messages
            .store(enabled, Ordering::Relaxed);
    }

    /// Adjust the idle-read timeout for the in-flight and following
    /// reads. `0` re-arms the default; negative suspends.
    pub fn set_read_timeout(&self, ms: i64) {
        let effective = if ms == 0 {
            self.shared.default_read_timeout_ms.load(Ordering::Relaxed)
        } else {
            ms
        };
        let _ = self.shared.timeout_tx.send(effective);
    }

    /// Clear the idle-read timeout; called by the loop itself as soon as
    /// a frame arrives, so handling is never bounded by the read timeout.
    pub fn suspend_read_timeout(&self) {
        let _ = self.shared.timeout_tx.send(-1);
    }

    /// Launch the loop. Returns `false` if it is already running.
    /// `max_messages` stops the loop after that many handled messages.
    pub fn start(&self, max_messages: Option<u64>) -> bool {
        if self
            .shared
            .state
            .compare_exchange(
                STATE_IDLE,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        let stop = CancellationToken::new();
        *self.shared.stop.lock().unwrap_or_else(|e| e.into_inner()) = stop.clone();
        let _ = self.shared.stopped_tx.send(None);
        self.suspend_read_timeout();

        let reader = self.reader.clone();
        let hook = Arc::clone(&self.hook);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(run_loop(reader, hook, shared, stop, max_messages));
        true
    }

    /// Ask the loop to stop. Returns `false` when it was not running.
    pub fn stop(&self, cancel_pending_read: bool) -> bool {
        if self.shared.state.load(Ordering::Acquire) != STATE_RUNNING {
            return false;
        }
        self.shared
            .stop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        if cancel_pending_read {
            self.reader.cancel_pending_read();
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    /// Wait for the loop to exit and return why. Returns immediately
    /// with the last reason once stopped.
    pub async fn stopped(&self) -> StopReason {
        let mut rx = self.shared.stopped_tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return StopReason::StoppedLoop;
            }
        }
    }
}

enum HandleOutcome {
    Done(bool),
    TimedOut(bool),
}

async fn run_loop<D>(
    reader: MessageReader<D>,
    hook: Arc<tokio::sync::Mutex<Box<dyn MessageHook<D::Message>>>>,
    shared: Arc<PumpShared>,
    stop: CancellationToken,
    max_messages: Option<u64>,
) where
    D: Decoder + 'static,
{
    let mut hook = hook.lock().await;
    hook.on_loop_start();
    let mut handled: u64 = 0;

    let reason = loop {
        if stop.is_cancelled() {
            break StopReason::StoppedLoop;
        }
        if shared.auto_apply_timeout.load(Ordering::Relaxed) {
            let default = shared.default_read_timeout_ms.load(Ordering::Relaxed);
            let _ = shared.timeout_tx.send(default);
        }

        // The watcher turns the active timeout into a cancellation of
        // this read; adjustments mid-read re-arm it.
        let read_token = CancellationToken::new();
        let timeout_fired = Arc::new(AtomicBool::new(false));
        let watcher = tokio::spawn(watch_timeout(
            shared.timeout_tx.subscribe(),
            read_token.clone(),
            Arc::clone(&timeout_fired),
        ));

        let result = tokio::select! {
            r = reader.read_next(Some(&read_token)) => r,
            _ = stop.cancelled() => {
                watcher.abort();
                break StopReason::StoppedLoop;
            }
        };
        watcher.abort();
        let _ = shared.timeout_tx.send(-1);

        let message = match result {
            Err(MessageError::Pipe(PipeError::Canceled))
                if timeout_fired.load(Ordering::Acquire) =>
            {
                if !hook.on_read_timeout() {
                    break StopReason::ReadTimeout;
                }
                continue;
            }
            Err(e) => {
                if !hook.on_error(&e) {
                    break StopReason::UnhandledError;
                }
                continue;
            }
            Ok(m) => m,
        };

        if message.is_none() {
            if reader.is_completed() {
                break StopReason::ReaderCompleted;
            }
            if !shared.handle_cancel_messages.load(Ordering::Relaxed) || stop.is_cancelled() {
                continue;
            }
        }

        let handling_cancel = CancellationToken::new();
        let outcome = {
            let fut = hook.handle(message, &handling_cancel);
            tokio::pin!(fut);
            match shared.handling_timeout() {
                Some(t) => tokio::select! {
                    ok = &mut fut => HandleOutcome::Done(ok),
                    _ = tokio::time::sleep(t) => {
                        handling_cancel.cancel();
                        let ok = fut.await;
                        HandleOutcome::TimedOut(ok)
                    }
                },
                None => HandleOutcome::Done(fut.await),
            }
        };
        let proceed = match outcome {
            HandleOutcome::Done(ok) => ok,
            HandleOutcome::TimedOut(ok) => ok && hook.on_handling_timeout(),
        };
        if !proceed {
            break StopReason::ProcessMessage;
        }

        handled += 1;
        if let Some(max) = max_messages {
            if handled >= max {
                break StopReason::MaxMessageNumber;
            }
        }
    };

    hook.on_loop_stop(reason);
    shared.state.store(STATE_IDLE, Ordering::Release);
    let _ = shared.stopped_tx.send(Some(reason));
}

/// Counts down the active idle timeout; a change mid-sleep replaces the
/// timer, a non-positive value suspends it.
async fn watch_timeout(
    mut rx: watch::Receiver<i64>,
    token: CancellationToken,
    fired: Arc<AtomicBool>,
) {
    loop {
        let ms = *rx.borrow_and_update();
        if ms > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms as u64)) => {
                    fired.store(true, Ordering::Release);
                    token.cancel();
                    return;
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        } else if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::StringLineDecoder;
    use tether_pipe::{StableReader, StreamSource};
    use tokio::io::{duplex, AsyncWriteExt};

    struct Collector {
        seen: Arc<Mutex<Vec<Option<String>>>>,
        stop_on: Option<String>,
        absorb_timeouts: bool,
        reasons: Arc<Mutex<Vec<StopReason>>>,
    }

    impl Collector {
        fn new() -> (Self, Arc<Mutex<Vec<Option<String>>>>, Arc<Mutex<Vec<StopReason>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let reasons = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    seen: Arc::clone(&seen),
                    stop_on: None,
                    absorb_timeouts: false,
                    reasons: Arc::clone(&reasons),
                },
                seen,
                reasons,
            )
        }
    }

    #[async_trait]
    impl MessageHook<String> for Collector {
        async fn handle(&mut self, message: Option<String>, _cancel: &CancellationToken) -> bool {
            let stop = matches!((&self.stop_on, &message), (Some(s), Some(m)) if s == m);
            self.seen.lock().unwrap().push(message);
            !stop
        }

        fn on_loop_stop(&mut self, reason: StopReason) {
            self.reasons.lock().unwrap().push(reason);
        }

        fn on_read_timeout(&mut self) -> bool {
            self.absorb_timeouts
        }
    }

    fn pump_over(
        rx: tokio::io::DuplexStream,
        hook: Collector,
    ) -> MessagePump<StringLineDecoder> {
        let pipe = StableReader::new();
        pipe.set_inner(Box::new(StreamSource::new(rx)), true);
        let reader = MessageReader::new(pipe, StringLineDecoder::strings("\n"));
        MessagePump::new(reader, Box::new(hook))
    }

    #[tokio::test]
    async fn pushes_messages_until_reader_completes() {
        let (mut tx, rx) = duplex(256);
        let (hook, seen, reasons) = Collector::new();
        let pump = pump_over(rx, hook);

        assert!(pump.start(None));
        assert!(!pump.start(None));

        tx.write_all(b"a\nb\nc\n").await.unwrap();
        drop(tx);

        assert_eq!(pump.stopped().await, StopReason::ReaderCompleted);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[Some("a".into()), Some("b".into()), Some("c".into())]
        );
        assert_eq!(reasons.lock().unwrap().as_slice(), &[StopReason::ReaderCompleted]);
        assert!(!pump.is_running());
    }

    #[tokio::test]
    async fn hook_refusal_stops_with_process_message() {
        let (mut tx, rx) = duplex(256);
        let (mut hook, seen, _) = Collector::new();
        hook.stop_on = Some("bad".into());
        let pump = pump_over(rx, hook);

        pump.start(None);
        tx.write_all(b"ok\nbad\nunseen\n").await.unwrap();

        assert_eq!(pump.stopped().await, StopReason::ProcessMessage);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[Some("ok".into()), Some("bad".into())]
        );
    }

    #[tokio::test]
    async fn max_messages_bounds_the_loop() {
        let (mut tx, rx) = duplex(256);
        let (hook, seen, _) = Collector::new();
        let pump = pump_over(rx, hook);

        pump.start(Some(2));
        tx.write_all(b"1\n2\n3\n").await.unwrap();

        assert_eq!(pump.stopped().await, StopReason::MaxMessageNumber);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stop_exits_the_loop() {
        let (_tx, rx) = duplex(256);
        let (hook, _, _) = Collector::new();
        let pump = pump_over(rx, hook);

        pump.start(None);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(pump.stop(true));
        assert_eq!(pump.stopped().await, StopReason::StoppedLoop);

        // And it can be restarted.
        assert!(pump.start(None));
        pump.stop(true);
        assert_eq!(pump.stopped().await, StopReason::StoppedLoop);
    }

    #[tokio::test]
    async fn read_timeout_stops_unless_absorbed() {
        let (_tx, rx) = duplex(256);
        let (hook, _, _) = Collector::new();
        let pump = pump_over(rx, hook);
        pump.set_default_read_timeout(Some(Duration::from_millis(60)));

        pump.start(None);
        assert_eq!(pump.stopped().await, StopReason::ReadTimeout);
    }

    #[tokio::test]
    async fn absorbed_read_timeout_keeps_looping() {
        let (mut tx, rx) = duplex(256);
        let (mut hook, seen, _) = Collector::new();
        hook.absorb_timeouts = true;
        let pump = pump_over(rx, hook);
        pump.set_default_read_timeout(Some(Duration::from_millis(40)));

        pump.start(None);
        // Survive a couple of idle timeouts, then deliver.
        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.write_all(b"finally\n").await.unwrap();
        drop(tx);

        assert_eq!(pump.stopped().await, StopReason::ReaderCompleted);
        assert_eq!(seen.lock().unwrap().as_slice(), &[Some("finally".into())]);
    }

    struct SlowHook {
        canceled: Arc<AtomicBool>,
    }

    #[async_trait]
    impl MessageHook<String> for SlowHook {
        async fn handle(&mut self, _message: Option<String>, cancel: &CancellationToken) -> bool {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(60)) => true,
                _ = cancel.cancelled() => {
                    self.canceled.store(true, Ordering::SeqCst);
                    true
                }
            }
        }

        fn on_handling_timeout(&mut self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn handling_timeout_cancels_the_hook() {
        let (mut tx, rx) = duplex(256);
        let canceled = Arc::new(AtomicBool::new(false));
        let pipe = StableReader::new();
        pipe.set_inner(Box::new(StreamSource::new(rx)), true);
        let reader = MessageReader::new(pipe, StringLineDecoder::strings("\n"));
        let pump = MessagePump::new(
            reader,
            Box::new(SlowHook {
                canceled: Arc::clone(&canceled),
            }),
        );
        pump.set_handling_timeout(Some(Duration::from_millis(50)));

        pump.start(None);
        tx.write_all(b"slow\n").await.unwrap();

        assert_eq!(pump.stopped().await, StopReason::ProcessMessage);
        assert!(canceled.load(Ordering::SeqCst));
    }
}
