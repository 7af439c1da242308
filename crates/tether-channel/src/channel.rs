//! The communication channel supervisor.
//!
//! A [`Channel`] owns one transport at a time plus the stable pipes its
//! users read and write through. Every state transition (open, close,
//! reconfigure, pipe error, reconnect tick, dispose) serializes through
//! a single async lock. Fire-and-forget entry points never propagate
//! errors; anything unexpected is logged for investigation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use tether_pipe::{PipeError, StableReader, StableWriter};

use crate::behavior::{ChannelBehavior, Direction};
use crate::config::{ChannelConfig, Reconfigure};
use crate::error::ChannelError;
use crate::pump::{self, PumpMsg};
use crate::reconnect::{Reconnector, INITIAL_DELAY};
use crate::ring::LogRing;
use crate::status::{ConnectionStatus, Level, LogEntry, StatusChanged};
use crate::transport::ChannelTransport;

/// Deadline for one transport open attempt.
const OPEN_DEADLINE: Duration = Duration::from_secs(5);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// A durable byte channel over a replaceable transport.
///
/// Construction requires a running tokio runtime: the supervisor spawns
/// its first open and all reconnect timers onto it. Call
/// [`dispose`](Channel::dispose) to release the transport; dropping the
/// handle alone leaves background tasks to wind down on their own.
pub struct Channel {
    shared: Arc<ChannelShared>,
}

pub(crate) struct ChannelShared {
    id: u64,
    name: Arc<str>,
    reader: StableReader,
    writer: StableWriter,
    pub(crate) lock: tokio::sync::Mutex<Supervised>,
    status: Mutex<ConnectionStatus>,
    auto_reconnect: AtomicBool,
    disposed: AtomicBool,
    /// Collapses bursts of pipe errors into one queued reopen.
    pipe_error_pending: AtomicBool,
    ring: Arc<LogRing>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StatusChanged>>>,
    reader_behavior: Arc<ChannelBehavior>,
    writer_behavior: Arc<ChannelBehavior>,
}

pub(crate) struct Supervised {
    config: Arc<dyn ChannelConfig>,
    transport: Option<Box<dyn ChannelTransport>>,
    reconnector: Option<Arc<Reconnector>>,
}

impl Channel {
    /// Validate the configuration and bring the channel up.
    ///
    /// If the transport comes back from the factory already opened, the
    /// pipes attach synchronously and the channel starts `Connected`;
    /// otherwise the first open runs in the background.
    pub fn new(config: Arc<dyn ChannelConfig>) -> Result<Channel, ChannelError> {
        config.validate()?;

        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let name: Arc<str> = format!("{}-{}", config.scheme(), id).into();
        let options = config.options().clone();

        let reader = StableReader::new();
        let writer = StableWriter::new();
        reader.set_default_timeout(options.read_timeout);
        writer.set_default_timeout(options.write_timeout);
        writer.set_retry_write_count(options.retry_write_count);

        let shared = Arc::new_cyclic(|weak: &std::sync::Weak<ChannelShared>| ChannelShared {
            id,
            name: Arc::clone(&name),
            reader: reader.clone(),
            writer: writer.clone(),
            lock: tokio::sync::Mutex::new(Supervised {
                config: Arc::clone(&config),
                transport: None,
                reconnector: None,
            }),
            status: Mutex::new(ConnectionStatus::Low),
            auto_reconnect: AtomicBool::new(options.auto_reconnect),
            disposed: AtomicBool::new(false),
            pipe_error_pending: AtomicBool::new(false),
            ring: LogRing::new(),
            subscribers: Mutex::new(Vec::new()),
            reader_behavior: Arc::new(ChannelBehavior::new(weak.clone(), Direction::Read)),
            writer_behavior: Arc::new(ChannelBehavior::new(weak.clone(), Direction::Write)),
        });
        reader.set_behavior(shared.reader_behavior.clone());
        writer.set_behavior(shared.writer_behavior.clone());

        let mut transport = config.create_transport(true);
        let preopened = transport.preopened();
        {
            let mut supervised = shared
                .lock
                .try_lock()
                .expect("fresh channel lock is uncontended");
            supervised.transport = Some(transport);
        }

        match preopened {
            Some(endpoints) => {
                shared.attach(endpoints);
                shared.set_status(ConnectionStatus::Connected);
                shared.log(Level::Info, "connected via preopened transport", None);
            }
            None => {
                let ch = Arc::clone(&shared);
                tokio::spawn(async move {
                    let mut supervised = ch.lock.lock().await;
                    if !ch.is_disposed() {
                        ch.reopen(&mut supervised, None).await;
                    }
                });
            }
        }

        Ok(Channel { shared })
    }

    /// Unique numeric id of this channel within the process.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// `"<scheme>-<id>"`.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The stable read side. Clones share state with the channel.
    pub fn reader(&self) -> StableReader {
        self.shared.reader.clone()
    }

    /// The stable write side.
    pub fn writer(&self) -> StableWriter {
        self.shared.writer.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self
            .shared
            .status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn auto_reconnect(&self) -> bool {
        self.shared.auto_reconnect()
    }

    /// Toggle automatic reconnection. Switching it off lets the current
    /// reconnect cycle finish and then stops scheduling new attempts.
    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.shared
            .auto_reconnect
            .store(enabled, Ordering::Release);
    }

    /// Subscribe to availability changes. Events arrive in the order the
    /// channel observed its transitions.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StatusChanged> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self
            .shared
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subs.retain(|s| !s.is_closed());
        subs.push(tx);
        rx
    }

    /// Apply a new configuration.
    ///
    /// Generic knobs always apply in place. Transport-level differences
    /// either reconfigure the live transport dynamically or force a full
    /// restart, per [`ChannelConfig::compare`]; a restart challenges the
    /// new configuration with one open attempt even when auto-reconnect
    /// is off.
    pub async fn reconfigure(&self, config: Arc<dyn ChannelConfig>) -> Result<(), ChannelError> {
        config.validate()?;
        if self.shared.is_disposed() {
            return Err(ChannelError::Disposed);
        }
        let mut supervised = self.shared.lock.lock().await;
        if self.shared.is_disposed() {
            return Err(ChannelError::Disposed);
        }

        let options = config.options().clone();
        self.shared.reader.set_default_timeout(options.read_timeout);
        self.shared.writer.set_default_timeout(options.write_timeout);
        self.shared
            .writer
            .set_retry_write_count(options.retry_write_count);
        self.shared
            .auto_reconnect
            .store(options.auto_reconnect, Ordering::Release);

        let mut verdict = supervised.config.compare(&*config);
        if verdict == Reconfigure::Identical && *supervised.config.options() != options {
            verdict = Reconfigure::Dynamic;
        }
        match verdict {
            Reconfigure::Identical => {}
            Reconfigure::Dynamic => {
                supervised.config = Arc::clone(&config);
                if let Some(transport) = supervised.transport.as_mut() {
                    transport.reconfigure(&*config).await?;
                }
                self.shared
                    .log(Level::Info, "configuration applied dynamically", None);
            }
            Reconfigure::Restart => {
                supervised.config = Arc::clone(&config);
                self.shared
                    .log(Level::Info, "configuration requires restart", None);
                self.shared.close_transport(&mut supervised, false).await;
                self.shared.reopen(&mut supervised, None).await;
            }
        }
        Ok(())
    }

    /// Tear the channel down: pipes complete, the transport is disposed,
    /// the reconnector stops. Idempotent.
    pub async fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut supervised = self.shared.lock.lock().await;
        if let Some(reconnector) = supervised.reconnector.take() {
            reconnector.dispose();
        }
        self.shared.reader.close(true);
        self.shared.writer.close(true);
        if let Some(mut transport) = supervised.transport.take() {
            transport.close().await;
        }
        self.shared.log(Level::Info, "disposed", None);
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }
}

impl ChannelShared {
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn auto_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::Acquire)
    }

    /// Detach both pipes without completing them, so their users keep
    /// waiting for the replacement.
    pub(crate) fn detach_pipes(&self) {
        self.reader.close(false);
        self.writer.close(false);
    }

    fn attach(&self, endpoints: crate::transport::Endpoints) {
        self.reader_behavior.set_inner(endpoints.reader_behavior);
        self.writer_behavior.set_inner(endpoints.writer_behavior);
        self.reader.set_inner(endpoints.source, true);
        self.writer.set_inner(endpoints.sink, true);
    }

    /// One open attempt, bounded by [`OPEN_DEADLINE`]. On success the
    /// pipes re-attach and availability jumps to `Connected`; on failure
    /// availability decays one step and the next attempt is planned.
    pub(crate) async fn reopen(
        self: &Arc<Self>,
        supervised: &mut Supervised,
        via: Option<&Arc<Reconnector>>,
    ) {
        self.detach_pipes();
        if supervised.transport.is_none() {
            supervised.transport = Some(supervised.config.create_transport(false));
        }
        let transport = supervised.transport.as_mut().expect("transport present");

        let opened = tokio::time::timeout(OPEN_DEADLINE, transport.open()).await;
        let failure = match opened {
            Ok(Ok(endpoints)) => {
                self.attach(endpoints);
                if let Some(reconnector) = supervised.reconnector.take() {
                    reconnector.dispose();
                }
                self.set_status(ConnectionStatus::Connected);
                self.log(Level::Info, "connection established", None);
                return;
            }
            Ok(Err(e)) => PipeError::Transport(e),
            Err(_) => PipeError::Timeout {
                elapsed: OPEN_DEADLINE,
            },
        };

        self.log(Level::Warn, "open attempt failed", Some(&failure));
        self.close_transport(supervised, false).await;
        self.degrade_status();

        if !self.auto_reconnect() {
            if let Some(reconnector) = supervised.reconnector.take() {
                reconnector.dispose();
            }
            return;
        }
        match via {
            Some(reconnector) => reconnector.plan_next(),
            None => {
                if let Some(old) = supervised.reconnector.take() {
                    old.dispose();
                }
                supervised.reconnector = Some(Reconnector::spawn(
                    Arc::downgrade(self),
                    INITIAL_DELAY,
                ));
            }
        }
    }

    /// Dispose the current transport and stage a clean, unopened
    /// replacement (unless the channel is completing).
    async fn close_transport(&self, supervised: &mut Supervised, completing: bool) {
        self.detach_pipes();
        {
            let status = *self.status.lock().unwrap_or_else(|e| e.into_inner());
            if status == ConnectionStatus::Connected {
                self.set_status(ConnectionStatus::Low);
            }
        }
        if let Some(mut transport) = supervised.transport.take() {
            transport.close().await;
        }
        if !completing {
            supervised.transport = Some(supervised.config.create_transport(false));
        }
    }

    /// Fire-and-forget escalation from a pipe error. Bursts collapse into
    /// a single queued reopen; nothing propagates out of the spawned task.
    pub(crate) fn notify_pipe_error(this: &Arc<Self>) {
        if this.pipe_error_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let channel = Arc::clone(this);
        tokio::spawn(async move {
            let mut supervised = channel.lock.lock().await;
            channel.pipe_error_pending.store(false, Ordering::Release);
            if channel.is_disposed() {
                return;
            }
            if channel.auto_reconnect() {
                channel.reopen(&mut supervised, None).await;
            } else {
                channel.close_transport(&mut supervised, false).await;
            }
        });
    }

    /// Fire-and-forget escalation from an inner-pipe completion.
    pub(crate) fn notify_inner_completed(this: &Arc<Self>) {
        Self::notify_pipe_error(this);
    }

    fn set_status(&self, next: ConnectionStatus) {
        {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if *status == next {
                return;
            }
            let was = *status;
            *status = next;
            if next == ConnectionStatus::Connected {
                self.ring.end_capture();
            } else if was == ConnectionStatus::Connected {
                self.ring.begin_capture();
            }
        }
        let error_context = if next == ConnectionStatus::Connected {
            Arc::from(Vec::new())
        } else {
            self.ring.context_snapshot()
        };
        let event = StatusChanged {
            channel_id: self.id,
            channel_name: Arc::clone(&self.name),
            status: next,
            error_context,
        };
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        pump::post(PumpMsg::Status { subscribers, event });
    }

    fn degrade_status(&self) {
        let next = {
            let status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            status.degraded()
        };
        self.set_status(next);
    }

    /// Log through tracing and the capture ring.
    pub(crate) fn log(&self, level: Level, text: &str, error: Option<&PipeError>) {
        self.emit_tracing(level, text, error);
        let mut entry = LogEntry::new(level, Arc::clone(&self.name), text);
        if let Some(e) = error {
            entry = entry.with_error(e);
        }
        self.ring.push(entry);
    }

    /// Logging variant for behavior callbacks, which must not touch the
    /// ring inline; the entry rides the process-wide pump instead.
    pub(crate) fn log_deferred(&self, level: Level, text: String, error: Option<&PipeError>) {
        self.emit_tracing(level, &text, error);
        let mut entry = LogEntry::new(level, Arc::clone(&self.name), text);
        if let Some(e) = error {
            entry = entry.with_error(e);
        }
        pump::post(PumpMsg::Log {
            ring: Arc::clone(&self.ring),
            entry,
        });
    }

    fn emit_tracing(&self, level: Level, text: &str, error: Option<&PipeError>) {
        let error = error.map(|e| e.to_string());
        let error = error.as_deref().unwrap_or("");
        match level {
            Level::Trace => tracing::trace!(channel = %self.name, error, "{text}"),
            Level::Debug => tracing::debug!(channel = %self.name, error, "{text}"),
            Level::Info => tracing::info!(channel = %self.name, error, "{text}"),
            Level::Warn => tracing::warn!(channel = %self.name, error, "{text}"),
            Level::Error => tracing::error!(channel = %self.name, error, "{text}"),
        }
    }
}
