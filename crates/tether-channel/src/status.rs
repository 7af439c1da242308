//! Connection availability and the status-change event payload.

use std::sync::Arc;
use std::time::SystemTime;

/// How usable the channel currently is. Ordered: `Offline < DangerZone <
/// Low < Connected`.
///
/// Availability decays one step per failed reconnect attempt and jumps
/// straight back to `Connected` on a successful open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionStatus {
    /// No connection and repeated attempts have failed.
    Offline,
    /// Several consecutive attempts have failed.
    DangerZone,
    /// Recently lost the connection or still struggling to establish one.
    Low,
    /// The transport is open.
    Connected,
}

impl ConnectionStatus {
    /// One step down, clamped at [`ConnectionStatus::Offline`].
    pub fn degraded(self) -> Self {
        match self {
            ConnectionStatus::Connected => ConnectionStatus::Low,
            ConnectionStatus::Low => ConnectionStatus::DangerZone,
            ConnectionStatus::DangerZone | ConnectionStatus::Offline => ConnectionStatus::Offline,
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Offline => "offline",
            ConnectionStatus::DangerZone => "danger-zone",
            ConnectionStatus::Low => "low",
            ConnectionStatus::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Log severity carried by captured channel entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One captured log entry from a channel's recent history.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: Level,
    /// The channel the entry belongs to.
    pub target: Arc<str>,
    pub text: String,
    pub timestamp: SystemTime,
    /// Stringified error, when the entry records a failure.
    pub error: Option<String>,
}

impl LogEntry {
    pub fn new(level: Level, target: Arc<str>, text: impl Into<String>) -> Self {
        Self {
            level,
            target,
            text: text.into(),
            timestamp: SystemTime::now(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl std::fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Event delivered to channel subscribers on every availability change.
#[derive(Debug, Clone)]
pub struct StatusChanged {
    pub channel_id: u64,
    pub channel_name: Arc<str>,
    pub status: ConnectionStatus,
    /// Recent log entries surrounding the outage; empty when the new
    /// status is [`ConnectionStatus::Connected`].
    pub error_context: Arc<[LogEntry]>,
}
