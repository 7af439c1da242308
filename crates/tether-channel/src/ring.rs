//! Per-channel capture of recent log entries.
//!
//! While the channel is healthy, entries roll through a small ring. When
//! the connection is lost the ring's live contents become the prologue of
//! a capture buffer, and subsequent entries append to it until it fills.
//! Subscribers to status changes receive the capture as context: the last
//! few entries before the failure plus the follow-on noise.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::status::LogEntry;

/// Entries kept while the channel is connected.
const RUNNING_CAPACITY: usize = 5;
/// Entries kept after a disconnect (prologue included).
const CAPTURE_CAPACITY: usize = 20;

/// Fixed-size two-mode log buffer.
#[derive(Default)]
pub struct LogRing {
    inner: Mutex<RingState>,
}

#[derive(Default)]
struct RingState {
    running: VecDeque<LogEntry>,
    capture: Vec<LogEntry>,
    capturing: bool,
}

impl LogRing {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record one entry. In running mode the oldest entry is evicted once
    /// the ring is full; in capture mode entries beyond the capture
    /// capacity are dropped.
    pub fn push(&self, entry: LogEntry) {
        let mut st = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if st.capturing {
            if st.capture.len() < CAPTURE_CAPACITY {
                st.capture.push(entry);
            }
        } else {
            if st.running.len() == RUNNING_CAPACITY {
                st.running.pop_front();
            }
            st.running.push_back(entry);
        }
    }

    /// Switch to capture mode: the ring is drained, oldest first, into the
    /// capture buffer. No-op when already capturing.
    pub fn begin_capture(&self) {
        let mut st = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if st.capturing {
            return;
        }
        st.capturing = true;
        let prologue: Vec<LogEntry> = st.running.drain(..).collect();
        st.capture = prologue;
    }

    /// Return to running mode, clearing the capture buffer.
    pub fn end_capture(&self) {
        let mut st = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        st.capturing = false;
        st.capture.clear();
    }

    /// The capture contents, chronological. Empty in running mode.
    pub fn capture_snapshot(&self) -> Arc<[LogEntry]> {
        let st = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        st.capture.clone().into()
    }

    /// Context for a status-change payload: the capture when capturing,
    /// otherwise whatever the running ring currently holds.
    pub fn context_snapshot(&self) -> Arc<[LogEntry]> {
        let st = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if st.capturing {
            st.capture.clone().into()
        } else {
            st.running.iter().cloned().collect::<Vec<_>>().into()
        }
    }
}
