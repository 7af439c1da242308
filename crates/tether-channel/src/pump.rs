//! Process-wide event pump.
//!
//! One queue, one consumer, for the whole process: status-change events
//! are raised to subscribers off the channel's locks, and log entries
//! produced inside behavior callbacks (which must not block or take the
//! channel lock) are appended to their ring here. The consumer runs on a
//! dedicated thread with its own small runtime, so it outlives any test
//! or caller runtime and dies only with the process.

use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;

use crate::ring::LogRing;
use crate::status::{LogEntry, StatusChanged};

pub(crate) enum PumpMsg {
    Status {
        subscribers: Vec<mpsc::UnboundedSender<StatusChanged>>,
        event: StatusChanged,
    },
    Log {
        ring: Arc<LogRing>,
        entry: LogEntry,
    },
}

static PUMP: OnceLock<mpsc::UnboundedSender<PumpMsg>> = OnceLock::new();

pub(crate) fn post(msg: PumpMsg) {
    let _ = sender().send(msg);
}

fn sender() -> &'static mpsc::UnboundedSender<PumpMsg> {
    PUMP.get_or_init(|| {
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("tether-events".into())
            .spawn(move || run(rx))
            .expect("spawn event pump thread");
        tx
    })
}

fn run(mut rx: mpsc::UnboundedReceiver<PumpMsg>) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("build event pump runtime");
    rt.block_on(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                PumpMsg::Status { subscribers, event } => {
                    for sub in subscribers {
                        // A subscriber that went away is dropped silently;
                        // delivery order per channel is the queue order.
                        let _ = sub.send(event.clone());
                    }
                }
                PumpMsg::Log { ring, entry } => ring.push(entry),
            }
        }
    });
}
