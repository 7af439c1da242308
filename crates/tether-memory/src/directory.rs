//! Process-wide endpoint directory.
//!
//! Endpoints are named rendezvous points. Allocation publishes a name;
//! two transports that attach to the same name are paired into a full
//! duplex byte link. Deallocation unpublishes the name and severs every
//! live pair created under it, which is how tests and supervisors force
//! a disconnect.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tether_channel::Endpoints;

use crate::link::{MemorySink, MemorySource};

static DIRECTORY: OnceLock<Mutex<HashMap<String, Arc<Endpoint>>>> = OnceLock::new();

fn directory() -> &'static Mutex<HashMap<String, Arc<Endpoint>>> {
    DIRECTORY.get_or_init(|| Mutex::new(HashMap::new()))
}

struct Endpoint {
    /// Canceled on deallocation; severs every pair of this generation.
    sever: CancellationToken,
    waiting: Mutex<VecDeque<PendingPeer>>,
}

/// The prebuilt second half of a pair, parked until a peer attaches.
struct PendingPeer {
    endpoints: Endpoints,
    /// Closed when the first half was dropped; such entries are pruned
    /// rather than handed out.
    probe: mpsc::UnboundedSender<Bytes>,
}

/// Publish `name`. Returns `false` if it is already allocated.
pub fn allocate(name: &str) -> bool {
    let mut map = directory().lock().unwrap_or_else(|e| e.into_inner());
    if map.contains_key(name) {
        return false;
    }
    map.insert(
        name.to_string(),
        Arc::new(Endpoint {
            sever: CancellationToken::new(),
            waiting: Mutex::new(VecDeque::new()),
        }),
    );
    true
}

/// Unpublish `name` and sever all pairs created under it. Returns
/// `false` if the name was not allocated.
pub fn deallocate(name: &str) -> bool {
    let removed = directory()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(name);
    match removed {
        Some(endpoint) => {
            endpoint.sever.cancel();
            true
        }
        None => false,
    }
}

pub fn is_allocated(name: &str) -> bool {
    directory()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .contains_key(name)
}

/// Attach to `name`: take a parked peer half, or park the counterpart
/// and return the first half immediately.
pub(crate) fn attach(name: &str) -> io::Result<Endpoints> {
    let endpoint = directory()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(name)
        .cloned()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("memory endpoint {name:?} is not allocated"),
            )
        })?;

    let mut waiting = endpoint
        .waiting
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    while let Some(peer) = waiting.pop_front() {
        if peer.probe.is_closed() {
            // Its counterpart is gone; never pair against a corpse.
            continue;
        }
        return Ok(peer.endpoints);
    }

    let sever = endpoint.sever.clone();
    let (tx_ab, rx_ab) = mpsc::unbounded_channel();
    let (tx_ba, rx_ba) = mpsc::unbounded_channel();
    let first = Endpoints::new(
        Box::new(MemorySource::new(rx_ba, sever.clone())),
        Box::new(MemorySink::new(tx_ab, sever.clone())),
    );
    let second = Endpoints::new(
        Box::new(MemorySource::new(rx_ab, sever.clone())),
        Box::new(MemorySink::new(tx_ba.clone(), sever)),
    );
    waiting.push_back(PendingPeer {
        endpoints: second,
        probe: tx_ba,
    });
    Ok(first)
}
