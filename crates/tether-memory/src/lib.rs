#![deny(unsafe_code)]

//! In-process loopback transport.
//!
//! A process-wide directory maps endpoint names to rendezvous points.
//! Two channels configured with the same name pair up into a full-duplex
//! byte link with no serialization and no I/O, suited to tests and to
//! wiring components of one process together through the same channel
//! machinery used over real transports.
//!
//! [`deallocate`] severs every live pair under a name, which is the
//! loopback's way of producing a disconnect: paired channels observe
//! their pipes completing and go through their normal reconnect cycle.

mod config;
mod directory;
mod link;

pub use config::{MemoryConfig, MemoryTransport};
pub use directory::{allocate, deallocate, is_allocated};
pub use link::{MemorySink, MemorySource};
