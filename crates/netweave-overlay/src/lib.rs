//! netweave-overlay — group membership and messaging over point-to-point channels.
//!
//! [`WebChannel`] runs the join/leave protocol, routes user and service
//! messages through the active [`topology`] and answers probes from other
//! peers. Transports plug in through [`transport::Connector`] and
//! [`transport::JoinDoor`]; [`memory`] provides an in-process one.

pub mod channel;
pub mod error;
pub mod joining;
pub mod memory;
pub mod service;
pub mod topology;
pub mod transport;

use std::sync::{Mutex, MutexGuard};

pub use channel::{ChannelEvent, EventStream, WebChannel, WebChannelBuilder};
pub use error::{OverlayError, ProtocolViolation, TimeoutKind};
pub use memory::MemoryNetwork;
pub use service::{ServiceHandler, ServiceRegistry};
pub use transport::{AccessData, CloseEvent, Connector, JoinDoor, RawChannel, TransportChannel, TransportError};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
