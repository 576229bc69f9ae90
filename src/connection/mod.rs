//! Connection Manager: one logical connection per role, surviving many
//! underlying transports.

pub mod backoff;
pub mod manager;
pub mod transport;

pub use backoff::Backoff;
pub use manager::{ConnectionHandle, ConnectionSettings};
pub use transport::{Connector, Link, WsConnector};

use crate::protocol::OutboundFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the manager reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A raw inbound text frame, in transport order.
    Frame(String),
    State(ConnectionState),
    /// Authentication was sent and the subscription set replayed.
    Ready,
}

/// Best-effort outbound channel for ephemeral signals.
///
/// Returns `false` when the frame was dropped because no transport is open.
pub trait FrameSink: Send + Sync + 'static {
    fn send_frame(&self, frame: OutboundFrame) -> bool;
}
