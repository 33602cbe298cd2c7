//! Collaborator seams: the byte-stream transport and the timer.
//!
//! The protocol core never performs I/O or reads the clock itself. A driver
//! (see [`crate::net`]) owns the event loop, feeds [`TransportEvent`]s into
//! connections in arrival order, and reports expired [`TimerId`]s back.

use std::io;
use std::time::Duration;

/// Events a transport reports to the connection that owns it.
#[derive(Debug)]
pub enum TransportEvent {
    /// TCP connection established.
    Connect,
    /// TLS negotiation finished; only reported by secure transports.
    SecureConnect,
    /// Bytes received, in arrival order, at arbitrary chunk boundaries.
    Data(Vec<u8>),
    /// The remote end finished sending.
    End,
    /// The transport reported an error. A `Close` usually follows.
    Error(io::Error),
    /// The transport is gone.
    Close,
}

/// A TCP or TLS byte stream.
pub trait Transport {
    /// Queue `bytes` for writing. Returns once the transport has accepted the
    /// bytes; the actual write may complete later.
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Half-close: flush pending writes, then stop sending.
    fn end(&mut self);

    /// Tear the transport down immediately.
    fn destroy(&mut self);

    /// Whether the transport can currently accept writes.
    fn is_connected(&self) -> bool;

    /// Whether the transport is TLS-wrapped.
    fn is_secure(&self) -> bool {
        false
    }
}

/// Handle for a scheduled timer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Schedules one-shot timers. Expiry is reported by the driver, which calls
/// the owning connection's `handle_timeout` with the id returned here.
pub trait Timer {
    fn schedule(&mut self, delay: Duration) -> TimerId;

    /// Cancelling an unknown or already-fired timer is a no-op.
    fn cancel(&mut self, id: TimerId);
}
