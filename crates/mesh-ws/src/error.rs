//! Error taxonomy for the WebSocket client and server.
//!
//! Every failure the protocol layer can report is a [`WsError`]. The variants
//! follow the failure classes the connection state machine distinguishes:
//!
//! - **Protocol**: malformed handshake, bad status code, accept-key mismatch,
//!   invalid frames. The affected connection never reaches (or leaves) OPEN.
//! - **UnsupportedFeature**: an option this implementation does not provide
//!   (compression). The operation is aborted, the connection stays usable.
//! - **TransportUnavailable**: a write attempted while the transport is not
//!   connected.
//! - **Configuration**: a secure scheme requested without TLS support, or
//!   unusable TLS material.

use std::sync::Arc;

use crate::server::PeerId;
use crate::state::ReadyState;

/// Errors produced by the WebSocket layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WsError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    #[error("transport is not connected")]
    TransportUnavailable,

    #[error("connection is not open (state {0:?})")]
    NotOpen(ReadyState),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid ready state transition {from:?} -> {to:?}")]
    InvalidTransition { from: ReadyState, to: ReadyState },

    #[error("peer {0} is already registered")]
    DuplicatePeer(PeerId),

    #[error("no peer {0} in the registry")]
    UnknownPeer(PeerId),

    #[error("server is closed")]
    ServerClosed,
}

impl WsError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        WsError::Protocol(msg.into())
    }

    /// Returns `true` for handshake and framing violations.
    pub fn is_protocol(&self) -> bool {
        matches!(self, WsError::Protocol(_))
    }
}

impl From<std::io::Error> for WsError {
    fn from(err: std::io::Error) -> Self {
        WsError::Io(Arc::new(err))
    }
}

impl From<rustls::Error> for WsError {
    fn from(err: rustls::Error) -> Self {
        WsError::Tls(err.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, WsError>;
