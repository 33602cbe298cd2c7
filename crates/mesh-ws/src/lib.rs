//! WebSocket (RFC 6455) client and server.
//!
//! The protocol core is sans-io: [`Connection`] and [`Server`] are state
//! machines fed with [`TransportEvent`]s and expired [`TimerId`]s, writing
//! through the [`Transport`] trait. [`net`] supplies the socket-backed
//! collaborators and single-threaded drivers.
//!
//! ## Modules
//!
//! - [`handshake`] -- HTTP/1.1 upgrade request/response codec
//! - [`frame`] -- frame encoder and incremental decoder
//! - [`close`] -- close codes and close payloads
//! - [`message`] -- fragment reassembly into text/binary messages
//! - [`connection`] -- per-connection state machine, keepalive, close handshake
//! - [`server`] -- peer registry and broadcast
//! - [`net`] -- TCP/TLS transport, timer queue, client and server drivers

pub mod close;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod net;
pub mod ping;
pub mod server;
pub mod state;
pub mod transport;

#[cfg(test)]
mod testing;

pub use close::{CloseInfo, WsCloseCode};
pub use connection::{Connection, Role, SendOptions};
pub use endpoint::Endpoint;
pub use error::{Result, WsError};
pub use event::{Emitter, Event, ServerEvent};
pub use message::Message;
pub use net::{ClientOptions, ServerOptions, WebSocketClient, WebSocketServer};
pub use server::{PeerId, Server};
pub use state::ReadyState;
pub use transport::{TimerId, Timer, Transport, TransportEvent};
