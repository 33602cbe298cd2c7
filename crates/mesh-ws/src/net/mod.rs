//! Socket-backed collaborators and single-threaded drivers.
//!
//! ## Architecture
//!
//! ```text
//! WebSocketServer::turn / WebSocketClient::turn
//!     |
//!     +-- TcpListener::accept (non-blocking)  -> Server::accept
//!     +-- TcpTransport::poll per connection   -> Connection::handle_event
//!     +-- TimerQueue::expired                 -> Connection::handle_timeout
//!     +-- idle: sleep until the next deadline or the turn timeout
//! ```
//!
//! Everything runs on the calling thread; handlers run to completion before
//! the next event is processed.

use std::time::{Duration, Instant};

mod client;
mod server;
mod stream;
mod tcp;
mod timer;
mod tls;

pub use client::{ClientConnectionHandle, ClientOptions, WebSocketClient};
pub use server::{ServerOptions, ServerRegistry, WebSocketServer};
pub use stream::WsStream;
pub use tcp::TcpTransport;
pub use timer::TimerQueue;
pub use tls::{client_config_with_webpki_roots, server_config_from_pem};

/// Default turn timeout for the `run_*` helpers.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn idle_wait(timers: &TimerQueue, timeout: Duration) {
    let wait = timers
        .next_delay(Instant::now())
        .map_or(timeout, |delay| delay.min(timeout));
    if !wait.is_zero() {
        std::thread::sleep(wait);
    }
}
