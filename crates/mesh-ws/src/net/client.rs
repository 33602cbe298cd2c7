use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use tracing::{debug, info};

use super::stream::WsStream;
use super::tcp::TcpTransport;
use super::timer::TimerQueue;
use super::{idle_wait, POLL_INTERVAL};
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::{Result, WsError};
use crate::event::Event;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Required for `wss://` hosts.
    pub tls: Option<Arc<ClientConfig>>,
    pub connect_timeout: Duration,
    /// Added to the upgrade request (e.g. `Origin`).
    pub extra_headers: Vec<(String, String)>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            tls: None,
            connect_timeout: Duration::from_secs(10),
            extra_headers: Vec::new(),
        }
    }
}

impl ClientOptions {
    /// Options with TLS enabled against the bundled web PKI roots.
    pub fn with_webpki_roots() -> Self {
        Self {
            tls: Some(super::tls::client_config_with_webpki_roots()),
            ..Self::default()
        }
    }
}

pub type ClientConnectionHandle = Connection<TcpTransport, TimerQueue>;

/// Client connection plus the loop that drives it on the calling thread.
#[derive(Debug)]
pub struct WebSocketClient {
    conn: ClientConnectionHandle,
    timers: TimerQueue,
}

impl WebSocketClient {
    /// Open a TCP (or TLS) connection to `host` and prepare the handshake.
    ///
    /// Returns once the socket is connected; the upgrade request goes out on
    /// the first [`WebSocketClient::turn`], so listeners registered before
    /// that see the `Open` event.
    pub fn connect(
        host: &str,
        port: Option<u16>,
        path: &str,
        opts: &ClientOptions,
    ) -> Result<Self> {
        let endpoint = Endpoint::resolve(host, port, path)?;
        let tls = match (endpoint.secure, &opts.tls) {
            (true, None) => {
                return Err(WsError::Configuration(format!(
                    "wss://{} requires a TLS client configuration",
                    endpoint.host
                )))
            }
            (true, Some(config)) => Some(config.clone()),
            (false, _) => None,
        };

        let addr = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| WsError::Configuration(format!("{} did not resolve", endpoint.host)))?;
        debug!(%addr, secure = endpoint.secure, "connecting");
        let tcp = TcpStream::connect_timeout(&addr, opts.connect_timeout)?;

        let stream = match tls {
            Some(config) => {
                let server_name = ServerName::try_from(endpoint.host.clone()).map_err(|_| {
                    WsError::Configuration(format!("invalid hostname for TLS: {}", endpoint.host))
                })?;
                let conn = ClientConnection::new(config, server_name)?;
                WsStream::ClientTls(StreamOwned::new(conn, tcp))
            }
            None => WsStream::Plain(tcp),
        };

        let timers = TimerQueue::new();
        let transport = TcpTransport::new(stream)?;
        let conn = Connection::client(transport, timers.clone(), &endpoint)?
            .with_extra_headers(opts.extra_headers.clone());
        info!(host = %endpoint.host, port = endpoint.port, path = %endpoint.path, "connected");
        Ok(Self { conn, timers })
    }

    pub fn on(&mut self, listener: impl FnMut(&Event) + 'static) {
        self.conn.on(listener);
    }

    pub fn connection(&self) -> &ClientConnectionHandle {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut ClientConnectionHandle {
        &mut self.conn
    }

    pub fn is_closed(&self) -> bool {
        self.conn.ready_state().is_closed()
    }

    /// One loop iteration: poll the socket, dispatch its events, fire due
    /// timers. Sleeps up to `timeout` when nothing happened. Returns the
    /// number of events and timers processed.
    pub fn turn(&mut self, timeout: Duration) -> usize {
        let events = self.conn.transport_mut().poll();
        let mut handled = events.len();
        for event in events {
            self.conn.handle_event(event);
        }
        for id in self.timers.expired(Instant::now()) {
            if self.conn.handle_timeout(id) {
                handled += 1;
            }
        }
        if handled == 0 {
            idle_wait(&self.timers, timeout);
        }
        handled
    }

    /// Turn until `done` holds or `deadline` elapses; returns whether `done` held.
    pub fn run_until(
        &mut self,
        deadline: Duration,
        mut done: impl FnMut(&ClientConnectionHandle) -> bool,
    ) -> bool {
        let until = Instant::now() + deadline;
        loop {
            if done(&self.conn) {
                return true;
            }
            if Instant::now() >= until {
                return false;
            }
            self.turn(POLL_INTERVAL);
        }
    }

    /// Turn until the connection reaches CLOSED.
    pub fn run_until_closed(&mut self) {
        while !self.is_closed() {
            self.turn(POLL_INTERVAL);
        }
    }
}
