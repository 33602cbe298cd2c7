use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::{ServerConfig, ServerConnection, StreamOwned};
use tracing::{debug, info, warn};

use super::stream::WsStream;
use super::tcp::TcpTransport;
use super::timer::TimerQueue;
use super::{idle_wait, POLL_INTERVAL};
use crate::connection::SendOptions;
use crate::error::Result;
use crate::event::ServerEvent;
use crate::server::{PeerId, Server};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind_addr: IpAddr,
    /// Serve `wss://` when set.
    pub tls: Option<Arc<ServerConfig>>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tls: None,
        }
    }
}

impl ServerOptions {
    /// TLS options from a PEM certificate chain and private key.
    pub fn with_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        Ok(Self {
            tls: Some(super::tls::server_config_from_pem(cert_path, key_path)?),
            ..Self::default()
        })
    }
}

pub type ServerRegistry = Server<TcpTransport, TimerQueue>;

/// Listening socket plus the registry it feeds, driven on the calling thread.
#[derive(Debug)]
pub struct WebSocketServer {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    tls: Option<Arc<ServerConfig>>,
    server: ServerRegistry,
    timers: TimerQueue,
}

impl WebSocketServer {
    /// Bind `port` (0 picks a free one) and start accepting on `turn`.
    pub fn listen(port: u16, opts: &ServerOptions) -> Result<Self> {
        let listener = TcpListener::bind((opts.bind_addr, port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, secure = opts.tls.is_some(), "websocket server listening");

        let timers = TimerQueue::new();
        Ok(Self {
            listener: Some(listener),
            local_addr,
            tls: opts.tls.clone(),
            server: Server::new(timers.clone()),
            timers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn on(&mut self, listener: impl FnMut(&ServerEvent) + 'static) {
        self.server.on(listener);
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.server
    }

    pub fn registry_mut(&mut self) -> &mut ServerRegistry {
        &mut self.server
    }

    pub fn broadcast(&mut self, payload: &[u8], opts: SendOptions) -> Result<usize> {
        self.server.broadcast(payload, opts)
    }

    pub fn send_to(&mut self, peer: PeerId, payload: &[u8], opts: SendOptions) -> Result<()> {
        self.server.send_to(peer, payload, opts)
    }

    pub fn is_closed(&self) -> bool {
        self.listener.is_none()
    }

    /// One loop iteration: accept pending connections, poll every peer in
    /// accept order, fire due timers. Sleeps up to `timeout` when idle.
    pub fn turn(&mut self, timeout: Duration) -> usize {
        let mut handled = self.accept_pending();

        for id in self.server.peer_ids() {
            let events = match self.server.peer_mut(id) {
                Some(conn) => conn.transport_mut().poll(),
                None => continue,
            };
            handled += events.len();
            for event in events {
                self.server.handle_event(id, event);
            }
        }

        for id in self.timers.expired(Instant::now()) {
            if self.server.handle_timeout(id) {
                handled += 1;
            }
        }

        if handled == 0 {
            idle_wait(&self.timers, timeout);
        }
        handled
    }

    fn accept_pending(&mut self) -> usize {
        let Some(listener) = self.listener.as_ref() else {
            return 0;
        };
        let mut accepted = 0;
        loop {
            let (tcp, addr) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            };
            let stream = match &self.tls {
                Some(config) => match ServerConnection::new(config.clone()) {
                    Ok(conn) => WsStream::ServerTls(StreamOwned::new(conn, tcp)),
                    Err(e) => {
                        warn!(%addr, error = %e, "TLS session setup failed");
                        continue;
                    }
                },
                None => WsStream::Plain(tcp),
            };
            let transport = match TcpTransport::new(stream) {
                Ok(t) => t,
                Err(e) => {
                    warn!(%addr, error = %e, "socket setup failed");
                    continue;
                }
            };
            match self.server.accept(transport) {
                Ok(peer) => {
                    debug!(%addr, %peer, "accepted");
                    accepted += 1;
                }
                Err(e) => warn!(%addr, error = %e, "rejected connection"),
            }
        }
        accepted
    }

    /// Turn until `done` holds or `deadline` elapses; returns whether `done` held.
    pub fn run_until(
        &mut self,
        deadline: Duration,
        mut done: impl FnMut(&ServerRegistry) -> bool,
    ) -> bool {
        let until = Instant::now() + deadline;
        loop {
            if done(&self.server) {
                return true;
            }
            if Instant::now() >= until {
                return false;
            }
            self.turn(POLL_INTERVAL);
        }
    }

    /// Close every peer with 1001 and stop listening.
    pub fn close(&mut self) {
        self.server.close();
        if self.listener.take().is_some() {
            info!(local_addr = %self.local_addr, "websocket server closed");
        }
    }
}
