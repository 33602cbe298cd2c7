use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

use rustls::{ClientConnection, ServerConnection, StreamOwned};

/// Plain TCP or TLS byte stream. All variants implement Read + Write.
pub enum WsStream {
    Plain(TcpStream),
    ClientTls(StreamOwned<ClientConnection, TcpStream>),
    ServerTls(StreamOwned<ServerConnection, TcpStream>),
}

impl WsStream {
    pub fn tcp(&self) -> &TcpStream {
        match self {
            WsStream::Plain(s) => s,
            WsStream::ClientTls(s) => s.get_ref(),
            WsStream::ServerTls(s) => s.get_ref(),
        }
    }

    pub fn is_secure(&self) -> bool {
        !matches!(self, WsStream::Plain(_))
    }

    /// `true` while a TLS handshake is still in progress.
    pub fn is_handshaking(&self) -> bool {
        match self {
            WsStream::Plain(_) => false,
            WsStream::ClientTls(s) => s.conn.is_handshaking(),
            WsStream::ServerTls(s) => s.conn.is_handshaking(),
        }
    }

    /// Move TLS records in both directions. On a non-blocking socket this
    /// returns `WouldBlock` when no progress is possible yet.
    pub fn drive_tls(&mut self) -> io::Result<()> {
        match self {
            WsStream::Plain(_) => Ok(()),
            WsStream::ClientTls(s) => s.conn.complete_io(&mut s.sock).map(|_| ()),
            WsStream::ServerTls(s) => s.conn.complete_io(&mut s.sock).map(|_| ()),
        }
    }

    /// Queue a TLS close_notify ahead of a write shutdown.
    pub fn send_close_notify(&mut self) {
        match self {
            WsStream::Plain(_) => {}
            WsStream::ClientTls(s) => s.conn.send_close_notify(),
            WsStream::ServerTls(s) => s.conn.send_close_notify(),
        }
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.tcp().shutdown(how)
    }
}

impl Read for WsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            WsStream::Plain(s) => s.read(buf),
            WsStream::ClientTls(s) => s.read(buf),
            WsStream::ServerTls(s) => s.read(buf),
        }
    }
}

impl Write for WsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            WsStream::Plain(s) => s.write(buf),
            WsStream::ClientTls(s) => s.write(buf),
            WsStream::ServerTls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            WsStream::Plain(s) => s.flush(),
            WsStream::ClientTls(s) => s.flush(),
            WsStream::ServerTls(s) => s.flush(),
        }
    }
}

impl std::fmt::Debug for WsStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            WsStream::Plain(_) => "plain",
            WsStream::ClientTls(_) => "client-tls",
            WsStream::ServerTls(_) => "server-tls",
        };
        f.debug_struct("WsStream")
            .field("kind", &kind)
            .field("peer", &self.tcp().peer_addr().ok())
            .finish()
    }
}
