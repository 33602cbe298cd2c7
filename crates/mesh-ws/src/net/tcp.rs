//! Non-blocking socket transport.
//!
//! [`TcpTransport::poll`] does all the I/O for one loop turn and reports what
//! happened as [`TransportEvent`]s; [`Transport::write`] only queues bytes and
//! makes a best-effort attempt to flush them.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};

use tracing::{debug, trace, warn};

use super::stream::WsStream;
use crate::transport::{Transport, TransportEvent};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug)]
pub struct TcpTransport {
    /// `None` once destroyed or closed.
    stream: Option<WsStream>,
    peer_addr: Option<SocketAddr>,
    secure: bool,
    pending: Vec<u8>,
    connect_reported: bool,
    secure_reported: bool,
    ending: bool,
    write_shut: bool,
    read_eof: bool,
    close_reported: bool,
}

impl TcpTransport {
    /// Wrap an already connected stream and switch it to non-blocking mode.
    pub fn new(stream: WsStream) -> io::Result<Self> {
        stream.tcp().set_nonblocking(true)?;
        stream.tcp().set_nodelay(true)?;
        Ok(Self {
            peer_addr: stream.tcp().peer_addr().ok(),
            secure: stream.is_secure(),
            stream: Some(stream),
            pending: Vec::new(),
            connect_reported: false,
            secure_reported: false,
            ending: false,
            write_shut: false,
            read_eof: false,
            close_reported: false,
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// `true` once `Close` has been reported; nothing further will happen.
    pub fn is_finished(&self) -> bool {
        self.close_reported
    }

    /// Perform pending I/O and return what happened, in order.
    pub fn poll(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        if self.close_reported {
            return events;
        }
        let Some(stream) = self.stream.as_mut() else {
            self.close_reported = true;
            events.push(TransportEvent::Close);
            return events;
        };

        if !self.connect_reported {
            self.connect_reported = true;
            events.push(TransportEvent::Connect);
        }

        if self.secure && !self.secure_reported {
            match stream.drive_tls() {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!(peer = ?self.peer_addr, error = %e, "TLS handshake failed");
                    self.fail(&mut events, e);
                    return events;
                }
            }
            match self.stream.as_ref() {
                Some(s) if !s.is_handshaking() => {
                    self.secure_reported = true;
                    events.push(TransportEvent::SecureConnect);
                }
                _ => return events,
            }
        }

        if let Err(e) = self.flush_pending() {
            self.fail(&mut events, e);
            return events;
        }

        if !self.read_eof {
            self.read_available(&mut events);
        }

        // Both directions finished: the transport is done.
        if self.read_eof && self.write_shut && !self.close_reported {
            self.stream = None;
            self.close_reported = true;
            events.push(TransportEvent::Close);
        }
        events
    }

    fn read_available(&mut self, events: &mut Vec<TransportEvent>) {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            match stream.read(&mut buf) {
                Ok(0) => {
                    trace!(peer = ?self.peer_addr, "read EOF");
                    self.read_eof = true;
                    events.push(TransportEvent::End);
                    return;
                }
                Ok(n) => events.push(TransportEvent::Data(buf[..n].to_vec())),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                // TLS peer went away without close_notify
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    self.read_eof = true;
                    events.push(TransportEvent::End);
                    return;
                }
                Err(e) => {
                    self.fail(events, e);
                    return;
                }
            }
        }
    }

    fn fail(&mut self, events: &mut Vec<TransportEvent>, err: io::Error) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.pending.clear();
        events.push(TransportEvent::Error(err));
        self.close_reported = true;
        events.push(TransportEvent::Close);
    }

    /// Write as much of the queue as the socket takes; shut down the write
    /// side once the queue drains after `end()`.
    fn flush_pending(&mut self) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        while !self.pending.is_empty() {
            match stream.write(&self.pending) {
                Ok(0) => {
                    return Err(io::Error::new(ErrorKind::WriteZero, "socket accepted no bytes"));
                }
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        match stream.flush() {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        }

        if self.ending && self.pending.is_empty() && !self.write_shut {
            stream.send_close_notify();
            let _ = stream.flush();
            match stream.shutdown(Shutdown::Write) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotConnected => {}
                Err(e) => return Err(e),
            }
            self.write_shut = true;
            debug!(peer = ?self.peer_addr, "write side shut down");
        }
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.stream.is_none() || self.ending {
            return Err(io::Error::new(ErrorKind::NotConnected, "transport is not writable"));
        }
        self.pending.extend_from_slice(bytes);
        self.flush_pending()
    }

    fn end(&mut self) {
        if self.ending {
            return;
        }
        self.ending = true;
        if let Err(e) = self.flush_pending() {
            debug!(peer = ?self.peer_addr, error = %e, "flush on end failed");
        }
    }

    fn destroy(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!(peer = ?self.peer_addr, "transport destroyed");
        }
        self.pending.clear();
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some() && !self.ending
    }

    fn is_secure(&self) -> bool {
        self.secure
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        // Best effort: a peer removed right after its close echo still gets it.
        if !self.pending.is_empty() {
            let _ = self.flush_pending();
        }
    }
}
