//! A single WebSocket connection: the client side of `connect`, or a peer
//! accepted by a [`crate::server::Server`].
//!
//! The connection is a state machine driven from outside. The driver feeds
//! transport events with [`Connection::handle_event`] and expired timers with
//! [`Connection::handle_timeout`]; the connection writes through its
//! [`Transport`] and publishes [`Event`]s to its listeners.
//!
//! ## Inbound path
//!
//! ```text
//! Data while CONNECTING -> handshake buffer -> parse request/response
//!     |                                          |
//!     |                       success: OPEN, publish Open, write 101 (server)
//!     |                       leftover bytes -> frame decoder
//!     v
//! Data while OPEN/CLOSING -> FrameDecoder -> ping/pong/close handling
//!                                         -> MessageAssembler -> publish Message
//! ```
//!
//! Nothing is dispatched after a close frame has been received. A peer that
//! never finishes the closing handshake is dropped after [`CLOSE_TIMEOUT`].

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::close::{build_close_payload, validate_close_payload, CloseInfo, WsCloseCode};
use crate::endpoint::Endpoint;
use crate::error::{Result, WsError};
use crate::event::{Emitter, Event};
use crate::frame::{
    encode_frame, random_mask_key, FrameDecoder, MaskPolicy, WsFrame, WsOpcode, MAX_CONTROL_PAYLOAD,
};
use crate::handshake::{build_bad_request, build_response, parse_request, ClientHandshake, Headers};
use crate::message::MessageAssembler;
use crate::ping::{PingCallback, PingTracker, PING_TIMEOUT, PING_TIMEOUT_REASON};
use crate::state::ReadyState;
use crate::transport::{TimerId, Timer, Transport, TransportEvent};

/// How long the closing handshake may take before the transport is torn down.
pub const CLOSE_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Which end of the connection this is. Decides masking in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Client-originated frames are masked; server-originated frames are not.
    pub fn masks_outbound(self) -> bool {
        self == Role::Client
    }

    fn inbound_policy(self) -> MaskPolicy {
        match self {
            Role::Client => MaskPolicy::Forbidden,
            Role::Server => MaskPolicy::Required,
        }
    }
}

/// Options for [`Connection::send`] and [`crate::server::Server::broadcast`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Explicit masking request. `None` uses the role's rule; an explicit
    /// value must agree with it.
    pub mask: Option<bool>,
    /// Send a binary frame instead of a text frame.
    pub binary: bool,
    /// Per-message compression. Not supported; requesting it fails.
    pub compress: bool,
}

impl SendOptions {
    pub fn text() -> Self {
        Self::default()
    }

    pub fn binary() -> Self {
        Self {
            binary: true,
            ..Self::default()
        }
    }

    /// Fails with `UnsupportedFeature` before anything is encoded.
    pub(crate) fn check(&self, role: Role) -> Result<WsOpcode> {
        if self.compress {
            return Err(WsError::UnsupportedFeature("message compression"));
        }
        if let Some(mask) = self.mask {
            assert_eq!(
                mask,
                role.masks_outbound(),
                "{:?} frames must {}be masked",
                role,
                if role.masks_outbound() { "" } else { "not " }
            );
        }
        Ok(if self.binary { WsOpcode::Binary } else { WsOpcode::Text })
    }
}

/// Handshake still outstanding.
enum PendingHandshake {
    Client {
        handshake: ClientHandshake,
        host: String,
        path: String,
        extra_headers: Vec<(String, String)>,
        request_sent: bool,
    },
    Server,
}

pub struct Connection<T, Tm> {
    role: Role,
    transport: T,
    timer: Tm,
    state: ReadyState,
    secure: bool,
    handshake: Option<PendingHandshake>,
    handshake_buf: Vec<u8>,
    path: Option<String>,
    request_headers: Option<Headers>,
    decoder: FrameDecoder,
    assembler: MessageAssembler,
    pings: PingTracker,
    events: Emitter<Event>,
    close_sent: bool,
    close_received: bool,
    close_timer: Option<TimerId>,
    local_close: Option<CloseInfo>,
    close_published: bool,
}

impl<T: Transport, Tm: Timer> Connection<T, Tm> {
    /// Client connection to `endpoint` over `transport`.
    ///
    /// The handshake request goes out on the transport's `Connect` event
    /// (plain) or `SecureConnect` event (TLS). A `wss` endpoint over a
    /// transport without TLS is a configuration error.
    pub fn client(transport: T, timer: Tm, endpoint: &Endpoint) -> Result<Self> {
        if endpoint.secure && !transport.is_secure() {
            return Err(WsError::Configuration(format!(
                "wss://{} requires a TLS transport",
                endpoint.host
            )));
        }
        let secure = transport.is_secure();
        let mut conn = Self::new(Role::Client, transport, timer, secure);
        conn.path = Some(endpoint.path.clone());
        conn.handshake = Some(PendingHandshake::Client {
            handshake: ClientHandshake::new(),
            host: endpoint.host_header(),
            path: endpoint.path.clone(),
            extra_headers: Vec::new(),
            request_sent: false,
        });
        Ok(conn)
    }

    /// Peer connection accepted by a server; waits for the upgrade request.
    pub fn accept(transport: T, timer: Tm) -> Self {
        let secure = transport.is_secure();
        let mut conn = Self::new(Role::Server, transport, timer, secure);
        conn.handshake = Some(PendingHandshake::Server);
        conn
    }

    fn new(role: Role, transport: T, timer: Tm, secure: bool) -> Self {
        Self {
            role,
            transport,
            timer,
            state: ReadyState::Connecting,
            secure,
            handshake: None,
            handshake_buf: Vec::new(),
            path: None,
            request_headers: None,
            decoder: FrameDecoder::new(role.inbound_policy()),
            assembler: MessageAssembler::default(),
            pings: PingTracker::default(),
            events: Emitter::default(),
            close_sent: false,
            close_received: false,
            close_timer: None,
            local_close: None,
            close_published: false,
        }
    }

    /// Extra request headers (e.g. `Origin`) for a client handshake.
    pub fn with_extra_headers(mut self, headers: Vec<(String, String)>) -> Self {
        if let Some(PendingHandshake::Client { extra_headers, .. }) = self.handshake.as_mut() {
            *extra_headers = headers;
        }
        self
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn on(&mut self, listener: impl FnMut(&Event) + 'static) {
        self.events.on(listener);
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn ready_state(&self) -> ReadyState {
        self.state
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// `true` once the opening handshake has completed.
    pub fn handshake_complete(&self) -> bool {
        self.handshake.is_none() && self.state != ReadyState::Connecting
    }

    /// Request path: the target path for clients, the requested path for peers.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Headers of the upgrade request (server peers only).
    pub fn request_headers(&self) -> Option<&Headers> {
        self.request_headers.as_ref()
    }

    pub fn pending_pings(&self) -> usize {
        self.pings.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Process one transport event. Events must be delivered in arrival order.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connect => {
                if !self.secure {
                    self.send_handshake_request();
                }
            }
            TransportEvent::SecureConnect => self.send_handshake_request(),
            TransportEvent::Data(bytes) => self.handle_data(&bytes),
            TransportEvent::End => {
                debug!(role = ?self.role, "remote end finished sending");
                self.transport.end();
            }
            TransportEvent::Error(err) => {
                warn!(role = ?self.role, error = %err, "transport error");
                self.publish(Event::Error(err.into()));
            }
            TransportEvent::Close => self.finish_close(),
        }
    }

    /// Handle an expired timer. Returns `false` if the timer is not ours.
    ///
    /// A ping timeout sends close 1002 and tears the transport down without
    /// waiting for the peer's echo. An expired close timer tears it down too.
    pub fn handle_timeout(&mut self, id: TimerId) -> bool {
        if self.close_timer == Some(id) {
            self.close_timer = None;
            warn!(role = ?self.role, "closing handshake timed out");
            self.transport.destroy();
            self.finish_close();
            return true;
        }
        let Some(entry) = self.pings.expire(id) else {
            return false;
        };
        warn!(role = ?self.role, payload_len = entry.payload.len(), "ping timed out");
        self.terminate(WsCloseCode::PROTOCOL_ERROR, PING_TIMEOUT_REASON);
        true
    }

    /// Whether `id` is one of this connection's ping or close timers.
    pub fn owns_timer(&self, id: TimerId) -> bool {
        self.close_timer == Some(id) || self.pings.owns(id)
    }

    fn send_handshake_request(&mut self) {
        let Some(PendingHandshake::Client {
            handshake,
            host,
            path,
            extra_headers,
            request_sent,
        }) = self.handshake.as_mut()
        else {
            return;
        };
        if *request_sent {
            return;
        }
        *request_sent = true;
        let request = handshake.request(host, path, extra_headers);
        debug!(host = %host, path = %path, "sending upgrade request");
        if let Err(err) = self.transport.write(&request) {
            self.fail_handshake(err.into());
        }
    }

    fn handle_data(&mut self, data: &[u8]) {
        if self.state.is_closed() {
            return;
        }
        if self.handshake.is_some() {
            self.handshake_buf.extend_from_slice(data);
            match self.try_complete_handshake() {
                Ok(Some(remaining)) if !remaining.is_empty() => self.process_frames(&remaining),
                Ok(_) => {}
                Err(err) => self.fail_handshake(err),
            }
            return;
        }
        self.process_frames(data);
    }

    /// `Ok(Some(leftover))` once the handshake completed; `Ok(None)` while
    /// the header block is still incomplete.
    fn try_complete_handshake(&mut self) -> Result<Option<Vec<u8>>> {
        let remaining = match &self.handshake {
            Some(PendingHandshake::Client { handshake, .. }) => {
                let Some(response) = handshake.parse_response(&self.handshake_buf)? else {
                    return Ok(None);
                };
                response.remaining
            }
            Some(PendingHandshake::Server) => {
                let Some(request) = parse_request(&self.handshake_buf)? else {
                    return Ok(None);
                };
                self.transport.write(&build_response(&request.key))?;
                self.path = Some(request.path);
                self.request_headers = Some(request.headers);
                request.remaining
            }
            None => return Ok(None),
        };

        self.handshake = None;
        self.handshake_buf = Vec::new();
        self.state.transition(ReadyState::Open)?;
        info!(role = ?self.role, path = ?self.path, secure = self.secure, "websocket open");
        self.publish(Event::Open);
        Ok(Some(remaining))
    }

    fn fail_handshake(&mut self, err: WsError) {
        warn!(role = ?self.role, error = %err, "handshake failed");
        if self.role == Role::Server && err.is_protocol() {
            let reason = match &err {
                WsError::Protocol(reason) => reason.as_str(),
                _ => "invalid upgrade request",
            };
            let _ = self.transport.write(&build_bad_request(reason));
            self.transport.end();
        } else {
            self.transport.destroy();
        }
        self.handshake = None;
        self.handshake_buf = Vec::new();
        self.local_close = Some(CloseInfo::new(WsCloseCode::ABNORMAL, err.to_string()));
        self.publish(Event::Error(err));
        self.finish_close();
    }

    fn process_frames(&mut self, data: &[u8]) {
        self.decoder.extend(data);
        while !self.state.is_closed() && !self.close_received {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => self.handle_frame(frame),
                Ok(None) => break,
                Err(err) => {
                    let reason = err.to_string();
                    self.fail(WsCloseCode::PROTOCOL_ERROR, &reason, err);
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: WsFrame) {
        match frame.opcode {
            WsOpcode::Ping => {
                if !self.close_sent {
                    let _ = self.write_frame(WsOpcode::Pong, &frame.payload);
                }
                self.publish(Event::Ping(frame.payload));
            }
            WsOpcode::Pong => {
                if let Some(entry) = self.pings.resolve(&frame.payload) {
                    self.timer.cancel(entry.timer);
                    entry.complete(&frame.payload);
                }
                self.publish(Event::Pong(frame.payload));
            }
            WsOpcode::Close => self.handle_close_frame(&frame.payload),
            WsOpcode::Text | WsOpcode::Binary | WsOpcode::Continuation => {
                match self.assembler.push(frame) {
                    Ok(Some(message)) => self.publish(Event::Message(message)),
                    Ok(None) => {}
                    Err(err) => {
                        let reason = err.reason();
                        self.fail(err.close_code(), reason, WsError::protocol(reason));
                    }
                }
            }
        }
    }

    fn handle_close_frame(&mut self, payload: &[u8]) {
        self.close_received = true;
        let info = match validate_close_payload(payload) {
            Ok(info) => info,
            Err(reason) => {
                self.fail(WsCloseCode::PROTOCOL_ERROR, reason, WsError::protocol(reason));
                return;
            }
        };
        debug!(role = ?self.role, code = info.code, reason = %info.reason, "close frame received");
        if !self.close_sent {
            // Echo the status code; a close without status is echoed empty.
            let code = (info.code != WsCloseCode::NO_STATUS).then_some(info.code);
            let _ = self.send_close_frame(code, "");
        }
        if self.state == ReadyState::Open {
            let _ = self.state.transition(ReadyState::Closing);
        }
        self.arm_close_timer();
        // Our own close frame, when we started the handshake, names the close.
        let info = self.local_close.take().unwrap_or(info);
        self.publish_close(info);
        self.transport.end();
    }

    fn arm_close_timer(&mut self) {
        if self.close_timer.is_none() {
            self.close_timer = Some(self.timer.schedule(CLOSE_TIMEOUT));
        }
    }

    /// Fail the connection: close frame with `code`, tear down the transport.
    fn fail(&mut self, code: u16, reason: &str, err: WsError) {
        warn!(role = ?self.role, code, reason, "failing connection");
        self.publish(Event::Error(err));
        if !self.close_sent {
            let _ = self.send_close_frame(Some(code), reason);
        }
        self.local_close = Some(CloseInfo::new(code, reason));
        self.transport.destroy();
        self.finish_close();
    }

    /// Final transition to CLOSED. Safe to call more than once.
    fn finish_close(&mut self) {
        if !self.state.is_closed() {
            let _ = self.state.transition(ReadyState::Closed);
        }
        for entry in self.pings.drain() {
            self.timer.cancel(entry.timer);
        }
        if let Some(id) = self.close_timer.take() {
            self.timer.cancel(id);
        }
        let info = self.local_close.take().unwrap_or_else(CloseInfo::abnormal);
        self.publish_close(info);
    }

    fn publish_close(&mut self, info: CloseInfo) {
        if self.close_published {
            return;
        }
        self.close_published = true;
        info!(role = ?self.role, code = info.code, reason = %info.reason, "websocket closed");
        self.publish(Event::Close(info));
    }

    fn publish(&mut self, event: Event) {
        self.events.publish(&event);
    }

    /// Publish `err` as an error event and hand it back to the caller.
    fn report<R>(&mut self, err: WsError) -> Result<R> {
        self.publish(Event::Error(err.clone()));
        Err(err)
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Send one data frame.
    ///
    /// Compression requests fail with `UnsupportedFeature` and write nothing.
    /// Writing to a disconnected transport fails with `TransportUnavailable`.
    /// Both are also published as `Event::Error`; the connection stays usable.
    ///
    /// # Panics
    ///
    /// If `opts.mask` contradicts the role (client frames must be masked,
    /// server frames must not).
    pub fn send(&mut self, payload: &[u8], opts: SendOptions) -> Result<()> {
        let opcode = match opts.check(self.role) {
            Ok(opcode) => opcode,
            Err(err) => return self.report(err),
        };
        self.ensure_open()?;
        self.write_frame(opcode, payload)
    }

    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.send(text.as_bytes(), SendOptions::text())
    }

    pub fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.send(data, SendOptions::binary())
    }

    /// Send a ping and close the connection with 1002 if no pong with the
    /// same payload arrives within [`PING_TIMEOUT`].
    pub fn ping(&mut self, payload: &[u8]) -> Result<()> {
        self.start_ping(payload, None)
    }

    /// Like [`Connection::ping`], running `callback` with the pong payload
    /// when the matching pong arrives.
    pub fn ping_with(
        &mut self,
        payload: &[u8],
        callback: impl FnOnce(&[u8]) + 'static,
    ) -> Result<()> {
        self.start_ping(payload, Some(Box::new(callback)))
    }

    fn start_ping(&mut self, payload: &[u8], callback: Option<PingCallback>) -> Result<()> {
        self.ensure_open()?;
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return self.report(WsError::protocol("ping payload exceeds 125 bytes"));
        }
        self.write_frame(WsOpcode::Ping, payload)?;
        let timer = self.timer.schedule(PING_TIMEOUT);
        self.pings.register(payload.to_vec(), timer, callback);
        Ok(())
    }

    /// Send an unsolicited pong (masked for clients, unmasked for servers).
    pub fn pong(&mut self, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return self.report(WsError::protocol("pong payload exceeds 125 bytes"));
        }
        self.write_frame(WsOpcode::Pong, payload)
    }

    /// Start the closing handshake.
    ///
    /// Sends a close frame carrying `code` and `reason` (an empty payload
    /// when `code` is `None`), moves to CLOSING and ends the transport; the
    /// `close` event follows when the peer answers or the transport closes.
    /// If neither happens within [`CLOSE_TIMEOUT`] the transport is destroyed.
    /// Closing a connection that is already closing is a no-op. Closing
    /// before the handshake completed tears the transport down.
    pub fn close(&mut self, code: Option<u16>, reason: &str) -> Result<()> {
        let info = CloseInfo::new(code.unwrap_or(WsCloseCode::NO_STATUS), reason);
        match self.state {
            ReadyState::Closing | ReadyState::Closed => Ok(()),
            ReadyState::Connecting => {
                self.local_close = Some(info);
                self.handshake = None;
                self.transport.destroy();
                self.finish_close();
                Ok(())
            }
            ReadyState::Open => {
                self.local_close = Some(info);
                let sent = self.send_close_frame(code, reason);
                self.state.transition(ReadyState::Closing)?;
                self.arm_close_timer();
                self.transport.end();
                sent
            }
        }
    }

    /// Close frame (if still possible) then immediate teardown.
    pub(crate) fn terminate(&mut self, code: u16, reason: &str) {
        if self.state.is_closed() {
            return;
        }
        if self.state == ReadyState::Open {
            let _ = self.send_close_frame(Some(code), reason);
        }
        self.local_close.get_or_insert_with(|| CloseInfo::new(code, reason));
        self.transport.destroy();
        self.finish_close();
    }

    /// Write pre-encoded frame bytes (broadcast encodes once for all peers).
    pub(crate) fn write_encoded(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if !self.transport.is_connected() {
            return self.report(WsError::TransportUnavailable);
        }
        match self.transport.write(bytes) {
            Ok(()) => Ok(()),
            Err(err) => self.report(err.into()),
        }
    }

    fn ensure_open(&mut self) -> Result<()> {
        if self.state.is_open() {
            Ok(())
        } else {
            let state = self.state;
            self.report(WsError::NotOpen(state))
        }
    }

    fn send_close_frame(&mut self, code: Option<u16>, reason: &str) -> Result<()> {
        self.close_sent = true;
        let payload = build_close_payload(code, reason);
        self.write_frame(WsOpcode::Close, &payload)
    }

    fn write_frame(&mut self, opcode: WsOpcode, payload: &[u8]) -> Result<()> {
        if !self.transport.is_connected() {
            return self.report(WsError::TransportUnavailable);
        }
        let mask_key = self.role.masks_outbound().then(random_mask_key);
        let bytes = encode_frame(payload, opcode, mask_key, true);
        match self.transport.write(&bytes) {
            Ok(()) => Ok(()),
            Err(err) => self.report(err.into()),
        }
    }
}

impl<T, Tm> std::fmt::Debug for Connection<T, Tm> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("secure", &self.secure)
            .field("path", &self.path)
            .field("pending_pings", &self.pings.len())
            .finish()
    }
}
