//! Server-side connection registry.
//!
//! A [`Server`] owns one [`Connection`] per accepted transport, keyed by a
//! [`PeerId`] handed out in accept order. Peer events are collected from each
//! connection, republished as [`ServerEvent`]s, and a peer's `Close` event
//! removes it from the registry.
//!
//! ## Functions
//!
//! - [`Server::accept`] -- register a transport as a CONNECTING peer
//! - [`Server::handle_event`] -- route a transport event to its peer
//! - [`Server::handle_timeout`] -- route an expired timer to its peer
//! - [`Server::broadcast`] -- encode once, write to every OPEN peer
//! - [`Server::send_to`] -- send to one peer
//! - [`Server::close`] -- close every peer with 1001 and stop accepting

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::close::WsCloseCode;
use crate::connection::{Connection, Role, SendOptions};
use crate::error::{Result, WsError};
use crate::event::{Emitter, Event, ServerEvent};
use crate::frame::encode_frame;
use crate::transport::{TimerId, Timer, Transport, TransportEvent};

/// Close reason sent to every peer by [`Server::close`].
pub const SHUTDOWN_REASON: &str = "server shutting down";

/// Registry identity of an accepted peer. Never reused within one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Inbox = Rc<RefCell<Vec<(PeerId, Event)>>>;

pub struct Server<T, Tm> {
    timer: Tm,
    /// Accept order. Lookups are linear; registries are expected to be small.
    peers: Vec<(PeerId, Connection<T, Tm>)>,
    next_id: u64,
    inbox: Inbox,
    events: Emitter<ServerEvent>,
    closed: bool,
}

impl<T: Transport, Tm: Timer + Clone> Server<T, Tm> {
    /// Empty registry. Each accepted peer gets a clone of `timer`.
    pub fn new(timer: Tm) -> Self {
        Self {
            timer,
            peers: Vec::new(),
            next_id: 0,
            inbox: Rc::new(RefCell::new(Vec::new())),
            events: Emitter::default(),
            closed: false,
        }
    }

    pub fn on(&mut self, listener: impl FnMut(&ServerEvent) + 'static) {
        self.events.on(listener);
    }

    /// Register a freshly accepted transport as a CONNECTING peer.
    pub fn accept(&mut self, transport: T) -> Result<PeerId> {
        if self.closed {
            return Err(WsError::ServerClosed);
        }
        self.next_id += 1;
        let id = PeerId(self.next_id);

        let mut conn = Connection::accept(transport, self.timer.clone());
        let inbox = self.inbox.clone();
        conn.on(move |event| inbox.borrow_mut().push((id, event.clone())));
        self.insert(id, conn)?;
        debug!(peer = %id, peers = self.peers.len(), "peer accepted");
        Ok(id)
    }

    fn insert(&mut self, id: PeerId, conn: Connection<T, Tm>) -> Result<()> {
        if self.position(id).is_some() {
            return Err(WsError::DuplicatePeer(id));
        }
        self.peers.push((id, conn));
        Ok(())
    }

    /// Route one transport event to `peer`. Events for peers that already
    /// left the registry are dropped.
    pub fn handle_event(&mut self, peer: PeerId, event: TransportEvent) {
        match self.peer_mut(peer) {
            Some(conn) => conn.handle_event(event),
            None => {
                debug!(peer = %peer, ?event, "event for departed peer");
                return;
            }
        }
        self.dispatch();
    }

    /// Route an expired timer to the peer that scheduled it.
    pub fn handle_timeout(&mut self, id: TimerId) -> bool {
        let handled = self
            .peers
            .iter_mut()
            .find(|(_, conn)| conn.owns_timer(id))
            .map(|(_, conn)| conn.handle_timeout(id))
            .unwrap_or(false);
        self.dispatch();
        handled
    }

    /// Send `payload` to every OPEN peer; returns how many were written.
    ///
    /// The frame is encoded once. Peers that are CONNECTING, CLOSING or CLOSED
    /// are skipped but stay registered. A write failure on one peer is
    /// reported as that peer's error event and does not stop the broadcast.
    pub fn broadcast(&mut self, payload: &[u8], opts: SendOptions) -> Result<usize> {
        let opcode = match opts.check(Role::Server) {
            Ok(opcode) => opcode,
            Err(err) => {
                self.events.publish(&ServerEvent::Error(None, err.clone()));
                return Err(err);
            }
        };
        let frame = encode_frame(payload, opcode, None, true);

        let targets: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, conn)| conn.ready_state().is_open())
            .map(|(id, _)| *id)
            .collect();

        let mut delivered = 0;
        for id in targets {
            if let Some(conn) = self.peer_mut(id) {
                if conn.write_encoded(&frame).is_ok() {
                    delivered += 1;
                }
            }
        }
        debug!(delivered, bytes = payload.len(), "broadcast");
        self.dispatch();
        Ok(delivered)
    }

    /// Send one message to a single peer.
    pub fn send_to(&mut self, peer: PeerId, payload: &[u8], opts: SendOptions) -> Result<()> {
        let conn = self.peer_mut(peer).ok_or(WsError::UnknownPeer(peer))?;
        let result = conn.send(payload, opts);
        self.dispatch();
        result
    }

    /// Start a normal close of one peer.
    pub fn close_peer(&mut self, peer: PeerId, code: Option<u16>, reason: &str) -> Result<()> {
        let conn = self.peer_mut(peer).ok_or(WsError::UnknownPeer(peer))?;
        let result = conn.close(code, reason);
        self.dispatch();
        result
    }

    /// Close every peer with 1001 and refuse further accepts.
    ///
    /// Each peer gets a close frame (if OPEN), its transport is destroyed, its
    /// `Close` event is published and it leaves the registry.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let ids: Vec<PeerId> = self.peers.iter().map(|(id, _)| *id).collect();
        info!(peers = ids.len(), "server closing");
        for id in ids {
            if let Some(conn) = self.peer_mut(id) {
                conn.terminate(WsCloseCode::GOING_AWAY, SHUTDOWN_REASON);
            }
            self.dispatch();
        }
    }

    /// Republish queued peer events; a `Close` removes the peer.
    fn dispatch(&mut self) {
        loop {
            let batch = std::mem::take(&mut *self.inbox.borrow_mut());
            if batch.is_empty() {
                break;
            }
            for (id, event) in batch {
                if let Event::Close(info) = &event {
                    if self.remove(id) {
                        let peers = self.peers.len();
                        debug!(peer = %id, code = info.code, peers, "peer removed");
                    } else {
                        warn!(peer = %id, "close for peer not in registry");
                    }
                }
                self.events.publish(&ServerEvent::from_peer(id, event));
            }
        }
    }

    /// Remove `id`; returns `false` if it was already gone.
    fn remove(&mut self, id: PeerId) -> bool {
        match self.position(id) {
            Some(idx) => {
                self.peers.remove(idx);
                true
            }
            None => false,
        }
    }
}

impl<T, Tm> Server<T, Tm> {
    fn position(&self, id: PeerId) -> Option<usize> {
        self.peers.iter().position(|(peer, _)| *peer == id)
    }

    pub fn peer(&self, id: PeerId) -> Option<&Connection<T, Tm>> {
        self.position(id).map(|idx| &self.peers[idx].1)
    }

    pub fn peer_mut(&mut self, id: PeerId) -> Option<&mut Connection<T, Tm>> {
        let idx = self.position(id)?;
        Some(&mut self.peers[idx].1)
    }

    /// Registered peers in accept order.
    pub fn peers(&self) -> impl Iterator<Item = (PeerId, &Connection<T, Tm>)> {
        self.peers.iter().map(|(id, conn)| (*id, conn))
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|(id, _)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<T, Tm> fmt::Debug for Server<T, Tm> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("peers", &self.peers.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::close::{build_close_payload, parse_close_payload, CloseInfo};
    use crate::frame::{MaskPolicy, WsOpcode};
    use crate::handshake::ClientHandshake;
    use crate::message::Message;
    use crate::ping::PING_TIMEOUT_REASON;
    use crate::state::ReadyState;
    use crate::testing::{ManualTimer, MockTransport};

    type TestServer = Server<MockTransport, ManualTimer>;

    fn upgrade_request() -> Vec<u8> {
        ClientHandshake::with_key("dGhlIHNhbXBsZSBub25jZQ==").request("localhost", "/", &[])
    }

    fn masked(payload: &[u8], opcode: WsOpcode) -> Vec<u8> {
        encode_frame(payload, opcode, Some([9, 8, 7, 6]), true)
    }

    fn record(server: &mut TestServer) -> Rc<RefCell<Vec<ServerEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        server.on(move |ev| sink.borrow_mut().push(ev.clone()));
        events
    }

    /// Accept a peer and complete its handshake.
    fn open_peer(server: &mut TestServer) -> (PeerId, MockTransport) {
        let transport = MockTransport::new();
        let id = server.accept(transport.clone()).unwrap();
        server.handle_event(id, TransportEvent::Data(upgrade_request()));
        assert_eq!(server.peer(id).unwrap().ready_state(), ReadyState::Open);
        transport.take_written();
        (id, transport)
    }

    #[test]
    fn test_accept_assigns_increasing_ids() {
        let mut server = TestServer::new(ManualTimer::default());
        let a = server.accept(MockTransport::new()).unwrap();
        let b = server.accept(MockTransport::new()).unwrap();
        assert!(a < b);
        assert_eq!(server.peer_ids(), vec![a, b]);
        assert_eq!(server.peer(a).unwrap().ready_state(), ReadyState::Connecting);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut server = TestServer::new(ManualTimer::default());
        let id = server.accept(MockTransport::new()).unwrap();
        let dup = Connection::accept(MockTransport::new(), ManualTimer::default());
        assert!(matches!(server.insert(id, dup), Err(WsError::DuplicatePeer(p)) if p == id));
        assert_eq!(server.len(), 1);
    }

    #[test]
    fn test_open_and_message_events_carry_peer() {
        let mut server = TestServer::new(ManualTimer::default());
        let events = record(&mut server);
        let (id, _transport) = open_peer(&mut server);
        server.handle_event(id, TransportEvent::Data(masked(b"hi", WsOpcode::Text)));

        let events = events.borrow();
        assert!(matches!(events[0], ServerEvent::Open(p) if p == id));
        assert!(matches!(
            &events[1],
            ServerEvent::Message(p, Message::Text(t)) if *p == id && t == "hi"
        ));
    }

    #[test]
    fn test_broadcast_skips_closing_peer() {
        let mut server = TestServer::new(ManualTimer::default());
        let (a, ta) = open_peer(&mut server);
        let (b, tb) = open_peer(&mut server);
        let (c, tc) = open_peer(&mut server);
        server.close_peer(b, Some(1000), "bye").unwrap();
        tb.take_written();

        let delivered = server.broadcast(b"news", SendOptions::text()).unwrap();
        assert_eq!(delivered, 2);
        for t in [&ta, &tc] {
            let frames = t.take_frames(MaskPolicy::Forbidden);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].payload, b"news");
        }
        assert!(tb.take_written().is_empty(), "CLOSING peer gets nothing");
        assert_eq!(server.len(), 3, "skipped peers stay registered");
        assert!(server.peer(a).is_some() && server.peer(c).is_some());
    }

    #[test]
    fn test_broadcast_with_compress_fails_without_writes() {
        let mut server = TestServer::new(ManualTimer::default());
        let events = record(&mut server);
        let (_id, transport) = open_peer(&mut server);
        let opts = SendOptions {
            compress: true,
            ..SendOptions::default()
        };
        let err = server.broadcast(b"x", opts).unwrap_err();
        assert!(matches!(err, WsError::UnsupportedFeature(_)));
        assert!(transport.take_written().is_empty());
        assert!(events
            .borrow()
            .iter()
            .any(|e| matches!(e, ServerEvent::Error(None, WsError::UnsupportedFeature(_)))));
    }

    #[test]
    fn test_broadcast_binary_is_unmasked_binary_frame() {
        let mut server = TestServer::new(ManualTimer::default());
        let (_id, transport) = open_peer(&mut server);
        server.broadcast(&[0, 1, 2], SendOptions::binary()).unwrap();
        let frames = transport.take_frames(MaskPolicy::Forbidden);
        assert_eq!(frames[0].opcode, WsOpcode::Binary);
    }

    #[test]
    fn test_accepts_then_closes_in_any_order_empty_registry() {
        let mut server = TestServer::new(ManualTimer::default());
        let events = record(&mut server);
        let ids: Vec<PeerId> = (0..5).map(|_| open_peer(&mut server).0).collect();

        // Mix of remote close frames, bare transport closes and local closes.
        for (n, id) in [ids[3], ids[0], ids[4], ids[1], ids[2]].into_iter().enumerate() {
            match n % 3 {
                0 => server.handle_event(id, TransportEvent::Close),
                1 => {
                    let close = masked(&build_close_payload(Some(1000), ""), WsOpcode::Close);
                    server.handle_event(id, TransportEvent::Data(close))
                }
                _ => server.close_peer(id, None, "").unwrap(),
            }
            // Second close from the transport must not remove anything twice
            server.handle_event(id, TransportEvent::Close);
        }

        assert_eq!(server.len(), 0);
        let closes = events.borrow().iter().filter(|e| matches!(e, ServerEvent::Close(..))).count();
        assert_eq!(closes, 5, "one close event per peer");
    }

    #[test]
    fn test_failed_handshake_rejects_only_that_peer() {
        let mut server = TestServer::new(ManualTimer::default());
        let (good, _t) = open_peer(&mut server);
        let bad_transport = MockTransport::new();
        let bad = server.accept(bad_transport.clone()).unwrap();
        let request = b"GET / HTTP/1.0\r\nHost: x\r\n\r\n".to_vec();
        server.handle_event(bad, TransportEvent::Data(request));

        assert!(String::from_utf8_lossy(&bad_transport.take_written()).starts_with("HTTP/1.1 400"));
        assert!(server.peer(bad).is_none());
        assert_eq!(server.peer(good).unwrap().ready_state(), ReadyState::Open);
        assert_eq!(server.len(), 1);
    }

    #[test]
    fn test_close_sends_1001_and_empties_registry() {
        let mut server = TestServer::new(ManualTimer::default());
        let events = record(&mut server);
        let (_a, ta) = open_peer(&mut server);
        let connecting = MockTransport::new();
        server.accept(connecting.clone()).unwrap();

        server.close();
        assert!(server.is_empty());
        assert!(server.is_closed());

        let frames = ta.take_frames(MaskPolicy::Forbidden);
        let info = parse_close_payload(&frames[0].payload);
        assert_eq!(info.code, 1001);
        assert_eq!(info.reason, SHUTDOWN_REASON);
        assert!(ta.destroyed() && connecting.destroyed());
        let closes = events.borrow().iter().filter(|e| matches!(e, ServerEvent::Close(..))).count();
        assert_eq!(closes, 2);

        assert!(matches!(server.accept(MockTransport::new()), Err(WsError::ServerClosed)));
    }

    #[test]
    fn test_ping_timeout_routes_to_owner() {
        let timer = ManualTimer::default();
        let mut server = TestServer::new(timer.clone());
        let (a, ta) = open_peer(&mut server);
        let (b, _tb) = open_peer(&mut server);
        server.peer_mut(a).unwrap().ping(b"?").unwrap();
        let (id, _) = timer.last_scheduled().unwrap();
        ta.take_written();

        assert!(server.handle_timeout(id));
        assert!(server.peer(a).is_none());
        assert_eq!(server.peer(b).unwrap().ready_state(), ReadyState::Open);
        assert!(!server.handle_timeout(TimerId(999)));
    }

    #[test]
    fn test_ping_timeout_removes_silent_peer() {
        let timer = ManualTimer::default();
        let mut server = TestServer::new(timer.clone());
        let events = record(&mut server);
        let (id, transport) = open_peer(&mut server);
        server.peer_mut(id).unwrap().ping(b"hb").unwrap();
        let (tid, _) = timer.last_scheduled().unwrap();

        // No pong, no close echo, no transport event: the timer alone ends it
        assert!(server.handle_timeout(tid));
        assert_eq!(server.len(), 0);
        assert!(transport.destroyed());
        let closes: Vec<CloseInfo> = events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ServerEvent::Close(p, info) if *p == id => Some(info.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(closes, vec![CloseInfo::new(1002, PING_TIMEOUT_REASON)]);
    }

    #[test]
    fn test_interleaved_accepts_and_closes_empty_registry() {
        let mut server = TestServer::new(ManualTimer::default());
        let events = record(&mut server);

        let a = open_peer(&mut server).0;
        server.handle_event(a, TransportEvent::Close);
        let b = open_peer(&mut server).0;
        let c = server.accept(MockTransport::new()).unwrap();
        server.close_peer(b, Some(1000), "").unwrap();
        let d = open_peer(&mut server).0;
        server.handle_event(c, TransportEvent::Close);
        server.handle_event(b, TransportEvent::Close);
        let e = open_peer(&mut server).0;
        assert_eq!(server.peer_ids(), vec![d, e]);
        let going_away = masked(&build_close_payload(Some(1001), ""), WsOpcode::Close);
        server.handle_event(e, TransportEvent::Data(going_away));
        server.handle_event(d, TransportEvent::Close);

        assert_eq!(server.len(), 0);
        let mut closed: Vec<PeerId> = events
            .borrow()
            .iter()
            .filter_map(|ev| match ev {
                ServerEvent::Close(p, _) => Some(*p),
                _ => None,
            })
            .collect();
        closed.sort();
        assert_eq!(closed, vec![a, b, c, d, e], "one close event per peer");
    }

    #[test]
    fn test_send_to_unknown_peer() {
        let mut server = TestServer::new(ManualTimer::default());
        let err = server.send_to(PeerId(42), b"x", SendOptions::text()).unwrap_err();
        assert!(matches!(err, WsError::UnknownPeer(PeerId(42))));
    }

    #[test]
    fn test_events_for_departed_peer_are_dropped() {
        let mut server = TestServer::new(ManualTimer::default());
        let (id, _t) = open_peer(&mut server);
        server.handle_event(id, TransportEvent::Close);
        server.handle_event(id, TransportEvent::Data(masked(b"late", WsOpcode::Text)));
        assert!(server.is_empty());
    }
}
