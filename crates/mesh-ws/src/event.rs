//! Application-facing events and the publish helper embedded in connections
//! and servers.

use crate::close::CloseInfo;
use crate::error::WsError;
use crate::message::Message;
use crate::server::PeerId;

/// Events published by a single connection.
#[derive(Debug, Clone)]
pub enum Event {
    /// Handshake completed; the connection is OPEN.
    Open,
    Message(Message),
    /// A ping arrived. The pong reply has already been sent.
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// Published exactly once per connection.
    Close(CloseInfo),
    Error(WsError),
}

/// Events published by a server, tagged with the peer they concern.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Open(PeerId),
    Message(PeerId, Message),
    Ping(PeerId, Vec<u8>),
    Pong(PeerId, Vec<u8>),
    Close(PeerId, CloseInfo),
    /// `None` for errors that do not belong to one peer.
    Error(Option<PeerId>, WsError),
}

impl ServerEvent {
    pub(crate) fn from_peer(peer: PeerId, event: Event) -> Self {
        match event {
            Event::Open => ServerEvent::Open(peer),
            Event::Message(msg) => ServerEvent::Message(peer, msg),
            Event::Ping(payload) => ServerEvent::Ping(peer, payload),
            Event::Pong(payload) => ServerEvent::Pong(peer, payload),
            Event::Close(info) => ServerEvent::Close(peer, info),
            Event::Error(err) => ServerEvent::Error(Some(peer), err),
        }
    }
}

type Listener<E> = Box<dyn FnMut(&E)>;

/// Ordered list of listeners; [`Emitter::publish`] calls each in
/// registration order.
pub struct Emitter<E> {
    listeners: Vec<Listener<E>>,
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }
}

impl<E> Emitter<E> {
    pub fn on(&mut self, listener: impl FnMut(&E) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn publish(&mut self, event: &E) {
        for listener in self.listeners.iter_mut() {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl<E> std::fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
