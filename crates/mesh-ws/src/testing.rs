//! In-memory collaborators for unit tests.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use crate::frame::{FrameDecoder, MaskPolicy, WsFrame};
use crate::transport::{TimerId, Timer, Transport};

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub written: Vec<u8>,
    pub connected: bool,
    pub secure: bool,
    pub ended: bool,
    pub destroyed: bool,
    pub writes: usize,
}

/// Records writes; clones share state so tests can inspect after handing
/// one clone to a connection.
#[derive(Debug, Clone)]
pub(crate) struct MockTransport(pub Rc<RefCell<MockState>>);

impl MockTransport {
    pub fn new() -> Self {
        MockTransport(Rc::new(RefCell::new(MockState {
            connected: true,
            ..MockState::default()
        })))
    }

    pub fn secure() -> Self {
        let t = Self::new();
        t.0.borrow_mut().secure = true;
        t
    }

    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.borrow_mut().written)
    }

    /// Decode everything written so far as frames.
    pub fn take_frames(&self, policy: MaskPolicy) -> Vec<WsFrame> {
        let mut decoder = FrameDecoder::new(policy);
        decoder.extend(&self.take_written());
        decoder.frames().collect::<Result<_, _>>().expect("well-formed frames")
    }

    pub fn set_connected(&self, connected: bool) {
        self.0.borrow_mut().connected = connected;
    }

    pub fn writes(&self) -> usize {
        self.0.borrow().writes
    }

    pub fn destroyed(&self) -> bool {
        self.0.borrow().destroyed
    }

    pub fn ended(&self) -> bool {
        self.0.borrow().ended
    }
}

impl Transport for MockTransport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.0.borrow_mut();
        if !state.connected {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "mock not connected"));
        }
        state.written.extend_from_slice(bytes);
        state.writes += 1;
        Ok(())
    }

    fn end(&mut self) {
        self.0.borrow_mut().ended = true;
    }

    fn destroy(&mut self) {
        let mut state = self.0.borrow_mut();
        state.destroyed = true;
        state.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.0.borrow().connected
    }

    fn is_secure(&self) -> bool {
        self.0.borrow().secure
    }
}

#[derive(Debug, Default)]
pub(crate) struct TimerState {
    next: u64,
    pub scheduled: Vec<(TimerId, Duration)>,
    pub cancelled: Vec<TimerId>,
}

/// Timer that never fires on its own; tests fire ids by hand.
#[derive(Debug, Clone, Default)]
pub(crate) struct ManualTimer(pub Rc<RefCell<TimerState>>);

impl ManualTimer {
    pub fn last_scheduled(&self) -> Option<(TimerId, Duration)> {
        self.0.borrow().scheduled.last().copied()
    }

    pub fn is_cancelled(&self, id: TimerId) -> bool {
        self.0.borrow().cancelled.contains(&id)
    }
}

impl Timer for ManualTimer {
    fn schedule(&mut self, delay: Duration) -> TimerId {
        let mut state = self.0.borrow_mut();
        state.next += 1;
        let id = TimerId(state.next);
        state.scheduled.push((id, delay));
        id
    }

    fn cancel(&mut self, id: TimerId) {
        self.0.borrow_mut().cancelled.push(id);
    }
}
