//! Connection ready state.
//!
//! A connection moves strictly forward through
//! `Connecting -> Open -> Closing -> Closed`. States may be skipped (a failed
//! handshake goes straight from `Connecting` to `Closed`) but never revisited.
//! [`ReadyState::transition`] is the only place the state changes.

use crate::error::{Result, WsError};

/// Lifecycle state of a WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    /// Move to `next`, rejecting any transition that is not strictly forward.
    pub fn transition(&mut self, next: ReadyState) -> Result<()> {
        if next <= *self {
            return Err(WsError::InvalidTransition {
                from: *self,
                to: next,
            });
        }
        tracing::trace!(from = ?*self, to = ?next, "ready state transition");
        *self = next;
        Ok(())
    }

    pub fn is_open(self) -> bool {
        self == ReadyState::Open
    }

    pub fn is_closed(self) -> bool {
        self == ReadyState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let mut state = ReadyState::Connecting;
        state.transition(ReadyState::Open).unwrap();
        state.transition(ReadyState::Closing).unwrap();
        state.transition(ReadyState::Closed).unwrap();
        assert!(state.is_closed());
    }

    #[test]
    fn test_skipping_states_is_allowed() {
        let mut state = ReadyState::Connecting;
        state.transition(ReadyState::Closed).unwrap();
        assert_eq!(state, ReadyState::Closed);
    }

    #[test]
    fn test_regression_is_rejected() {
        let mut state = ReadyState::Closing;
        let err = state.transition(ReadyState::Open).unwrap_err();
        assert!(matches!(
            err,
            WsError::InvalidTransition {
                from: ReadyState::Closing,
                to: ReadyState::Open
            }
        ));
        assert_eq!(state, ReadyState::Closing, "state must not change on rejection");
    }

    #[test]
    fn test_self_transition_is_rejected() {
        let mut state = ReadyState::Open;
        assert!(state.transition(ReadyState::Open).is_err());
    }
}
