//! Outstanding-ping bookkeeping.
//!
//! Each `ping()` registers an entry holding the payload, the caller's
//! callback and the timeout timer. A pong whose payload equals an entry's
//! payload resolves the first such entry in registration order; duplicate
//! payloads may be in flight at once. Expected counts are small, so the
//! entries live in a plain ordered `Vec`.

use std::time::Duration;

use crate::transport::TimerId;

/// How long a ping may wait for its pong before the connection is closed.
pub const PING_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Close reason sent when a ping times out (with code 1002).
pub const PING_TIMEOUT_REASON: &str = "Ping timeout limit exceeded";

/// Invoked with the pong payload when the matching pong arrives.
pub type PingCallback = Box<dyn FnOnce(&[u8])>;

pub struct PendingPing {
    pub payload: Vec<u8>,
    pub timer: TimerId,
    callback: Option<PingCallback>,
}

impl PendingPing {
    /// Run the callback, if any, with the pong payload.
    pub fn complete(mut self, pong_payload: &[u8]) {
        if let Some(callback) = self.callback.take() {
            callback(pong_payload);
        }
    }
}

impl std::fmt::Debug for PendingPing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingPing")
            .field("payload", &self.payload)
            .field("timer", &self.timer)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct PingTracker {
    pending: Vec<PendingPing>,
}

impl PingTracker {
    pub fn register(&mut self, payload: Vec<u8>, timer: TimerId, callback: Option<PingCallback>) {
        self.pending.push(PendingPing {
            payload,
            timer,
            callback,
        });
    }

    /// Remove and return the first entry whose payload equals `pong_payload`.
    /// A pong nobody is waiting for yields `None`.
    pub fn resolve(&mut self, pong_payload: &[u8]) -> Option<PendingPing> {
        let idx = self.pending.iter().position(|p| p.payload == pong_payload)?;
        Some(self.pending.remove(idx))
    }

    /// Remove and return the entry whose timeout timer fired.
    pub fn expire(&mut self, timer: TimerId) -> Option<PendingPing> {
        let idx = self.pending.iter().position(|p| p.timer == timer)?;
        Some(self.pending.remove(idx))
    }

    pub fn owns(&self, timer: TimerId) -> bool {
        self.pending.iter().any(|p| p.timer == timer)
    }

    /// Remove every entry, e.g. when the connection closes.
    pub fn drain(&mut self) -> Vec<PendingPing> {
        std::mem::take(&mut self.pending)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_resolve_matches_payload_and_runs_callback() {
        let fired = Rc::new(Cell::new(false));
        let mut tracker = PingTracker::default();
        let flag = fired.clone();
        tracker.register(b"abc".to_vec(), TimerId(1), Some(Box::new(move |p| {
            assert_eq!(p, b"abc");
            flag.set(true);
        })));

        assert!(tracker.resolve(b"xyz").is_none(), "unmatched pong is ignored");
        let entry = tracker.resolve(b"abc").expect("matching entry");
        assert_eq!(entry.timer, TimerId(1));
        entry.complete(b"abc");
        assert!(fired.get());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_duplicate_payloads_resolve_first_registered() {
        let mut tracker = PingTracker::default();
        tracker.register(b"p".to_vec(), TimerId(1), None);
        tracker.register(b"p".to_vec(), TimerId(2), None);
        assert_eq!(tracker.resolve(b"p").unwrap().timer, TimerId(1));
        assert_eq!(tracker.resolve(b"p").unwrap().timer, TimerId(2));
        assert!(tracker.resolve(b"p").is_none());
    }

    #[test]
    fn test_expire_by_timer() {
        let mut tracker = PingTracker::default();
        tracker.register(b"a".to_vec(), TimerId(10), None);
        tracker.register(b"b".to_vec(), TimerId(11), None);
        assert!(tracker.owns(TimerId(11)));
        assert_eq!(tracker.expire(TimerId(11)).unwrap().payload, b"b");
        assert!(tracker.expire(TimerId(11)).is_none());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_drain_empties_tracker() {
        let mut tracker = PingTracker::default();
        tracker.register(vec![], TimerId(1), None);
        tracker.register(vec![], TimerId(2), None);
        assert_eq!(tracker.drain().len(), 2);
        assert!(tracker.is_empty());
    }
}
