use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::transport::{TimerId, Timer};

#[derive(Debug, Default)]
struct Queue {
    next: u64,
    deadlines: FxHashMap<TimerId, Instant>,
}

/// Deadline table shared by every connection on one event loop. Clones are
/// handles to the same queue.
#[derive(Debug, Clone, Default)]
pub struct TimerQueue(Rc<RefCell<Queue>>);

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return every timer due at `now`, earliest first.
    pub fn expired(&self, now: Instant) -> Vec<TimerId> {
        let mut queue = self.0.borrow_mut();
        let mut due: Vec<(Instant, TimerId)> = queue
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, deadline)| (*deadline, *id))
            .collect();
        due.sort();
        for (_, id) in &due {
            queue.deadlines.remove(id);
        }
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Time until the earliest deadline, if any timer is armed.
    pub fn next_delay(&self, now: Instant) -> Option<Duration> {
        self.0
            .borrow()
            .deadlines
            .values()
            .min()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    pub fn len(&self) -> usize {
        self.0.borrow().deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn schedule_at(&self, deadline: Instant) -> TimerId {
        let mut queue = self.0.borrow_mut();
        queue.next += 1;
        let id = TimerId(queue.next);
        queue.deadlines.insert(id, deadline);
        id
    }
}

impl Timer for TimerQueue {
    fn schedule(&mut self, delay: Duration) -> TimerId {
        self.schedule_at(Instant::now() + delay)
    }

    fn cancel(&mut self, id: TimerId) {
        self.0.borrow_mut().deadlines.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_in_deadline_order() {
        let queue = TimerQueue::new();
        let now = Instant::now();
        let late = queue.schedule_at(now + Duration::from_millis(20));
        let early = queue.schedule_at(now + Duration::from_millis(10));
        let future = queue.schedule_at(now + Duration::from_secs(60));

        assert!(queue.expired(now).is_empty());
        assert_eq!(queue.expired(now + Duration::from_millis(30)), vec![early, late]);
        assert_eq!(queue.len(), 1);
        assert!(queue.next_delay(now).unwrap() > Duration::from_secs(59));
        let _ = future;
    }

    #[test]
    fn test_cancel_through_clone() {
        let queue = TimerQueue::new();
        let mut handle = queue.clone();
        let id = handle.schedule(Duration::ZERO);
        handle.cancel(id);
        assert!(queue.expired(Instant::now() + Duration::from_secs(1)).is_empty());
        assert!(queue.is_empty());
    }
}
