use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

use crate::events::StatsigEvent;

/// Bounded in-memory event queue.
///
/// When full, pushing a new event drops the OLDEST queued event. Pushing never blocks on
/// anything but the short queue lock. Once closed the queue rejects new events but can still be
/// drained.
#[derive(Debug)]
pub(crate) struct EventQueue {
    max_size: usize,
    state: Mutex<QueueState>,
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<StatsigEvent>,
    closed: bool,
}

impl EventQueue {
    pub(crate) fn new(max_size: usize) -> EventQueue {
        EventQueue {
            max_size: max_size.max(1),
            state: Mutex::new(QueueState::default()),
        }
    }

    pub(crate) fn max_size(&self) -> usize {
        self.max_size
    }

    /// Push `event`, returning the number of events dropped to make room, or `None` if the queue
    /// is closed.
    pub(crate) fn push(&self, event: StatsigEvent) -> Option<usize> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        let mut dropped = 0;
        while state.events.len() >= self.max_size {
            state.events.pop_front();
            dropped += 1;
        }
        state.events.push_back(event);
        Some(dropped)
    }

    /// Reject every later push. Events already queued stay until drained.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
    }

    /// Take every queued event.
    pub(crate) fn drain(&self) -> Vec<StatsigEvent> {
        self.lock().events.drain(..).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().events.len()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::user::LoggableUser;

    fn event(name: &str) -> StatsigEvent {
        StatsigEvent::custom(LoggableUser::default(), name, None, None)
    }

    #[test]
    fn drains_in_order() {
        let queue = EventQueue::new(10);
        queue.push(event("a"));
        queue.push(event("b"));

        let names: Vec<_> = queue.drain().into_iter().map(|e| e.event_name).collect();

        assert_eq!(names, ["a", "b"]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn drops_oldest_when_full() {
        let queue = EventQueue::new(2);
        assert_eq!(queue.push(event("a")), Some(0));
        assert_eq!(queue.push(event("b")), Some(0));
        assert_eq!(queue.push(event("c")), Some(1));

        let names: Vec<_> = queue.drain().into_iter().map(|e| e.event_name).collect();
        assert_eq!(names, ["b", "c"]);
    }

    #[test]
    fn closed_queue_rejects_pushes_but_drains() {
        let queue = EventQueue::new(10);
        queue.push(event("a"));
        queue.close();

        assert_eq!(queue.push(event("b")), None);
        assert_eq!(queue.len(), 1);
        let names: Vec<_> = queue.drain().into_iter().map(|e| e.event_name).collect();
        assert_eq!(names, ["a"]);
        assert_eq!(queue.push(event("c")), None);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn zero_size_is_clamped() {
        let queue = EventQueue::new(0);
        queue.push(StatsigEvent::custom(
            LoggableUser::default(),
            "a",
            None,
            Some(HashMap::new()),
        ));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.max_size(), 1);
    }
}
