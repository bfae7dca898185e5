#![forbid(unsafe_code)]

//! Parked deliveries for paced subscriptions.
//!
//! A paced subscription does not call its callback from the notification
//! path. Instead the latest value is parked here and handed out by
//! [`Runtime::flush_timers`](super::Runtime::flush_timers) once due:
//!
//! - **Debounce** (`delay`): every new value restarts the window; only the
//!   last value of a burst is delivered.
//! - **Throttle** (`buffer`): the window opens on the first value and is not
//!   extended; the latest value seen when it closes is delivered.

use std::fmt;

use slotmap::SlotMap;
use web_time::{Duration, Instant};

use super::runtime::Callback;
use crate::value::Stored;

slotmap::new_key_type! {
    pub(crate) struct TimerId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pacing {
    Debounce(Duration),
    Throttle(Duration),
}

pub(crate) struct Parked {
    pacing: Pacing,
    due: Option<Instant>,
    value: Option<Stored>,
    callback: Callback,
    source: String,
}

impl fmt::Debug for Parked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parked")
            .field("pacing", &self.pacing)
            .field("due", &self.due)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    entries: SlotMap<TimerId, Parked>,
}

impl TimerQueue {
    pub(crate) fn register(&mut self, pacing: Pacing, callback: Callback, source: String) -> TimerId {
        self.entries.insert(Parked {
            pacing,
            due: None,
            value: None,
            callback,
            source,
        })
    }

    /// Park `value`, opening or extending the window as the pacing dictates.
    pub(crate) fn park(&mut self, id: TimerId, value: Stored, now: Instant) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        entry.value = Some(value);
        entry.due = match (entry.pacing, entry.due) {
            (Pacing::Debounce(window), _) => Some(now + window),
            (Pacing::Throttle(_), Some(due)) => Some(due),
            (Pacing::Throttle(window), None) => Some(now + window),
        };
    }

    pub(crate) fn remove(&mut self, id: TimerId) -> Option<Parked> {
        self.entries.remove(id)
    }

    /// Take every parked value whose window has closed.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<(Callback, Stored, String)> {
        let mut due: Vec<(Instant, Callback, Stored, String)> = Vec::new();
        for entry in self.entries.values_mut() {
            let Some(at) = entry.due else { continue };
            if at > now {
                continue;
            }
            entry.due = None;
            if let Some(value) = entry.value.take() {
                due.push((at, entry.callback.clone(), value, entry.source.clone()));
            }
        }
        due.sort_by_key(|(at, ..)| *at);
        due.into_iter()
            .map(|(_, callback, value, source)| (callback, value, source))
            .collect()
    }

    pub(crate) fn pending(&self) -> usize {
        self.entries.values().filter(|e| e.due.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Plain, Value};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn num(n: i32) -> Stored {
        Stored::Plain(Plain::from(n))
    }

    fn sink() -> (Rc<RefCell<Vec<Value>>>, Callback) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        (seen, Rc::new(move |v: &Value| s.borrow_mut().push(v.clone())))
    }

    #[test]
    fn debounce_keeps_only_the_last_value() {
        let mut queue = TimerQueue::default();
        let (_, cb) = sink();
        let id = queue.register(Pacing::Debounce(Duration::from_millis(10)), cb, "a".into());
        let t0 = Instant::now();
        queue.park(id, num(1), t0);
        queue.park(id, num(2), t0 + Duration::from_millis(5));
        assert!(queue.take_due(t0 + Duration::from_millis(12)).is_empty());
        let due = queue.take_due(t0 + Duration::from_millis(15));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, num(2));
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn throttle_window_is_not_extended() {
        let mut queue = TimerQueue::default();
        let (_, cb) = sink();
        let id = queue.register(Pacing::Throttle(Duration::from_millis(10)), cb, "a".into());
        let t0 = Instant::now();
        queue.park(id, num(1), t0);
        queue.park(id, num(2), t0 + Duration::from_millis(8));
        let due = queue.take_due(t0 + Duration::from_millis(10));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, num(2));
    }

    #[test]
    fn removed_timers_never_fire() {
        let mut queue = TimerQueue::default();
        let (_, cb) = sink();
        let id = queue.register(Pacing::Debounce(Duration::ZERO), cb, "a".into());
        let now = Instant::now();
        queue.park(id, num(1), now);
        assert_eq!(queue.pending(), 1);
        assert!(queue.remove(id).is_some());
        assert!(queue.take_due(now).is_empty());
    }
}
