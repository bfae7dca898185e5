#![forbid(unsafe_code)]

//! Subscription guards and options.
//!
//! Every `subscribe`/`on`/`on_validation_change` call returns a
//! [`Subscription`]. Dropping it (or calling [`Subscription::unsubscribe`])
//! removes the callback, cancels any parked paced delivery, and disposes the
//! path attribute the subscription created, if any.

use std::fmt;
use std::rc::{Rc, Weak};

use web_time::Duration;

use super::runtime::{Callback, RuntimeInner};
use super::timers::{Pacing, TimerId};
use crate::attribute::{self, AttrId};
use crate::state::{self, StateId};
use crate::value::{Stored, Value};

/// How a callback is delivered.
///
/// `immediate` (default `true`) fires the callback synchronously with the
/// current value at subscribe time. `delay` debounces and `buffer`
/// throttles later deliveries; when both are set, `delay` wins. Paced
/// values are delivered by [`Runtime::flush_timers`](super::Runtime::flush_timers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SubscribeOptions {
    pub immediate: bool,
    pub buffer: Option<Duration>,
    pub delay: Option<Duration>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            immediate: true,
            buffer: None,
            delay: None,
        }
    }
}

impl SubscribeOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Options that skip the initial synchronous delivery.
    #[must_use]
    pub fn deferred() -> Self {
        Self {
            immediate: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    #[must_use]
    pub fn buffer(mut self, window: Duration) -> Self {
        self.buffer = Some(window);
        self
    }

    #[must_use]
    pub fn delay(mut self, window: Duration) -> Self {
        self.delay = Some(window);
        self
    }

    pub(crate) fn pacing(&self) -> Option<Pacing> {
        match (self.delay, self.buffer) {
            (Some(window), _) => Some(Pacing::Debounce(window)),
            (None, Some(window)) => Some(Pacing::Throttle(window)),
            (None, None) => None,
        }
    }
}

/// Wrap `callback` so that deliveries are parked in the timer queue.
/// Returns the callback to register plus the timer that owns the original.
pub(crate) fn pace(
    rt: &Rc<RuntimeInner>,
    callback: Callback,
    options: &SubscribeOptions,
    source: &str,
) -> (Callback, Option<TimerId>) {
    let Some(pacing) = options.pacing() else {
        return (callback, None);
    };
    let timer = rt
        .timers
        .borrow_mut()
        .register(pacing, callback, source.to_string());
    let weak = Rc::downgrade(rt);
    let parked: Callback = Rc::new(move |value: &Value| {
        if let Some(rt) = weak.upgrade() {
            let now = rt.config.clock.now();
            rt.timers
                .borrow_mut()
                .park(timer, Stored::capture(&rt, value), now);
        }
    });
    (parked, Some(timer))
}

pub(crate) enum Target {
    Attr { attr: AttrId, id: u64 },
    Validation { state: StateId, id: u64 },
    Released,
}

/// RAII guard for a registered callback.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    runtime: Weak<RuntimeInner>,
    target: Target,
    owned: Option<AttrId>,
    timer: Option<TimerId>,
}

impl Subscription {
    pub(crate) fn attr(rt: &Rc<RuntimeInner>, attr: AttrId, id: u64, timer: Option<TimerId>) -> Self {
        Self {
            runtime: Rc::downgrade(rt),
            target: Target::Attr { attr, id },
            owned: None,
            timer,
        }
    }

    pub(crate) fn validation(rt: &Rc<RuntimeInner>, state: StateId, id: u64) -> Self {
        Self {
            runtime: Rc::downgrade(rt),
            target: Target::Validation { state, id },
            owned: None,
            timer: None,
        }
    }

    /// Dispose `attr` together with this subscription.
    pub(crate) fn owning(mut self, attr: AttrId) -> Self {
        self.owned = Some(attr);
        self
    }

    /// Remove the callback now. Equivalent to dropping the guard.
    pub fn unsubscribe(self) {}

    /// Whether the callback is still registered.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let Some(rt) = self.runtime.upgrade() else {
            return false;
        };
        let arena = rt.arena.borrow();
        match self.target {
            Target::Attr { attr, id } => arena
                .attrs
                .get(attr)
                .is_some_and(|n| n.subscribers.iter().any(|s| s.id == id)),
            Target::Validation { state, id } => arena
                .states
                .get(state)
                .is_some_and(|n| n.listeners.iter().any(|l| l.id == id)),
            Target::Released => false,
        }
    }

    fn release(&mut self) {
        let target = std::mem::replace(&mut self.target, Target::Released);
        let Some(rt) = self.runtime.upgrade() else {
            return;
        };
        match target {
            Target::Attr { attr, id } => rt.remove_subscriber(attr, id),
            Target::Validation { state, id } => state::validation::remove_listener(&rt, state, id),
            Target::Released => {}
        }
        if let Some(timer) = self.timer.take() {
            let parked = rt.timers.borrow_mut().remove(timer);
            drop(parked);
        }
        if let Some(owned) = self.owned.take() {
            attribute::dispose(&rt, owned);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match self.target {
            Target::Attr { .. } => "attr",
            Target::Validation { .. } => "validation",
            Target::Released => "released",
        };
        f.debug_struct("Subscription")
            .field("target", &target)
            .field("paced", &self.timer.is_some())
            .field("owns_path", &self.owned.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_wins_over_buffer() {
        let opts = SubscribeOptions::new()
            .buffer(Duration::from_millis(5))
            .delay(Duration::from_millis(20));
        assert_eq!(opts.pacing(), Some(Pacing::Debounce(Duration::from_millis(20))));
        assert_eq!(
            SubscribeOptions::new().buffer(Duration::from_millis(5)).pacing(),
            Some(Pacing::Throttle(Duration::from_millis(5)))
        );
        assert_eq!(SubscribeOptions::new().pacing(), None);
    }

    #[test]
    fn defaults_are_immediate() {
        assert!(SubscribeOptions::default().immediate);
        assert!(!SubscribeOptions::deferred().immediate);
    }
}
