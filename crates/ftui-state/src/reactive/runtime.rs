#![forbid(unsafe_code)]

//! Shared runtime: node arena, collector stack, batch queue.
//!
//! # Design
//!
//! Every container and attribute lives in a generational arena owned by
//! [`RuntimeInner`]. Public handles carry an `Rc<RuntimeInner>` plus a key;
//! closures stored inside the arena only ever hold `Weak` references, so the
//! arena is released with the last external handle.
//!
//! Dependency discovery uses a stack of collector [`Frame`]s. A read calls
//! [`RuntimeInner::collect`], which reports to the top frame only: nested
//! evaluations register with their own frame, never with the enclosing one.
//!
//! Notifications go through [`RuntimeInner::enqueue`]. Outside a batch the
//! attribute is delivered synchronously. Inside a batch it joins an
//! insertion-ordered set that is flushed once when the outermost batch
//! guard drops. The value is read at delivery time, so coalesced
//! notifications carry the final value.
//!
//! Synchronous delivery nests: a derived value recomputed by one delivery
//! enqueues its own. Past `max_notify_depth` nested levels the attribute is
//! parked in the pending set instead, and the outermost delivery drains it
//! as a flush before returning. Long acyclic chains therefore complete
//! without growing the stack further.
//!
//! # Invariants
//!
//! 1. No `RefCell` borrow of the arena is held while user code runs.
//! 2. Batch depth is restored on every exit path, including unwinding.
//! 3. Subscriber panics are caught per callback.
//!
//! # Failure Modes
//!
//! - **Runaway feedback**: a subscriber that writes to its own source keeps
//!   re-queueing the same attribute. A flush delivers any one attribute at
//!   most `max_flush_rounds` times; the next attempt drops the remaining
//!   queue and reports [`Diagnostic::NotifyOverrun`]. Chain length alone
//!   never trips the bound.
//! - **Panicking batch**: pending notifications are discarded rather than
//!   delivered from inside an unwinding frame.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use indexmap::IndexSet;
use slotmap::{SecondaryMap, SlotMap};
use tracing::{debug, trace, warn};

use super::clock::Clock;
use super::diagnostics::{Diagnostic, panic_message};
use super::timers::TimerQueue;
use crate::attribute::{self, Attr, AttrId, AttrNode};
use crate::error::{Result, StateError};
use crate::registry::Registry;
use crate::state::{StateId, StateNode, ValidationMode};
use crate::value::Value;

pub(crate) type Callback = Rc<dyn Fn(&Value)>;

pub(crate) struct Subscriber {
    pub(crate) id: u64,
    pub(crate) callback: Callback,
}

#[derive(Default)]
pub(crate) struct Arena {
    pub(crate) states: SlotMap<StateId, StateNode>,
    pub(crate) attrs: SlotMap<AttrId, AttrNode>,
}

/// One entry of the collector stack.
#[derive(Clone)]
pub(crate) enum Frame {
    /// Reads are not recorded.
    Untracked,
    /// Reads are recorded into a set (derived recompute, `track`).
    Record(Rc<RefCell<IndexSet<AttrId>>>),
    /// Reads are handed to a user callback (`run_with_collector`).
    Callback(Rc<RefCell<dyn FnMut(Attr)>>),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Runtime-wide settings.
#[derive(Clone)]
pub struct RuntimeConfig {
    pub validation_mode: ValidationMode,
    /// How often one attribute may be delivered within a single flush.
    pub max_flush_rounds: usize,
    /// Nesting of synchronous deliveries before further ones are queued.
    pub max_notify_depth: usize,
    pub clock: Clock,
    /// Registry used by containers that do not inject their own.
    /// `None` selects [`Registry::global`].
    pub registry: Option<Registry>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            validation_mode: ValidationMode::Report,
            max_flush_rounds: 32,
            max_notify_depth: 64,
            clock: Clock::System,
            registry: None,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn validation_mode(mut self, mode: ValidationMode) -> Self {
        self.validation_mode = mode;
        self
    }

    #[must_use]
    pub fn max_flush_rounds(mut self, rounds: usize) -> Self {
        self.max_flush_rounds = rounds.max(1);
        self
    }

    #[must_use]
    pub fn max_notify_depth(mut self, depth: usize) -> Self {
        self.max_notify_depth = depth.max(1);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }
}

impl fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("validation_mode", &self.validation_mode)
            .field("max_flush_rounds", &self.max_flush_rounds)
            .field("max_notify_depth", &self.max_notify_depth)
            .field("clock", &self.clock)
            .field("registry", &self.registry.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Inner runtime
// ---------------------------------------------------------------------------

pub(crate) struct RuntimeInner {
    pub(crate) arena: RefCell<Arena>,
    pub(crate) config: RuntimeConfig,
    pub(crate) registry: Registry,
    pub(crate) timers: RefCell<TimerQueue>,
    frames: RefCell<Vec<Frame>>,
    batch_depth: Cell<usize>,
    notify_depth: Cell<usize>,
    pending: RefCell<IndexSet<AttrId>>,
    next_subscriber: Cell<u64>,
    hook: RefCell<Option<Rc<dyn Fn(&Diagnostic)>>>,
}

struct FrameGuard<'a> {
    frames: &'a RefCell<Vec<Frame>>,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.frames.borrow_mut().pop();
    }
}

pub(crate) struct BatchGuard<'a> {
    rt: &'a Rc<RuntimeInner>,
}

impl<'a> BatchGuard<'a> {
    pub(crate) fn enter(rt: &'a Rc<RuntimeInner>) -> Self {
        rt.batch_depth.set(rt.batch_depth.get() + 1);
        Self { rt }
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let depth = self.rt.batch_depth.get().saturating_sub(1);
        self.rt.batch_depth.set(depth);
        if depth > 0 {
            return;
        }
        if std::thread::panicking() {
            let dropped = std::mem::take(&mut *self.rt.pending.borrow_mut());
            if !dropped.is_empty() {
                warn!(dropped = dropped.len(), "state.batch.abandoned");
            }
        } else {
            self.rt.flush();
        }
    }
}

struct DepthGuard<'a> {
    depth: &'a Cell<usize>,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }
}

impl RuntimeInner {
    fn new(config: RuntimeConfig) -> Self {
        let registry = config.registry.clone().unwrap_or_else(Registry::global);
        Self {
            arena: RefCell::new(Arena::default()),
            config,
            registry,
            timers: RefCell::new(TimerQueue::default()),
            frames: RefCell::new(Vec::new()),
            batch_depth: Cell::new(0),
            notify_depth: Cell::new(0),
            pending: RefCell::new(IndexSet::new()),
            next_subscriber: Cell::new(1),
            hook: RefCell::new(None),
        }
    }

    /// Run `f` with `frame` on top of the collector stack.
    pub(crate) fn with_frame<R>(&self, frame: Frame, f: impl FnOnce() -> R) -> R {
        self.frames.borrow_mut().push(frame);
        let _guard = FrameGuard {
            frames: &self.frames,
        };
        f()
    }

    pub(crate) fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.with_frame(Frame::Untracked, f)
    }

    /// Run `f` and return the set of attributes it read.
    pub(crate) fn record<R>(&self, f: impl FnOnce() -> R) -> (R, IndexSet<AttrId>) {
        let set = Rc::new(RefCell::new(IndexSet::new()));
        let out = self.with_frame(Frame::Record(Rc::clone(&set)), f);
        let deps = std::mem::take(&mut *set.borrow_mut());
        (out, deps)
    }

    /// Report a read to the innermost collector.
    pub(crate) fn collect(self: &Rc<Self>, id: AttrId) {
        let top = self.frames.borrow().last().cloned();
        match top {
            Some(Frame::Record(set)) => {
                set.borrow_mut().insert(id);
            }
            Some(Frame::Callback(register)) => {
                // A register callback that reads state re-enters here; those
                // nested reads are not reported back to it.
                if let Ok(mut register) = register.try_borrow_mut() {
                    (*register)(Attr::from_parts(Rc::clone(self), id));
                }
            }
            Some(Frame::Untracked) | None => {}
        }
    }

    pub(crate) fn in_batch(&self) -> bool {
        self.batch_depth.get() > 0
    }

    /// Notify subscribers of `id`, now or at batch exit.
    pub(crate) fn enqueue(self: &Rc<Self>, id: AttrId) {
        let depth = self.notify_depth.get();
        if self.in_batch() || depth >= self.config.max_notify_depth {
            self.pending.borrow_mut().insert(id);
            return;
        }
        self.deliver(id);
        if depth == 0 {
            // Deliveries parked by nested levels.
            self.flush();
        }
    }

    fn flush(self: &Rc<Self>) {
        if self.pending.borrow().is_empty() {
            return;
        }
        // Writes made by subscribers during the flush coalesce into the
        // next round.
        self.batch_depth.set(self.batch_depth.get() + 1);
        let _flushing = DepthGuard {
            depth: &self.batch_depth,
        };
        let limit = self.config.max_flush_rounds;
        let mut delivered: SecondaryMap<AttrId, usize> = SecondaryMap::new();
        let mut round = 0usize;
        loop {
            let queued: Vec<AttrId> = self.pending.borrow_mut().drain(..).collect();
            if queued.is_empty() {
                break;
            }
            round += 1;
            let looping = queued
                .iter()
                .copied()
                .find(|id| delivered.get(*id).is_some_and(|count| *count >= limit));
            if let Some(id) = looping {
                let key = self.key_of(id);
                warn!(attr = %key, round, dropped = queued.len(), "state.batch.overrun");
                self.report(Diagnostic::NotifyOverrun { key, depth: limit });
                break;
            }
            debug!(count = queued.len(), round, "state.batch.flush");
            for id in queued {
                match delivered.get_mut(id) {
                    Some(count) => *count += 1,
                    None => {
                        delivered.insert(id, 1);
                    }
                }
                self.deliver(id);
            }
        }
    }

    /// Deliver the current value of `id` to each of its subscribers.
    pub(crate) fn deliver(self: &Rc<Self>, id: AttrId) {
        let (key, callbacks) = {
            let arena = self.arena.borrow();
            let Some(node) = arena.attrs.get(id) else {
                return;
            };
            if node.subscribers.is_empty() {
                return;
            }
            let callbacks: Vec<Callback> = node
                .subscribers
                .iter()
                .map(|s| Rc::clone(&s.callback))
                .collect();
            (node.key.clone(), callbacks)
        };

        self.notify_depth.set(self.notify_depth.get() + 1);
        let _depth = DepthGuard {
            depth: &self.notify_depth,
        };

        let value = match self.untracked(|| attribute::current(self, id)) {
            Ok(value) => value,
            Err(error) => {
                warn!(attr = %key, %error, "state.notify.unreadable");
                self.report(Diagnostic::DeliveryFailed { key, error });
                return;
            }
        };
        trace!(attr = %key, subscribers = callbacks.len(), "state.notify");
        for callback in callbacks {
            self.untracked(|| self.guarded(&key, || callback(&value)));
        }
    }

    /// Run user code, converting a panic into a diagnostic.
    pub(crate) fn guarded(&self, source: &str, f: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
            let message = panic_message(payload.as_ref());
            warn!(source, %message, "state.subscriber.panicked");
            self.report(Diagnostic::SubscriberPanicked {
                source: source.to_string(),
                message,
            });
        }
    }

    pub(crate) fn report(&self, diagnostic: Diagnostic) {
        let hook = self.hook.borrow().clone();
        if let Some(hook) = hook {
            // A panicking hook must not take delivery down with it.
            let _ = panic::catch_unwind(AssertUnwindSafe(|| hook(&diagnostic)));
        }
    }

    pub(crate) fn next_subscriber_id(&self) -> u64 {
        let id = self.next_subscriber.get();
        self.next_subscriber.set(id + 1);
        id
    }

    pub(crate) fn add_subscriber(&self, id: AttrId, callback: Callback) -> Result<u64> {
        let sub = self.next_subscriber_id();
        let mut arena = self.arena.borrow_mut();
        let node = arena.attrs.get_mut(id).ok_or(StateError::Disposed)?;
        node.subscribers.push(Subscriber { id: sub, callback });
        Ok(sub)
    }

    pub(crate) fn remove_subscriber(&self, id: AttrId, sub: u64) {
        // The callback may own handles whose drop re-enters the arena, so it
        // is released after the borrow ends.
        let removed = {
            let mut arena = self.arena.borrow_mut();
            arena.attrs.get_mut(id).and_then(|node| {
                node.subscribers
                    .iter()
                    .position(|s| s.id == sub)
                    .map(|pos| node.subscribers.remove(pos))
            })
        };
        drop(removed);
    }

    pub(crate) fn key_of(&self, id: AttrId) -> String {
        self.arena
            .borrow()
            .attrs
            .get(id)
            .map(|n| n.key.clone())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Shared single-threaded runtime.
///
/// Cloning is cheap; clones refer to the same arena.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Rc<RuntimeInner>,
}

impl Runtime {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    #[must_use]
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            inner: Rc::new(RuntimeInner::new(config)),
        }
    }

    pub(crate) fn from_inner(inner: Rc<RuntimeInner>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The registry containers of this runtime resolve aliases against.
    #[must_use]
    pub fn registry(&self) -> Registry {
        self.inner.registry.clone()
    }

    /// Run `f` with notifications deferred until the outermost batch exits.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let _batch = BatchGuard::enter(&self.inner);
        f()
    }

    #[must_use]
    pub fn in_batch(&self) -> bool {
        self.inner.in_batch()
    }

    /// Run `f`, handing every attribute read during it to `register`.
    ///
    /// Reads performed inside nested collectors (for example a derived
    /// attribute recomputing) are reported to those collectors instead.
    pub fn run_with_collector<R>(
        &self,
        register: impl FnMut(Attr) + 'static,
        f: impl FnOnce() -> R,
    ) -> R {
        let register: Rc<RefCell<dyn FnMut(Attr)>> = Rc::new(RefCell::new(register));
        self.inner.with_frame(Frame::Callback(register), f)
    }

    /// Run `f` without reporting reads to any collector.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.untracked(f)
    }

    /// Report `attr` to the innermost collector, as a read would.
    pub fn collect(&self, attr: &Attr) {
        self.inner.collect(attr.id);
    }

    /// Install a hook receiving every swallowed failure.
    pub fn set_diagnostic_hook(&self, hook: impl Fn(&Diagnostic) + 'static) {
        *self.inner.hook.borrow_mut() = Some(Rc::new(hook));
    }

    pub fn clear_diagnostic_hook(&self) {
        self.inner.hook.borrow_mut().take();
    }

    /// Deliver every paced notification whose window has elapsed.
    /// Returns the number of callbacks invoked.
    pub fn flush_timers(&self) -> usize {
        let now = self.inner.config.clock.now();
        let due = self.inner.timers.borrow_mut().take_due(now);
        let count = due.len();
        if count > 0 {
            debug!(count, "state.timers.flush");
        }
        for (callback, parked, source) in due {
            let value = parked.load(&self.inner);
            self.inner
                .untracked(|| self.inner.guarded(&source, || callback(&value)));
        }
        count
    }

    /// Number of paced notifications waiting for their window.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.borrow().pending()
    }

    /// Live `(containers, attributes)` in the arena.
    #[must_use]
    pub fn node_counts(&self) -> (usize, usize) {
        let arena = self.inner.arena.borrow();
        (arena.states.len(), arena.attrs.len())
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (states, attrs) = self.node_counts();
        f.debug_struct("Runtime")
            .field("states", &states)
            .field("attrs", &attrs)
            .field("batch_depth", &self.inner.batch_depth.get())
            .finish()
    }
}
