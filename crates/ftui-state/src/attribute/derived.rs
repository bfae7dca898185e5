#![forbid(unsafe_code)]

//! Derived values with automatic dependency discovery.
//!
//! # Design
//!
//! A derived attribute holds a compute function and its cached result. The
//! first read (or subscription) runs the function inside a recording
//! collector frame; every attribute read during that run becomes a
//! dependency and receives a non-immediate subscription whose callback
//! triggers the next recompute.
//!
//! Each recompute first releases the previous dependency subscriptions, so
//! the dependency set is always exactly what the latest run read.
//! Conditionally-read dependencies drop out on their own.
//!
//! # Invariants
//!
//! 1. After initialization the cached value is always current: recompute is
//!    eager and synchronous on every dependency emission.
//! 2. Subscribers are notified only when the recomputed value differs from
//!    the cached one. The initializing compute notifies nobody.
//! 3. `version` increments by exactly 1 per successful recomputation.
//!
//! # Failure Modes
//!
//! - **Compute fails or panics**: the cached value is kept, the failure is
//!   reported as [`Diagnostic::ComputeFailed`](crate::Diagnostic), and the
//!   dependencies read before the failure stay subscribed so a later change
//!   retries.
//! - **Self-dependency**: reading the attribute from inside its own compute
//!   (directly or through another derived value) yields
//!   [`StateError::Cycle`] instead of recursing.

use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use tracing::{trace, warn};

use super::{AttrId, Slot};
use crate::error::{Result, StateError};
use crate::reactive::Diagnostic;
use crate::reactive::diagnostics::panic_message;
use crate::reactive::runtime::{Callback, RuntimeInner};
use crate::state::{State, StateId};
use crate::value::{Stored, Value};

pub(crate) type ContainerFn = Rc<dyn Fn(&State) -> Result<Value>>;

#[derive(Clone)]
pub(crate) enum ComputeFn {
    /// User function over the owning container.
    Container(ContainerFn),
    /// Key list of a map node.
    MapKeys(AttrId),
    /// Entry count of a map node.
    MapSize(AttrId),
}

pub(crate) struct DerivedNode {
    pub(crate) compute: ComputeFn,
    /// `None` until the first successful compute.
    value: Option<Stored>,
    deps: Vec<(AttrId, u64)>,
    computing: bool,
    version: u64,
}

impl DerivedNode {
    pub(crate) fn new(compute: ComputeFn) -> Self {
        Self {
            compute,
            value: None,
            deps: Vec::new(),
            computing: false,
            version: 0,
        }
    }
}

fn evaluate(
    rt: &Rc<RuntimeInner>,
    compute: &ComputeFn,
    owner: Option<StateId>,
    key: &str,
) -> Result<Value> {
    match compute {
        ComputeFn::Container(f) => {
            let owner = owner.ok_or(StateError::Disposed)?;
            let state = State::from_parts(Rc::clone(rt), owner);
            match panic::catch_unwind(AssertUnwindSafe(|| f(&state))) {
                Ok(result) => result,
                Err(payload) => Err(StateError::Compute {
                    key: key.to_string(),
                    message: panic_message(payload.as_ref()),
                }),
            }
        }
        ComputeFn::MapKeys(map) => super::map::keys_value(rt, *map),
        ComputeFn::MapSize(map) => super::map::size_value(rt, *map),
    }
}

/// Recompute `id`. `Ok(true)` if an initialized value changed.
pub(crate) fn recompute(rt: &Rc<RuntimeInner>, id: AttrId) -> Result<bool> {
    let (compute, old_deps, owner, key) = {
        let mut arena = rt.arena.borrow_mut();
        let node = arena.attrs.get_mut(id).ok_or(StateError::Disposed)?;
        let key = node.key.clone();
        let owner = node.owner;
        let Slot::Derived(d) = &mut node.slot else {
            return Ok(false);
        };
        if d.computing {
            return Err(StateError::Cycle { key });
        }
        d.computing = true;
        (d.compute.clone(), std::mem::take(&mut d.deps), owner, key)
    };

    for (dep, sub) in old_deps {
        rt.remove_subscriber(dep, sub);
    }

    let (result, deps) = rt.record(|| evaluate(rt, &compute, owner, &key));

    let mut subscribed = Vec::with_capacity(deps.len());
    for dep in deps {
        if dep == id {
            continue;
        }
        let weak = Rc::downgrade(rt);
        let callback: Callback = Rc::new(move |_: &Value| {
            if let Some(rt) = weak.upgrade() {
                on_dependency_change(&rt, id);
            }
        });
        if let Ok(sub) = rt.add_subscriber(dep, callback) {
            subscribed.push((dep, sub));
        }
    }

    let mut arena = rt.arena.borrow_mut();
    let Some(Slot::Derived(d)) = arena.attrs.get_mut(id).map(|n| &mut n.slot) else {
        drop(arena);
        for (dep, sub) in subscribed {
            rt.remove_subscriber(dep, sub);
        }
        return Err(StateError::Disposed);
    };
    d.computing = false;
    d.deps = subscribed;
    let value = Stored::capture(rt, &result?);
    let changed = d.value.as_ref().is_some_and(|old| *old != value);
    d.version += 1;
    trace!(attr = %key, version = d.version, deps = d.deps.len(), changed, "state.derived.recompute");
    d.value = Some(value);
    Ok(changed)
}

fn on_dependency_change(rt: &Rc<RuntimeInner>, id: AttrId) {
    match recompute(rt, id) {
        Ok(true) => rt.enqueue(id),
        Ok(false) => {}
        Err(StateError::Disposed) => {}
        Err(error) => {
            let key = rt.key_of(id);
            warn!(attr = %key, %error, "state.derived.failed");
            rt.report(Diagnostic::ComputeFailed { key, error });
        }
    }
}

pub(crate) fn current(rt: &Rc<RuntimeInner>, id: AttrId) -> Result<Value> {
    let cached = {
        let arena = rt.arena.borrow();
        let node = arena.attrs.get(id).ok_or(StateError::Disposed)?;
        let Slot::Derived(d) = &node.slot else {
            return Err(StateError::Disposed);
        };
        if d.computing {
            return Err(StateError::Cycle {
                key: node.key.clone(),
            });
        }
        d.value.as_ref().map(|value| value.load(rt))
    };
    if let Some(value) = cached {
        return Ok(value);
    }
    recompute(rt, id)?;
    let arena = rt.arena.borrow();
    match arena.attrs.get(id).map(|n| &n.slot) {
        Some(Slot::Derived(d)) => d
            .value
            .as_ref()
            .map(|value| value.load(rt))
            .ok_or(StateError::Disposed),
        _ => Err(StateError::Disposed),
    }
}

pub(crate) fn teardown(rt: &Rc<RuntimeInner>, node: DerivedNode) {
    for (dep, sub) in node.deps {
        rt.remove_subscriber(dep, sub);
    }
}
