#![forbid(unsafe_code)]

//! Path attributes: one observable for a multi-segment address.
//!
//! # Design
//!
//! A path attribute is wired lazily on first read. Wiring walks the path,
//! subscribes to every intermediate link and, when the walk ends in a
//! concrete attribute, to that leaf as well. A terminal index or key has no
//! leaf of its own: the collection it addresses is already a link, and its
//! structural emissions cover the element.
//!
//! - A link emission **rewires**: old subscriptions are released, the path
//!   is walked again, fresh subscriptions are taken.
//! - Any emission then compares the current value with the last one
//!   delivered and notifies only on change, so a link and a leaf changing
//!   together produce a single notification.
//!
//! # Failure Modes
//!
//! - The first wiring fails with the walk's error and is retried on the
//!   next read.
//! - A later rewire that fails (say `user` was set to null) is reported as
//!   [`Diagnostic::RewireFailed`](crate::Diagnostic). The attribute then
//!   reads null and stays subscribed to the links it did reach, so
//!   repairing the chain rewires it.

use std::rc::Rc;

use tracing::{trace, warn};

use super::{AttrId, AttrNode, Slot};
use crate::error::{Result, StateError};
use crate::path::ParsedPath;
use crate::path::resolve::{self, FinalTarget, WalkOptions};
use crate::reactive::Diagnostic;
use crate::reactive::runtime::{Callback, RuntimeInner};
use crate::state::StateId;
use crate::value::{Stored, Value};

struct Wiring {
    target: Option<FinalTarget>,
    links: Vec<(AttrId, u64)>,
    leaf: Option<(AttrId, u64)>,
}

pub(crate) struct PathNode {
    owner: StateId,
    parsed: ParsedPath,
    skip: Option<AttrId>,
    wiring: Option<Wiring>,
    /// Value most recently announced to subscribers.
    last: Option<Stored>,
}

pub(crate) fn create(
    rt: &Rc<RuntimeInner>,
    owner: StateId,
    parsed: ParsedPath,
    skip: Option<AttrId>,
) -> Result<AttrId> {
    if !rt.arena.borrow().states.contains_key(owner) {
        return Err(StateError::Disposed);
    }
    let key = parsed.to_string();
    let node = PathNode {
        owner,
        parsed,
        skip,
        wiring: None,
        last: None,
    };
    Ok(super::insert(rt, AttrNode::new(key, Some(owner), Slot::Path(node))))
}

fn release(rt: &Rc<RuntimeInner>, wiring: Wiring) {
    for (link, sub) in wiring.links {
        rt.remove_subscriber(link, sub);
    }
    if let Some((leaf, sub)) = wiring.leaf {
        rt.remove_subscriber(leaf, sub);
    }
}

fn callback(rt: &Rc<RuntimeInner>, id: AttrId, rewire: bool) -> Callback {
    let weak = Rc::downgrade(rt);
    Rc::new(move |_: &Value| {
        if let Some(rt) = weak.upgrade() {
            if rewire {
                on_link_change(&rt, id);
            } else {
                announce(&rt, id);
            }
        }
    })
}

/// Walk again and replace the subscription chain. The new wiring is stored
/// even when the walk fails.
fn rewire(rt: &Rc<RuntimeInner>, id: AttrId) -> Result<FinalTarget> {
    let (owner, parsed, skip, old) = {
        let mut arena = rt.arena.borrow_mut();
        let Some(Slot::Path(node)) = arena.attrs.get_mut(id).map(|n| &mut n.slot) else {
            return Err(StateError::Disposed);
        };
        (node.owner, node.parsed.clone(), node.skip, node.wiring.take())
    };
    if let Some(old) = old {
        release(rt, old);
    }

    let walk = rt.untracked(|| {
        resolve::walk(
            rt,
            owner,
            &parsed,
            WalkOptions {
                skip,
                ..WalkOptions::default()
            },
        )
    });
    let links = walk
        .links
        .iter()
        .filter_map(|&link| {
            rt.add_subscriber(link, callback(rt, id, true))
                .ok()
                .map(|sub| (link, sub))
        })
        .collect();
    let leaf = match &walk.outcome {
        Ok(FinalTarget::Attr(leaf)) => rt
            .add_subscriber(*leaf, callback(rt, id, false))
            .ok()
            .map(|sub| (*leaf, sub)),
        _ => None,
    };
    let wiring = Wiring {
        target: walk.outcome.as_ref().ok().cloned(),
        links,
        leaf,
    };
    trace!(
        path = %parsed,
        links = wiring.links.len(),
        ok = wiring.target.is_some(),
        "state.path.rewire"
    );

    let mut arena = rt.arena.borrow_mut();
    match arena.attrs.get_mut(id).map(|n| &mut n.slot) {
        Some(Slot::Path(node)) => node.wiring = Some(wiring),
        _ => {
            drop(arena);
            release(rt, wiring);
            return Err(StateError::Disposed);
        }
    }
    walk.outcome
}

fn unwire(rt: &Rc<RuntimeInner>, id: AttrId) {
    let old = match rt.arena.borrow_mut().attrs.get_mut(id).map(|n| &mut n.slot) {
        Some(Slot::Path(node)) => node.wiring.take(),
        _ => None,
    };
    if let Some(old) = old {
        release(rt, old);
    }
}

/// Wired target; `None` when the last rewire broke the chain.
fn ensure(rt: &Rc<RuntimeInner>, id: AttrId) -> Result<Option<FinalTarget>> {
    let wired = {
        let arena = rt.arena.borrow();
        match arena.attrs.get(id).map(|n| &n.slot) {
            Some(Slot::Path(node)) => node.wiring.as_ref().map(|w| w.target.clone()),
            _ => return Err(StateError::Disposed),
        }
    };
    if let Some(target) = wired {
        return Ok(target);
    }
    let target = match rewire(rt, id) {
        Ok(target) => target,
        Err(err) => {
            unwire(rt, id);
            return Err(err);
        }
    };
    let value = Stored::capture(rt, &target.current(rt)?);
    if let Some(Slot::Path(node)) = rt.arena.borrow_mut().attrs.get_mut(id).map(|n| &mut n.slot) {
        node.last = Some(value);
    }
    Ok(Some(target))
}

fn on_link_change(rt: &Rc<RuntimeInner>, id: AttrId) {
    match rewire(rt, id) {
        Ok(_) => {}
        Err(StateError::Disposed) => return,
        Err(error) => {
            let key = rt.key_of(id);
            warn!(path = %key, %error, "state.path.broken");
            rt.report(Diagnostic::RewireFailed { key, error });
        }
    }
    announce(rt, id);
}

/// Notify subscribers if the value moved since the last announcement.
fn announce(rt: &Rc<RuntimeInner>, id: AttrId) {
    let value = rt
        .untracked(|| current(rt, id))
        .map(|value| Stored::capture(rt, &value))
        .unwrap_or_default();
    let changed = {
        let mut arena = rt.arena.borrow_mut();
        let Some(Slot::Path(node)) = arena.attrs.get_mut(id).map(|n| &mut n.slot) else {
            return;
        };
        if node.last.as_ref() == Some(&value) {
            false
        } else {
            node.last = Some(value);
            true
        }
    };
    if changed {
        rt.enqueue(id);
    }
}

pub(crate) fn current(rt: &Rc<RuntimeInner>, id: AttrId) -> Result<Value> {
    match ensure(rt, id)? {
        Some(target) => target.current(rt),
        None => Ok(Value::null()),
    }
}

fn fresh(rt: &Rc<RuntimeInner>, id: AttrId) -> Result<FinalTarget> {
    let (owner, parsed, skip) = {
        let arena = rt.arena.borrow();
        match arena.attrs.get(id).map(|n| &n.slot) {
            Some(Slot::Path(node)) => (node.owner, node.parsed.clone(), node.skip),
            _ => return Err(StateError::Disposed),
        }
    };
    resolve::walk(
        rt,
        owner,
        &parsed,
        WalkOptions {
            skip,
            ..WalkOptions::default()
        },
    )
    .outcome
}

/// Writes resolve the path afresh so they land on the current chain.
pub(crate) fn set(rt: &Rc<RuntimeInner>, id: AttrId, value: Value) -> Result<()> {
    fresh(rt, id)?.write(rt, value)
}

pub(crate) fn is_writable(rt: &Rc<RuntimeInner>, id: AttrId) -> bool {
    fresh(rt, id).is_ok_and(|target| target.is_writable(rt))
}

pub(crate) fn teardown(rt: &Rc<RuntimeInner>, node: PathNode) {
    if let Some(wiring) = node.wiring {
        release(rt, wiring);
    }
}

#[cfg(test)]
mod tests {
    use crate::{Diagnostic, State, SubscribeOptions, Value};
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tracing_test::traced_test;

    fn watch(state: &State, path: &str) -> (Rc<RefCell<Vec<Value>>>, crate::Subscription) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let sub = state
            .on(path, move |v| s.borrow_mut().push(v.clone()), SubscribeOptions::deferred())
            .unwrap();
        (seen, sub)
    }

    #[test]
    fn rewires_on_every_replaced_link() {
        let state = State::new(json!({"user": {"address": {"city": "Rome"}}})).unwrap();
        let (seen, _sub) = watch(&state, "user.address.city");
        state.set("user.address.city", "Milan").unwrap();
        state.set("user", json!({"address": {"city": "Paris"}})).unwrap();
        state.set("user.address", json!({"city": "Berlin"})).unwrap();
        assert_eq!(
            *seen.borrow(),
            vec![Value::from("Milan"), Value::from("Paris"), Value::from("Berlin")]
        );
    }

    #[test]
    fn unchanged_leaf_after_rewire_is_silent() {
        let state = State::new(json!({"user": {"name": "Ada"}})).unwrap();
        let (seen, _sub) = watch(&state, "user.name");
        state.set("user", json!({"name": "Ada"})).unwrap();
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn terminal_index_emits_once_per_change() {
        let state = State::new(json!({"items": [1, 2]})).unwrap();
        let (seen, _sub) = watch(&state, "items[0]");
        state.set("items[0]", 5).unwrap();
        state.get_as::<crate::List>("items").unwrap().push(3).unwrap();
        assert_eq!(*seen.borrow(), vec![Value::from(5)]);
    }

    #[test]
    fn element_property_follows_replacement() {
        let state = State::new(json!({"items": [{"title": "a"}]})).unwrap();
        let (seen, _sub) = watch(&state, "items[0].title");
        let list = state.get_as::<crate::List>("items").unwrap();
        list.set(0, json!({"title": "b"})).unwrap();
        state.set("items[0].title", "c").unwrap();
        list.unshift(json!({"title": "d"})).unwrap();
        assert_eq!(
            *seen.borrow(),
            vec![Value::from("b"), Value::from("c"), Value::from("d")]
        );
    }

    #[test]
    fn broken_chain_reports_and_recovers() {
        let state = State::new(json!({"user": {"name": "Ada"}})).unwrap();
        let reports = Rc::new(RefCell::new(Vec::new()));
        let r = Rc::clone(&reports);
        state
            .runtime()
            .set_diagnostic_hook(move |d| r.borrow_mut().push(d.clone()));
        let (seen, _sub) = watch(&state, "user.name");
        state.set("user", Value::null()).unwrap();
        state.set("user", json!({"name": "Grace"})).unwrap();
        assert_eq!(*seen.borrow(), vec![Value::null(), Value::from("Grace")]);
        assert!(matches!(
            reports.borrow().as_slice(),
            [Diagnostic::RewireFailed { .. }]
        ));
    }

    #[test]
    #[traced_test]
    fn broken_chain_is_logged() {
        let state = State::new(json!({"user": {"name": "Ada"}})).unwrap();
        let (_seen, _sub) = watch(&state, "user.name");
        state.set("user", 5).unwrap();
        assert!(logs_contain("state.path.broken"));
        assert!(logs_contain("state.path.rewire"));
    }

    #[test]
    fn dropping_the_subscription_disposes_the_path() {
        let state = State::new(json!({"a": {"b": 1}})).unwrap();
        let before = state.runtime().node_counts();
        let (_seen, sub) = watch(&state, "a.b");
        drop(sub);
        assert_eq!(state.runtime().node_counts(), before);
    }

    #[test]
    fn unresolvable_path_fails_on_subscribe() {
        let state = State::new(json!({"a": 1})).unwrap();
        assert!(
            state
                .on("a.b", |_| {}, SubscribeOptions::default())
                .is_err()
        );
    }
}
