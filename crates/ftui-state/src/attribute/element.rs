#![forbid(unsafe_code)]

//! Virtual attributes addressing one element of a collection.
//!
//! An index attribute (`list[3]`) or key attribute (`map["k"]`) holds no
//! value of its own. It reads through to its collection and subscribes to
//! it, so any structural change of the collection re-emits the element's
//! current value. Writes go through the collection's own element setters.
//!
//! There is at most one live virtual per (collection, position) pair: repeat
//! lookups return the node created by the first one.

use std::rc::Rc;

use super::{AttrId, AttrNode, Slot};
use crate::error::{Result, StateError};
use crate::path::Token;
use crate::reactive::runtime::{Callback, RuntimeInner};
use crate::value::Value;

pub(crate) struct IndexNode {
    list: AttrId,
    index: usize,
    sub: u64,
}

pub(crate) struct MapKeyNode {
    map: AttrId,
    key: String,
    sub: u64,
}

fn forward(rt: &Rc<RuntimeInner>, id: AttrId) -> Callback {
    let weak = Rc::downgrade(rt);
    Rc::new(move |_: &Value| {
        if let Some(rt) = weak.upgrade() {
            rt.enqueue(id);
        }
    })
}

// ---------------------------------------------------------------------------
// Shared lookup
// ---------------------------------------------------------------------------

/// Index attribute for `list[index]`. Every request for the same position
/// gets the same node; the first one creates it and hands it to the list.
pub(crate) fn index_attr(rt: &Rc<RuntimeInner>, list: AttrId, index: usize) -> Result<AttrId> {
    let found = find_virtual(rt, list, |slot| matches!(slot, Slot::Index(n) if n.index == index));
    if let Some(id) = found {
        return Ok(id);
    }
    let id = create_index(rt, list, index)?;
    adopt(rt, list, id);
    Ok(id)
}

/// Key attribute for `map[key]`, shared like [`index_attr`].
pub(crate) fn key_attr(rt: &Rc<RuntimeInner>, map: AttrId, key: &str) -> Result<AttrId> {
    let found = find_virtual(rt, map, |slot| matches!(slot, Slot::MapKey(n) if n.key == key));
    if let Some(id) = found {
        return Ok(id);
    }
    let id = create_key(rt, map, key)?;
    adopt(rt, map, id);
    Ok(id)
}

fn find_virtual(
    rt: &Rc<RuntimeInner>,
    owner: AttrId,
    wanted: impl Fn(&Slot) -> bool,
) -> Option<AttrId> {
    let arena = rt.arena.borrow();
    arena
        .attrs
        .get(owner)?
        .virtuals
        .iter()
        .copied()
        .find(|v| arena.attrs.get(*v).is_some_and(|n| wanted(&n.slot)))
}

/// Register `id` with `owner`, dropping entries disposed in the meantime.
fn adopt(rt: &Rc<RuntimeInner>, owner: AttrId, id: AttrId) {
    let mut guard = rt.arena.borrow_mut();
    let arena = &mut *guard;
    let Some(live) = arena.attrs.get(owner).map(|node| {
        node.virtuals
            .iter()
            .copied()
            .filter(|v| arena.attrs.contains_key(*v))
            .collect::<Vec<_>>()
    }) else {
        return;
    };
    if let Some(node) = arena.attrs.get_mut(owner) {
        node.virtuals = live;
        node.virtuals.push(id);
    }
}

/// Create an index attribute over `list`. The caller decides who owns it.
pub(crate) fn create_index(rt: &Rc<RuntimeInner>, list: AttrId, index: usize) -> Result<AttrId> {
    let (key, owner) = {
        let arena = rt.arena.borrow();
        let node = arena.attrs.get(list).ok_or(StateError::Disposed)?;
        if !matches!(node.slot, Slot::List(_)) {
            return Err(StateError::TypeMismatch {
                key: node.key.clone(),
                expected: "a list",
            });
        }
        (format!("{}{}", node.key, Token::Index(index)), node.owner)
    };
    let id = super::insert(
        rt,
        AttrNode::new(key, owner, Slot::Index(IndexNode { list, index, sub: 0 })),
    );
    let sub = match rt.add_subscriber(list, forward(rt, id)) {
        Ok(sub) => sub,
        Err(err) => {
            super::dispose(rt, id);
            return Err(err);
        }
    };
    if let Some(Slot::Index(node)) = rt.arena.borrow_mut().attrs.get_mut(id).map(|n| &mut n.slot) {
        node.sub = sub;
    }
    Ok(id)
}

/// Create a key attribute over `map`.
pub(crate) fn create_key(rt: &Rc<RuntimeInner>, map: AttrId, key: &str) -> Result<AttrId> {
    let (name, owner) = {
        let arena = rt.arena.borrow();
        let node = arena.attrs.get(map).ok_or(StateError::Disposed)?;
        if !matches!(node.slot, Slot::Map(_)) {
            return Err(StateError::TypeMismatch {
                key: node.key.clone(),
                expected: "a map",
            });
        }
        (format!("{}{}", node.key, Token::Key(key.to_string())), node.owner)
    };
    let id = super::insert(
        rt,
        AttrNode::new(
            name,
            owner,
            Slot::MapKey(MapKeyNode {
                map,
                key: key.to_string(),
                sub: 0,
            }),
        ),
    );
    let sub = match rt.add_subscriber(map, forward(rt, id)) {
        Ok(sub) => sub,
        Err(err) => {
            super::dispose(rt, id);
            return Err(err);
        }
    };
    if let Some(Slot::MapKey(node)) = rt.arena.borrow_mut().attrs.get_mut(id).map(|n| &mut n.slot) {
        node.sub = sub;
    }
    Ok(id)
}

fn index_target(rt: &Rc<RuntimeInner>, id: AttrId) -> Result<(AttrId, usize)> {
    let arena = rt.arena.borrow();
    match arena.attrs.get(id).map(|n| &n.slot) {
        Some(Slot::Index(node)) => Ok((node.list, node.index)),
        _ => Err(StateError::Disposed),
    }
}

fn key_target(rt: &Rc<RuntimeInner>, id: AttrId) -> Result<(AttrId, String)> {
    let arena = rt.arena.borrow();
    match arena.attrs.get(id).map(|n| &n.slot) {
        Some(Slot::MapKey(node)) => Ok((node.map, node.key.clone())),
        _ => Err(StateError::Disposed),
    }
}

/// Element value, or null past the end.
pub(crate) fn index_current(rt: &Rc<RuntimeInner>, id: AttrId) -> Result<Value> {
    let (list, index) = index_target(rt, id)?;
    Ok(super::list::element(rt, list, index)?.unwrap_or_default())
}

/// Entry value, or null when the key is absent.
pub(crate) fn key_current(rt: &Rc<RuntimeInner>, id: AttrId) -> Result<Value> {
    let (map, key) = key_target(rt, id)?;
    Ok(super::map::entry(rt, map, &key)?.unwrap_or_default())
}

pub(crate) fn index_set(rt: &Rc<RuntimeInner>, id: AttrId, value: Value) -> Result<()> {
    let (list, index) = index_target(rt, id)?;
    super::list::set_at(rt, list, index, value)
}

pub(crate) fn key_set(rt: &Rc<RuntimeInner>, id: AttrId, value: Value) -> Result<()> {
    let (map, key) = key_target(rt, id)?;
    super::map::set_entry(rt, map, &key, value)
}

pub(crate) fn teardown_index(rt: &Rc<RuntimeInner>, node: IndexNode) {
    rt.remove_subscriber(node.list, node.sub);
}

pub(crate) fn teardown_key(rt: &Rc<RuntimeInner>, node: MapKeyNode) {
    rt.remove_subscriber(node.map, node.sub);
}

#[cfg(test)]
mod tests {
    use crate::{Attribute, List, Map, State, SubscribeOptions, Value};
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn index_attr_follows_structural_changes() {
        let state = State::new(json!({"items": ["a", "b"]})).unwrap();
        let list = state.get_as::<List>("items").unwrap();
        let second = list.get_attr(1).unwrap();
        assert_eq!(second.key(), "items[1]");
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let _sub = second
            .subscribe(move |v| s.borrow_mut().push(v.clone()), SubscribeOptions::deferred())
            .unwrap();
        list.unshift("z").unwrap();
        list.shift().unwrap();
        list.pop().unwrap();
        assert_eq!(
            *seen.borrow(),
            vec![Value::from("a"), Value::from("b"), Value::null()]
        );
    }

    #[test]
    fn index_attr_writes_through() {
        let state = State::new(json!({"items": [1, 2]})).unwrap();
        let list = state.get_as::<List>("items").unwrap();
        let attr = list.get_attr(0).unwrap();
        attr.set(10).unwrap();
        assert_eq!(list.at(0), Some(Value::from(10)));
        let end = list.get_attr(2).unwrap();
        end.set(3).unwrap();
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn key_attr_reads_null_when_absent() {
        let state = State::builder(json!({}))
            .map("tags", [("a", json!(1))])
            .build()
            .unwrap();
        let map = state.get_as::<Map>("tags").unwrap();
        let b = map.key_attr("b").unwrap();
        assert_eq!(b.key(), "tags[\"b\"]");
        assert_eq!(b.get().unwrap(), Value::null());
        b.set(2).unwrap();
        assert_eq!(map.get("b"), Some(Value::from(2)));
        map.delete("b").unwrap();
        assert_eq!(b.get().unwrap(), Value::null());
    }

    #[test]
    fn one_node_per_position() {
        let state = State::builder(json!({"items": [1, 2]}))
            .map("tags", [("a", json!(1))])
            .build()
            .unwrap();
        let list = state.get_as::<List>("items").unwrap();
        let map = state.get_as::<Map>("tags").unwrap();
        assert_eq!(list.get_attr(0).unwrap(), list.get_attr(0).unwrap());
        assert_ne!(list.get_attr(0).unwrap(), list.get_attr(1).unwrap());
        assert_eq!(map.key_attr("a").unwrap(), map.key_attr("a").unwrap());
        assert_ne!(map.key_attr("a").unwrap(), map.key_attr("b").unwrap());
    }

    #[test]
    fn virtuals_die_with_their_collection() {
        let state = State::new(json!({"items": [1]})).unwrap();
        let list = state.get_as::<List>("items").unwrap();
        let attr = list.get_attr(0).unwrap();
        state.set("items", json!([2])).unwrap();
        assert!(attr.is_alive());
        assert_eq!(attr.get().unwrap(), Value::from(2));
        state.dispose();
        assert!(!attr.is_alive());
    }
}
