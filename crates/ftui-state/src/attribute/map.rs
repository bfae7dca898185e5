#![forbid(unsafe_code)]

//! Associative collection attribute.
//!
//! # Design
//!
//! A [`Map`] handle points at an attribute node whose slot holds an
//! insertion-ordered `IndexMap` of entries. Entries are wrapped at
//! insertion like list elements. Mutations follow the list's commit shape:
//! compute the next table from a snapshot, swap it in, dispose owned values
//! that left, notify once.
//!
//! The key list and the entry count are exposed as two derived views. They
//! subscribe to the map like any other derived value and only emit when
//! the view itself changes, so overwriting an existing key notifies the map
//! but neither view.
//!
//! # Invariants
//!
//! 1. One effective mutation, one notification.
//! 2. Deleting an absent key or clearing an empty map is a no-op.
//! 3. Keys keep insertion order; overwriting keeps the original position.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use super::derived::{ComputeFn, DerivedNode};
use super::{Attr, AttrId, AttrNode, Attribute, Slot, WrapCtx};
use crate::error::{Result, StateError};
use crate::reactive::runtime::RuntimeInner;
use crate::reactive::{SubscribeOptions, Subscription};
use crate::state::StateId;
use crate::state::schema::Schema;
use crate::value::{Plain, Stored, Value};

pub(crate) struct MapNode {
    pub(crate) entries: IndexMap<String, Stored>,
    pub(crate) owner_attr: Option<AttrId>,
    value_schema: Option<Rc<dyn Schema>>,
    keys_view: Option<AttrId>,
    size_view: Option<AttrId>,
}

/// Handle to an associative collection.
#[derive(Clone)]
pub struct Map {
    pub(crate) rt: Rc<RuntimeInner>,
    pub(crate) id: AttrId,
}

pub(crate) fn create(
    rt: &Rc<RuntimeInner>,
    key: String,
    owner: Option<StateId>,
    owner_attr: Option<AttrId>,
    schema: Option<Rc<dyn Schema>>,
    entries: IndexMap<String, Plain>,
) -> Result<AttrId> {
    let node = MapNode {
        entries: IndexMap::new(),
        owner_attr,
        value_schema: schema.and_then(|s| s.items()),
        keys_view: None,
        size_view: None,
    };
    let id = super::insert(rt, AttrNode::new(key, owner, Slot::Map(node)));
    let map = Map::from_parts(Rc::clone(rt), id);
    match map.wrap_entries(entries.into_iter().map(|(k, v)| (k, Value::Plain(v))).collect()) {
        Ok(wrapped) => {
            if let Some(Slot::Map(node)) = rt.arena.borrow_mut().attrs.get_mut(id).map(|n| &mut n.slot) {
                node.entries = wrapped;
            }
            Ok(id)
        }
        Err(err) => {
            super::dispose(rt, id);
            Err(err)
        }
    }
}

/// Replace the whole table from a written value.
pub(crate) fn replace_from(rt: &Rc<RuntimeInner>, id: AttrId, value: Value) -> Result<()> {
    let map = Map::from_parts(Rc::clone(rt), id);
    let entries = match value {
        Value::Plain(Plain::Map(entries) | Plain::Object(entries)) => entries,
        Value::Plain(Plain::Null) => IndexMap::new(),
        Value::Map(other) if other.id == id && Rc::ptr_eq(&other.rt, rt) => return Ok(()),
        Value::Map(other) => match other.to_plain() {
            Plain::Map(entries) => entries,
            _ => IndexMap::new(),
        },
        _ => {
            return Err(StateError::TypeMismatch {
                key: rt.key_of(id),
                expected: "a map",
            });
        }
    };
    let next = map.wrap_entries(entries.into_iter().map(|(k, v)| (k, Value::Plain(v))).collect())?;
    map.commit(next)?;
    Ok(())
}

/// Entry for `key`, untracked.
pub(crate) fn entry(rt: &Rc<RuntimeInner>, id: AttrId, key: &str) -> Result<Option<Value>> {
    let arena = rt.arena.borrow();
    match arena.attrs.get(id).map(|n| &n.slot) {
        Some(Slot::Map(node)) => Ok(node.entries.get(key).map(|value| value.load(rt))),
        _ => Err(StateError::Disposed),
    }
}

pub(crate) fn set_entry(rt: &Rc<RuntimeInner>, id: AttrId, key: &str, value: Value) -> Result<()> {
    Map::from_parts(Rc::clone(rt), id).set(key, value)
}

/// Tracked key list, as computed by the keys view.
pub(crate) fn keys_value(rt: &Rc<RuntimeInner>, id: AttrId) -> Result<Value> {
    rt.collect(id);
    let arena = rt.arena.borrow();
    match arena.attrs.get(id).map(|n| &n.slot) {
        Some(Slot::Map(node)) => Ok(Value::Plain(Plain::List(
            node.entries.keys().map(|k| Plain::String(k.clone())).collect(),
        ))),
        _ => Err(StateError::Disposed),
    }
}

/// Tracked entry count, as computed by the size view.
pub(crate) fn size_value(rt: &Rc<RuntimeInner>, id: AttrId) -> Result<Value> {
    rt.collect(id);
    let arena = rt.arena.borrow();
    match arena.attrs.get(id).map(|n| &n.slot) {
        Some(Slot::Map(node)) => Ok(Value::from(node.entries.len())),
        _ => Err(StateError::Disposed),
    }
}

pub(crate) fn teardown(rt: &Rc<RuntimeInner>, node: MapNode, id: AttrId) {
    for value in node.entries.values() {
        super::dispose_value(rt, value, id);
    }
}

impl Map {
    pub(crate) fn from_parts(rt: Rc<RuntimeInner>, id: AttrId) -> Self {
        Self { rt, id }
    }

    /// The map's attribute handle.
    #[must_use]
    pub fn attr(&self) -> Attr {
        Attr::from_parts(Rc::clone(&self.rt), self.id)
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.rt.arena.borrow().attrs.contains_key(self.id)
    }

    fn snapshot(&self) -> Result<IndexMap<String, Stored>> {
        let arena = self.rt.arena.borrow();
        match arena.attrs.get(self.id).map(|n| &n.slot) {
            Some(Slot::Map(node)) => Ok(node.entries.clone()),
            _ => Err(StateError::Disposed),
        }
    }

    fn wrap_entries(&self, entries: Vec<(String, Value)>) -> Result<IndexMap<String, Stored>> {
        let ctx = {
            let arena = self.rt.arena.borrow();
            let node = arena.attrs.get(self.id).ok_or(StateError::Disposed)?;
            let Slot::Map(map) = &node.slot else {
                return Err(StateError::Disposed);
            };
            WrapCtx {
                parent: node.owner,
                owner_attr: Some(self.id),
                mount: None,
                schema: map.value_schema.clone(),
            }
        };
        let mut wrapped = IndexMap::with_capacity(entries.len());
        for (key, value) in entries {
            let ctx = WrapCtx {
                mount: Some(key.clone()),
                ..ctx.clone()
            };
            match super::wrap(&self.rt, value, &ctx) {
                Ok(v) => {
                    wrapped.insert(key, v);
                }
                Err(err) => {
                    for v in wrapped.values() {
                        super::dispose_value(&self.rt, v, self.id);
                    }
                    return Err(err);
                }
            }
        }
        Ok(wrapped)
    }

    fn commit(&self, next: IndexMap<String, Stored>) -> Result<bool> {
        let old = {
            let mut arena = self.rt.arena.borrow_mut();
            let Some(Slot::Map(node)) = arena.attrs.get_mut(self.id).map(|n| &mut n.slot) else {
                drop(arena);
                for v in next.values() {
                    super::dispose_value(&self.rt, v, self.id);
                }
                return Err(StateError::Disposed);
            };
            if node.entries == next {
                return Ok(false);
            }
            std::mem::replace(&mut node.entries, next.clone())
        };
        for value in old.values() {
            if !matches!(value, Stored::Plain(_)) && !next.values().any(|v| v == value) {
                super::dispose_value(&self.rt, value, self.id);
            }
        }
        self.rt.enqueue(self.id);
        Ok(true)
    }

    fn view(&self, keys: bool) -> Result<Attr> {
        let existing = {
            let arena = self.rt.arena.borrow();
            match arena.attrs.get(self.id).map(|n| &n.slot) {
                Some(Slot::Map(node)) => {
                    if keys {
                        node.keys_view
                    } else {
                        node.size_view
                    }
                }
                _ => return Err(StateError::Disposed),
            }
        };
        if let Some(id) = existing {
            return Ok(Attr::from_parts(Rc::clone(&self.rt), id));
        }
        let (name, owner) = {
            let arena = self.rt.arena.borrow();
            let node = arena.attrs.get(self.id).ok_or(StateError::Disposed)?;
            let suffix = if keys { "keys" } else { "size" };
            (format!("{}.{suffix}", node.key), node.owner)
        };
        let compute = if keys {
            ComputeFn::MapKeys(self.id)
        } else {
            ComputeFn::MapSize(self.id)
        };
        let view = super::insert(
            &self.rt,
            AttrNode::new(name, owner, Slot::Derived(DerivedNode::new(compute))),
        );
        let mut arena = self.rt.arena.borrow_mut();
        if let Some(node) = arena.attrs.get_mut(self.id) {
            node.virtuals.push(view);
            if let Slot::Map(map) = &mut node.slot {
                if keys {
                    map.keys_view = Some(view);
                } else {
                    map.size_view = Some(view);
                }
            }
        }
        Ok(Attr::from_parts(Rc::clone(&self.rt), view))
    }

    // -- reads ---------------------------------------------------------------

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.rt.collect(self.id);
        entry(&self.rt, self.id, key).ok().flatten()
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rt.collect(self.id);
        self.snapshot().map(|entries| entries.len()).unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries().into_iter().map(|(k, _)| k).collect()
    }

    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        self.entries().into_iter().map(|(_, v)| v).collect()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.rt.collect(self.id);
        self.snapshot()
            .map(|entries| {
                entries
                    .into_iter()
                    .map(|(k, v)| (k, v.load(&self.rt)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Visit every entry in insertion order. The map may be mutated from
    /// `f`; iteration runs over the entries present when it started.
    pub fn for_each(&self, mut f: impl FnMut(&str, &Value)) {
        for (key, value) in self.entries() {
            f(&key, &value);
        }
    }

    /// Deep, untracked snapshot.
    #[must_use]
    pub fn to_plain(&self) -> Plain {
        let entries = self.snapshot().unwrap_or_default();
        Plain::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), v.to_plain(&self.rt)))
                .collect(),
        )
    }

    /// Observable attribute for the entry at `key`.
    pub fn key_attr(&self, key: &str) -> Result<Attr> {
        let virt = super::element::key_attr(&self.rt, self.id, key)?;
        Ok(Attr::from_parts(Rc::clone(&self.rt), virt))
    }

    /// Read-only view of the key list; emits only when the keys change.
    pub fn keys_attr(&self) -> Result<Attr> {
        self.view(true)
    }

    /// Read-only view of the entry count; emits only when it changes.
    pub fn size_attr(&self) -> Result<Attr> {
        self.view(false)
    }

    // -- mutations -----------------------------------------------------------

    /// Insert or overwrite `key`.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let mut entries = self.snapshot()?;
        if entries.get(key).is_some_and(|old| old.matches(&self.rt, &value)) {
            return Ok(());
        }
        let mut wrapped = self.wrap_entries(vec![(key.to_string(), value)])?;
        if let Some(value) = wrapped.shift_remove(key) {
            entries.insert(key.to_string(), value);
        }
        self.commit(entries)?;
        Ok(())
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.snapshot()?;
        if entries.shift_remove(key).is_none() {
            return Ok(false);
        }
        self.commit(entries)?;
        Ok(true)
    }

    pub fn clear(&self) -> Result<()> {
        self.commit(IndexMap::new())?;
        Ok(())
    }
}

impl Attribute for Map {
    fn key(&self) -> String {
        self.rt.key_of(self.id)
    }

    fn get(&self) -> Result<Value> {
        super::read(&self.rt, self.id)
    }

    fn set(&self, value: impl Into<Value>) -> Result<()> {
        super::set(&self.rt, self.id, value.into())
    }

    fn subscribe(
        &self,
        callback: impl Fn(&Value) + 'static,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        super::subscribe(&self.rt, self.id, Rc::new(callback), options)
    }

    fn is_writable(&self) -> bool {
        self.is_alive()
    }

    fn dispose(&self) {
        super::dispose(&self.rt, self.id);
    }
}

impl PartialEq for Map {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.rt, &other.rt) && self.id == other.id
    }
}

impl fmt::Debug for Map {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Map")
            .field("key", &self.rt.key_of(self.id))
            .field("entries", &self.to_plain())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::State;
    use serde_json::json;
    use std::cell::RefCell;

    fn tags(entries: serde_json::Value) -> (State, Map) {
        let serde_json::Value::Object(fields) = entries else {
            panic!("expected a JSON object");
        };
        let state = State::builder(json!({}))
            .map("tags", fields)
            .build()
            .unwrap();
        let map = state.get_as::<Map>("tags").unwrap();
        (state, map)
    }

    fn record(attr: &impl Attribute) -> (Rc<RefCell<Vec<Value>>>, Subscription) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let sub = attr
            .subscribe(move |v| s.borrow_mut().push(v.clone()), SubscribeOptions::deferred())
            .unwrap();
        (seen, sub)
    }

    #[test]
    fn basic_operations() {
        let (_state, map) = tags(json!({"a": 1}));
        map.set("b", 2).unwrap();
        assert!(map.has("b"));
        assert_eq!(map.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(map.values(), vec![Value::from(1), Value::from(2)]);
        assert_eq!(map.len(), 2);
        assert!(map.delete("a").unwrap());
        assert!(!map.delete("a").unwrap());
        let mut visited = Vec::new();
        map.for_each(|k, v| visited.push(format!("{k}={v}")));
        assert_eq!(visited, vec!["b=2".to_string()]);
        map.clear().unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn overwrite_keeps_position() {
        let (_state, map) = tags(json!({"a": 1, "b": 2}));
        map.set("a", 3).unwrap();
        assert_eq!(map.to_plain().to_json(), json!({"a": 3, "b": 2}));
    }

    #[test]
    fn views_emit_only_on_change() {
        let (_state, map) = tags(json!({"a": 1}));
        let (all, _s1) = record(&map);
        let (sizes, _s2) = record(&map.size_attr().unwrap());
        let (keys, _s3) = record(&map.keys_attr().unwrap());

        map.set("a", 2).unwrap();
        map.set("a", 2).unwrap();
        map.set("b", 1).unwrap();
        map.delete("a").unwrap();

        assert_eq!(all.borrow().len(), 3);
        assert_eq!(*sizes.borrow(), vec![Value::from(2), Value::from(1)]);
        assert_eq!(
            keys.borrow()
                .iter()
                .map(|v| v.to_plain().to_json())
                .collect::<Vec<_>>(),
            vec![json!(["a", "b"]), json!(["b"])]
        );
    }

    #[test]
    fn views_are_shared() {
        let (_state, map) = tags(json!({}));
        assert_eq!(map.size_attr().unwrap(), map.size_attr().unwrap());
        assert_eq!(map.keys_attr().unwrap().kind().unwrap(), super::super::AttrKind::MapKeys);
        assert!(!map.size_attr().unwrap().is_writable());
    }

    #[test]
    fn structured_entries_are_owned() {
        let (_state, map) = tags(json!({"o": {"x": 1}}));
        let child = map.get("o").unwrap().as_state().unwrap().clone();
        assert_eq!(child.get("x").unwrap(), Value::from(1));
        map.delete("o").unwrap();
        assert!(!child.is_alive());
    }

    #[test]
    fn wholesale_assignment() {
        let (state, map) = tags(json!({"a": 1}));
        state.set("tags", Plain::map([("z", Plain::from(9))])).unwrap();
        assert_eq!(map.keys(), vec!["z".to_string()]);
        assert!(matches!(
            state.set("tags", 1),
            Err(StateError::TypeMismatch { .. })
        ));
    }
}
