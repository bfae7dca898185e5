#![forbid(unsafe_code)]

//! Ordered collection attribute.
//!
//! # Design
//!
//! A [`List`] handle points at an attribute node whose slot holds the
//! backing element vector. Every mutating operation follows the same shape:
//!
//! 1. wrap incoming values (structured data becomes child nodes owned by
//!    the list),
//! 2. build the next element vector from a snapshot,
//! 3. commit it: swap the vector in, dispose owned elements that are no
//!    longer present, and notify exactly once.
//!
//! A commit whose result equals the current contents notifies nobody.
//! Removed elements are returned as detached [`Plain`] snapshots because
//! owned nodes are disposed on removal.
//!
//! # Invariants
//!
//! 1. One effective mutation, one notification.
//! 2. Reads (`len`, `at`, `to_vec`, `get`) register the list with the
//!    active collector.
//! 3. No arena borrow is held while a user comparator or mapper runs.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Bound, RangeBounds};
use std::rc::Rc;

use super::{Attr, AttrId, AttrNode, Attribute, Slot, WrapCtx};
use crate::error::{Result, StateError};
use crate::reactive::runtime::RuntimeInner;
use crate::reactive::{SubscribeOptions, Subscription};
use crate::state::StateId;
use crate::state::schema::Schema;
use crate::value::{Plain, Stored, Value};

pub(crate) struct ListNode {
    pub(crate) items: Vec<Stored>,
    pub(crate) owner_attr: Option<AttrId>,
    item_schema: Option<Rc<dyn Schema>>,
}

/// Handle to an ordered collection.
#[derive(Clone)]
pub struct List {
    pub(crate) rt: Rc<RuntimeInner>,
    pub(crate) id: AttrId,
}

pub(crate) fn create(
    rt: &Rc<RuntimeInner>,
    key: String,
    owner: Option<StateId>,
    owner_attr: Option<AttrId>,
    schema: Option<Rc<dyn Schema>>,
    items: Vec<Plain>,
) -> Result<AttrId> {
    let node = ListNode {
        items: Vec::new(),
        owner_attr,
        item_schema: schema.and_then(|s| s.items()),
    };
    let id = super::insert(rt, AttrNode::new(key, owner, Slot::List(node)));
    let list = List::from_parts(Rc::clone(rt), id);
    match list.wrap_all(items.into_iter().map(Value::Plain).collect()) {
        Ok(wrapped) => {
            if let Some(Slot::List(node)) = rt.arena.borrow_mut().attrs.get_mut(id).map(|n| &mut n.slot) {
                node.items = wrapped;
            }
            Ok(id)
        }
        Err(err) => {
            super::dispose(rt, id);
            Err(err)
        }
    }
}

/// Replace the whole contents from a written value.
pub(crate) fn replace_from(rt: &Rc<RuntimeInner>, id: AttrId, value: Value) -> Result<()> {
    let list = List::from_parts(Rc::clone(rt), id);
    let items = match value {
        Value::Plain(Plain::List(items)) => items,
        Value::Plain(Plain::Null) => Vec::new(),
        Value::List(other) if other.id == id && Rc::ptr_eq(&other.rt, rt) => return Ok(()),
        Value::List(other) => match other.to_plain() {
            Plain::List(items) => items,
            _ => Vec::new(),
        },
        _ => {
            return Err(StateError::TypeMismatch {
                key: rt.key_of(id),
                expected: "a list",
            });
        }
    };
    let next = list.wrap_all(items.into_iter().map(Value::Plain).collect())?;
    list.commit(next)?;
    Ok(())
}

/// Element at `index`, untracked.
pub(crate) fn element(rt: &Rc<RuntimeInner>, id: AttrId, index: usize) -> Result<Option<Value>> {
    let arena = rt.arena.borrow();
    match arena.attrs.get(id).map(|n| &n.slot) {
        Some(Slot::List(node)) => Ok(node.items.get(index).map(|item| item.load(rt))),
        _ => Err(StateError::Disposed),
    }
}

pub(crate) fn set_at(rt: &Rc<RuntimeInner>, id: AttrId, index: usize, value: Value) -> Result<()> {
    List::from_parts(Rc::clone(rt), id).set(index, value)
}

pub(crate) fn teardown(rt: &Rc<RuntimeInner>, node: ListNode, id: AttrId) {
    for item in &node.items {
        super::dispose_value(rt, item, id);
    }
}

fn range(bounds: impl RangeBounds<usize>, len: usize) -> (usize, usize) {
    let start = match bounds.start_bound() {
        Bound::Included(&s) => s,
        Bound::Excluded(&s) => s.saturating_add(1),
        Bound::Unbounded => 0,
    }
    .min(len);
    let end = match bounds.end_bound() {
        Bound::Included(&e) => e.saturating_add(1),
        Bound::Excluded(&e) => e,
        Bound::Unbounded => len,
    }
    .min(len);
    (start, end.max(start))
}

impl List {
    pub(crate) fn from_parts(rt: Rc<RuntimeInner>, id: AttrId) -> Self {
        Self { rt, id }
    }

    /// The list's attribute handle.
    #[must_use]
    pub fn attr(&self) -> Attr {
        Attr::from_parts(Rc::clone(&self.rt), self.id)
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.rt.arena.borrow().attrs.contains_key(self.id)
    }

    fn snapshot(&self) -> Result<Vec<Stored>> {
        let arena = self.rt.arena.borrow();
        match arena.attrs.get(self.id).map(|n| &n.slot) {
            Some(Slot::List(node)) => Ok(node.items.clone()),
            _ => Err(StateError::Disposed),
        }
    }

    fn wrap_ctx(&self) -> Result<WrapCtx> {
        let arena = self.rt.arena.borrow();
        let node = arena.attrs.get(self.id).ok_or(StateError::Disposed)?;
        let Slot::List(list) = &node.slot else {
            return Err(StateError::Disposed);
        };
        Ok(WrapCtx {
            parent: node.owner,
            owner_attr: Some(self.id),
            mount: None,
            schema: list.item_schema.clone(),
        })
    }

    fn load_all(&self, items: &[Stored]) -> Vec<Value> {
        items.iter().map(|item| item.load(&self.rt)).collect()
    }

    fn wrap_all(&self, values: Vec<Value>) -> Result<Vec<Stored>> {
        let ctx = self.wrap_ctx()?;
        let mut wrapped = Vec::with_capacity(values.len());
        for value in values {
            match super::wrap(&self.rt, value, &ctx) {
                Ok(v) => wrapped.push(v),
                Err(err) => {
                    for v in &wrapped {
                        super::dispose_value(&self.rt, v, self.id);
                    }
                    return Err(err);
                }
            }
        }
        Ok(wrapped)
    }

    fn wrap_one(&self, value: Value) -> Result<Stored> {
        let mut wrapped = self.wrap_all(vec![value])?;
        wrapped.pop().ok_or(StateError::Disposed)
    }

    /// Swap in `next`; dispose owned elements that left; notify once.
    fn commit(&self, next: Vec<Stored>) -> Result<bool> {
        let old = {
            let mut arena = self.rt.arena.borrow_mut();
            let Some(Slot::List(node)) = arena.attrs.get_mut(self.id).map(|n| &mut n.slot) else {
                drop(arena);
                for v in &next {
                    super::dispose_value(&self.rt, v, self.id);
                }
                return Err(StateError::Disposed);
            };
            if node.items == next {
                return Ok(false);
            }
            std::mem::replace(&mut node.items, next.clone())
        };
        for item in &old {
            if !matches!(item, Stored::Plain(_)) && !next.contains(item) {
                super::dispose_value(&self.rt, item, self.id);
            }
        }
        self.rt.enqueue(self.id);
        Ok(true)
    }

    // -- reads ---------------------------------------------------------------

    #[must_use]
    pub fn len(&self) -> usize {
        self.rt.collect(self.id);
        self.snapshot().map(|items| items.len()).unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index`, if any.
    #[must_use]
    pub fn at(&self, index: usize) -> Option<Value> {
        self.rt.collect(self.id);
        element(&self.rt, self.id, index).ok().flatten()
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<Value> {
        self.rt.collect(self.id);
        self.snapshot()
            .map(|items| self.load_all(&items))
            .unwrap_or_default()
    }

    /// Deep, untracked snapshot.
    #[must_use]
    pub fn to_plain(&self) -> Plain {
        let items = self.snapshot().unwrap_or_default();
        Plain::List(items.iter().map(|item| item.to_plain(&self.rt)).collect())
    }

    /// Observable attribute for the element at `index`.
    ///
    /// It re-emits on every structural change of the list and lives until
    /// the list (or the attribute itself) is disposed. Asking twice for the
    /// same index returns the same attribute.
    pub fn get_attr(&self, index: usize) -> Result<Attr> {
        let virt = super::element::index_attr(&self.rt, self.id, index)?;
        Ok(Attr::from_parts(Rc::clone(&self.rt), virt))
    }

    // -- mutations -----------------------------------------------------------

    /// Assign `value` at `index`. `index == len` appends.
    pub fn set(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let mut items = self.snapshot()?;
        if index > items.len() {
            return Err(StateError::IndexOutOfBounds {
                index,
                len: items.len(),
            });
        }
        if items.get(index).is_some_and(|item| item.matches(&self.rt, &value)) {
            return Ok(());
        }
        let value = self.wrap_one(value)?;
        if index == items.len() {
            items.push(value);
        } else {
            items[index] = value;
        }
        self.commit(items)?;
        Ok(())
    }

    /// Append; returns the new length.
    pub fn push(&self, value: impl Into<Value>) -> Result<usize> {
        let value = self.wrap_one(value.into())?;
        let mut items = self.snapshot()?;
        items.push(value);
        let len = items.len();
        self.commit(items)?;
        Ok(len)
    }

    pub fn pop(&self) -> Result<Option<Plain>> {
        let mut items = self.snapshot()?;
        let Some(last) = items.pop() else {
            return Ok(None);
        };
        let removed = last.to_plain(&self.rt);
        self.commit(items)?;
        Ok(Some(removed))
    }

    pub fn shift(&self) -> Result<Option<Plain>> {
        let mut items = self.snapshot()?;
        if items.is_empty() {
            return Ok(None);
        }
        let removed = items.remove(0).to_plain(&self.rt);
        self.commit(items)?;
        Ok(Some(removed))
    }

    /// Prepend; returns the new length.
    pub fn unshift(&self, value: impl Into<Value>) -> Result<usize> {
        let value = self.wrap_one(value.into())?;
        let mut items = self.snapshot()?;
        items.insert(0, value);
        let len = items.len();
        self.commit(items)?;
        Ok(len)
    }

    pub fn insert_at(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        let len = self.snapshot()?.len();
        if index > len {
            return Err(StateError::IndexOutOfBounds { index, len });
        }
        let value = self.wrap_one(value.into())?;
        let mut items = self.snapshot()?;
        items.insert(index, value);
        self.commit(items)?;
        Ok(())
    }

    pub fn remove_at(&self, index: usize) -> Result<Plain> {
        let mut items = self.snapshot()?;
        if index >= items.len() {
            return Err(StateError::IndexOutOfBounds {
                index,
                len: items.len(),
            });
        }
        let removed = items.remove(index).to_plain(&self.rt);
        self.commit(items)?;
        Ok(removed)
    }

    /// Move the element at `from` so that it ends up at `to`.
    pub fn move_item(&self, from: usize, to: usize) -> Result<()> {
        let mut items = self.snapshot()?;
        let len = items.len();
        for index in [from, to] {
            if index >= len {
                return Err(StateError::IndexOutOfBounds { index, len });
            }
        }
        if from == to {
            return Ok(());
        }
        let item = items.remove(from);
        items.insert(to, item);
        self.commit(items)?;
        Ok(())
    }

    /// Remove `delete_count` elements at `start` and insert `insert` there.
    /// Out-of-range arguments are clamped. Returns the removed elements.
    pub fn splice(
        &self,
        start: usize,
        delete_count: usize,
        insert: impl IntoIterator<Item = Value>,
    ) -> Result<Vec<Plain>> {
        let inserted = self.wrap_all(insert.into_iter().collect())?;
        let mut items = self.snapshot()?;
        let start = start.min(items.len());
        let end = start.saturating_add(delete_count).min(items.len());
        let removed: Vec<Plain> = items
            .splice(start..end, inserted)
            .map(|v| v.to_plain(&self.rt))
            .collect();
        self.commit(items)?;
        Ok(removed)
    }

    pub fn reverse(&self) -> Result<()> {
        let mut items = self.snapshot()?;
        items.reverse();
        self.commit(items)?;
        Ok(())
    }

    /// Stable sort with a caller-supplied comparator.
    pub fn sort_by(&self, mut compare: impl FnMut(&Value, &Value) -> Ordering) -> Result<()> {
        let mut keyed: Vec<(Value, Stored)> = self
            .snapshot()?
            .into_iter()
            .map(|item| (item.load(&self.rt), item))
            .collect();
        self.rt.untracked(|| keyed.sort_by(|a, b| compare(&a.0, &b.0)));
        self.commit(keyed.into_iter().map(|(_, item)| item).collect())?;
        Ok(())
    }

    /// Set every position in `range` to (its own copy of) `value`.
    pub fn fill(&self, value: impl Into<Value>, bounds: impl RangeBounds<usize>) -> Result<()> {
        let value = value.into();
        let mut items = self.snapshot()?;
        let (start, end) = range(bounds, items.len());
        let fresh = self.wrap_all(vec![value; end - start])?;
        for (slot, v) in items[start..end].iter_mut().zip(fresh) {
            *slot = v;
        }
        self.commit(items)?;
        Ok(())
    }

    /// Copy the elements in `source` to position `target`, overwriting and
    /// keeping the length. Structured elements are deep-copied.
    pub fn copy_within(&self, source: impl RangeBounds<usize>, target: usize) -> Result<()> {
        let mut items = self.snapshot()?;
        let len = items.len();
        let (start, end) = range(source, len);
        let target = target.min(len);
        let count = (end - start).min(len - target);
        let copies: Vec<Value> = items[start..start + count]
            .iter()
            .map(|v| Value::Plain(v.to_plain(&self.rt)))
            .collect();
        let copies = self.wrap_all(copies)?;
        for (offset, v) in copies.into_iter().enumerate() {
            items[target + offset] = v;
        }
        self.commit(items)?;
        Ok(())
    }

    /// Replace the element at `index` with `f(current)`.
    pub fn update(&self, index: usize, f: impl FnOnce(&Value) -> Value) -> Result<()> {
        let items = self.snapshot()?;
        let current = items
            .get(index)
            .ok_or(StateError::IndexOutOfBounds {
                index,
                len: items.len(),
            })?
            .load(&self.rt);
        let next = self.rt.untracked(|| f(&current));
        self.set(index, next)
    }

    /// Replace every element with `f(element, index)`.
    pub fn replace_all(&self, mut f: impl FnMut(&Value, usize) -> Value) -> Result<()> {
        let items = self.load_all(&self.snapshot()?);
        let mapped: Vec<Value> = self.rt.untracked(|| {
            items
                .iter()
                .enumerate()
                .map(|(i, v)| f(v, i))
                .collect()
        });
        let next = self.wrap_all(mapped)?;
        self.commit(next)?;
        Ok(())
    }

    /// Remove every element.
    pub fn clear(&self) -> Result<()> {
        self.commit(Vec::new())?;
        Ok(())
    }
}

impl Attribute for List {
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

impl PartialEq for List {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.rt, &other.rt) && self.id == other.id
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("List")
            .field("key", &self.rt.key_of(self.id))
            .field("items", &self.to_plain())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::State;
    use serde_json::json;
    use std::cell::Cell;

    fn fixture(items: serde_json::Value) -> (State, List, Rc<Cell<usize>>, Subscription) {
        let state = State::new(json!({ "items": items })).unwrap();
        let list = state.get_as::<List>("items").unwrap();
        let hits = Rc::new(Cell::new(0));
        let h = Rc::clone(&hits);
        let sub = list
            .subscribe(move |_| h.set(h.get() + 1), SubscribeOptions::deferred())
            .unwrap();
        (state, list, hits, sub)
    }

    fn plain(list: &List) -> serde_json::Value {
        list.to_plain().to_json()
    }

    #[test]
    fn push_pop_shift_unshift() {
        let (_state, list, hits, _sub) = fixture(json!([1, 2]));
        assert_eq!(list.push(3).unwrap(), 3);
        assert_eq!(list.unshift(0).unwrap(), 4);
        assert_eq!(plain(&list), json!([0, 1, 2, 3]));
        assert_eq!(list.pop().unwrap(), Some(Plain::from(3)));
        assert_eq!(list.shift().unwrap(), Some(Plain::from(0)));
        assert_eq!(plain(&list), json!([1, 2]));
        assert_eq!(hits.get(), 4);
    }

    #[test]
    fn noop_mutations_do_not_notify() {
        let (_state, list, hits, _sub) = fixture(json!([]));
        assert_eq!(list.pop().unwrap(), None);
        assert_eq!(list.shift().unwrap(), None);
        list.reverse().unwrap();
        list.clear().unwrap();
        assert_eq!(hits.get(), 0);
        list.push(1).unwrap();
        list.set(0, 1).unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn insert_remove_move() {
        let (_state, list, hits, _sub) = fixture(json!(["a", "b", "c"]));
        list.insert_at(1, "x").unwrap();
        assert_eq!(plain(&list), json!(["a", "x", "b", "c"]));
        assert_eq!(list.remove_at(0).unwrap(), Plain::from("a"));
        list.move_item(0, 2).unwrap();
        assert_eq!(plain(&list), json!(["b", "c", "x"]));
        assert_eq!(hits.get(), 3);
        assert!(matches!(
            list.remove_at(9),
            Err(StateError::IndexOutOfBounds { index: 9, len: 3 })
        ));
        assert!(list.insert_at(4, "z").is_err());
    }

    #[test]
    fn splice_returns_removed() {
        let (_state, list, hits, _sub) = fixture(json!([1, 2, 3, 4]));
        let removed = list
            .splice(1, 2, [Value::from(9), Value::from(8), Value::from(7)])
            .unwrap();
        assert_eq!(removed, vec![Plain::from(2), Plain::from(3)]);
        assert_eq!(plain(&list), json!([1, 9, 8, 7, 4]));
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn sort_fill_copy_within() {
        let (_state, list, _hits, _sub) = fixture(json!([3, 1, 2, 5, 4]));
        list.sort_by(|a, b| {
            a.as_f64()
                .partial_cmp(&b.as_f64())
                .unwrap_or(Ordering::Equal)
        })
        .unwrap();
        assert_eq!(plain(&list), json!([1, 2, 3, 4, 5]));
        list.copy_within(0..2, 3).unwrap();
        assert_eq!(plain(&list), json!([1, 2, 3, 1, 2]));
        list.fill(0, 1..3).unwrap();
        assert_eq!(plain(&list), json!([1, 0, 0, 1, 2]));
        list.fill(7, ..).unwrap();
        assert_eq!(plain(&list), json!([7, 7, 7, 7, 7]));
    }

    #[test]
    fn update_and_replace_all() {
        let (_state, list, hits, _sub) = fixture(json!([1, 2, 3]));
        list.update(1, |v| Value::from(v.as_f64().unwrap_or_default() * 10.0))
            .unwrap();
        list.replace_all(|v, i| Value::from(v.as_f64().unwrap_or_default() + i as f64))
            .unwrap();
        assert_eq!(plain(&list), json!([1, 21, 5]));
        assert_eq!(hits.get(), 2);
        assert!(list.update(5, |v| v.clone()).is_err());
    }

    #[test]
    fn structured_elements_are_wrapped_and_disposed() {
        let (state, list, _hits, _sub) = fixture(json!([{"name": "a"}]));
        let first = list.at(0).unwrap();
        let child = first.as_state().unwrap().clone();
        assert_eq!(child.get("name").unwrap(), Value::from("a"));
        assert_eq!(list.pop().unwrap(), Some(Plain::object([("name", Plain::from("a"))])));
        assert!(!child.is_alive());
        drop(state);
    }

    #[test]
    fn copy_within_deep_copies() {
        let (_state, list, _hits, _sub) = fixture(json!([{"n": 1}, {"n": 2}]));
        list.copy_within(0..1, 1).unwrap();
        let a = list.at(0).unwrap();
        let b = list.at(1).unwrap();
        assert_ne!(a, b);
        b.as_state().unwrap().set("n", 5).unwrap();
        assert_eq!(a.as_state().unwrap().get("n").unwrap(), Value::from(1));
    }

    #[test]
    fn set_past_end_is_rejected_but_end_appends() {
        let (_state, list, _hits, _sub) = fixture(json!([1]));
        list.set(1, 2).unwrap();
        assert_eq!(plain(&list), json!([1, 2]));
        assert!(matches!(
            list.set(5, 0),
            Err(StateError::IndexOutOfBounds { index: 5, len: 2 })
        ));
    }

    #[test]
    fn wholesale_assignment_replaces_contents() {
        let (state, list, hits, _sub) = fixture(json!([1]));
        state.set("items", json!([4, 5])).unwrap();
        assert_eq!(plain(&list), json!([4, 5]));
        assert_eq!(hits.get(), 1);
        assert!(matches!(
            state.set("items", 3),
            Err(StateError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn range_clamps() {
        assert_eq!(range(.., 3), (0, 3));
        assert_eq!(range(1..=1, 3), (1, 2));
        assert_eq!(range(5..9, 3), (3, 3));
        assert_eq!(range(2..1, 3), (2, 2));
    }
}
