#![forbid(unsafe_code)]

//! Attributes: the observable unit of state.
//!
//! Every attribute is an [`AttrNode`] in the runtime arena. Its behaviour is
//! selected by the [`Slot`] variant it carries:
//!
//! | slot      | kind                    | writable                         |
//! |-----------|-------------------------|----------------------------------|
//! | `Value`   | `Mutable` / `Nested`    | yes                              |
//! | `Derived` | `Derived` / map views   | no                               |
//! | `Alias`   | `Alias`                 | if target and transforms allow   |
//! | `List`    | `List`                  | yes (replaces the contents)      |
//! | `Map`     | `Map`                   | yes (replaces the contents)      |
//! | `Index`   | `Index` (virtual)       | yes, through the parent list     |
//! | `MapKey`  | `MapKey` (virtual)      | yes, through the parent map      |
//! | `Path`    | `Path` (virtual)        | if the resolved final is         |
//!
//! A container's list or map attribute *is* the collection: the `List` and
//! `Map` handles point at the same node.
//!
//! # Invariants
//!
//! 1. `read` reports the attribute to the innermost collector before
//!    returning its value.
//! 2. Storing an equal value is a no-op and notifies nobody.
//! 3. A composite attribute releases every subscription it holds on
//!    disposal, and before rebuilding them.
//! 4. Structured values are wrapped at the insertion point; a node created
//!    by wrapping is owned (and later disposed) by the inserting attribute.
//!    Adopted handles are never disposed by the adopter.

pub(crate) mod alias;
pub(crate) mod derived;
pub(crate) mod element;
pub mod list;
pub mod map;
pub(crate) mod path;

use std::fmt;
use std::rc::Rc;

use tracing::trace;

use crate::error::{Result, StateError};
use crate::reactive::runtime::{Callback, RuntimeInner, Subscriber};
use crate::reactive::subscription::{self, SubscribeOptions, Subscription};
use crate::state::schema::Schema;
use crate::state::{self, State, StateId};
use crate::value::{Plain, Stored, Value};

use self::alias::AliasNode;
use self::derived::{ComputeFn, DerivedNode};
use self::element::{IndexNode, MapKeyNode};
use self::list::ListNode;
use self::map::MapNode;
use self::path::PathNode;

pub use self::list::List;
pub use self::map::Map;

slotmap::new_key_type! {
    pub(crate) struct AttrId;
}

/// Behavioural variant of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrKind {
    Mutable,
    Derived,
    Alias,
    Nested,
    List,
    Map,
    Index,
    MapKey,
    MapKeys,
    MapSize,
    Path,
}

impl AttrKind {
    #[must_use]
    pub fn is_virtual(self) -> bool {
        matches!(self, Self::Index | Self::MapKey | Self::Path)
    }
}

pub(crate) enum Slot {
    Value(Stored),
    Derived(DerivedNode),
    Alias(AliasNode),
    List(ListNode),
    Map(MapNode),
    Index(IndexNode),
    MapKey(MapKeyNode),
    Path(PathNode),
}

impl Slot {
    fn kind(&self) -> AttrKind {
        match self {
            Self::Value(Stored::State(_)) => AttrKind::Nested,
            Self::Value(_) => AttrKind::Mutable,
            Self::Derived(d) => match d.compute {
                ComputeFn::Container(_) => AttrKind::Derived,
                ComputeFn::MapKeys(_) => AttrKind::MapKeys,
                ComputeFn::MapSize(_) => AttrKind::MapSize,
            },
            Self::Alias(_) => AttrKind::Alias,
            Self::List(_) => AttrKind::List,
            Self::Map(_) => AttrKind::Map,
            Self::Index(_) => AttrKind::Index,
            Self::MapKey(_) => AttrKind::MapKey,
            Self::Path(_) => AttrKind::Path,
        }
    }
}

pub(crate) struct AttrNode {
    pub(crate) key: String,
    /// Container the attribute belongs to or was created in.
    pub(crate) owner: Option<StateId>,
    pub(crate) slot: Slot,
    pub(crate) subscribers: Vec<Subscriber>,
    /// Virtual attributes handed out by this node; disposed with it.
    pub(crate) virtuals: Vec<AttrId>,
}

impl AttrNode {
    pub(crate) fn new(key: impl Into<String>, owner: Option<StateId>, slot: Slot) -> Self {
        Self {
            key: key.into(),
            owner,
            slot,
            subscribers: Vec::new(),
            virtuals: Vec::new(),
        }
    }
}

/// Where a wrapped value is being inserted.
#[derive(Clone, Default)]
pub(crate) struct WrapCtx {
    /// Container nested states inherit from.
    pub(crate) parent: Option<StateId>,
    /// Attribute (or collection) that owns whatever gets created.
    pub(crate) owner_attr: Option<AttrId>,
    pub(crate) mount: Option<String>,
    pub(crate) schema: Option<Rc<dyn Schema>>,
}

pub(crate) fn insert(rt: &Rc<RuntimeInner>, node: AttrNode) -> AttrId {
    rt.arena.borrow_mut().attrs.insert(node)
}

pub(crate) fn kind(rt: &Rc<RuntimeInner>, id: AttrId) -> Result<AttrKind> {
    rt.arena
        .borrow()
        .attrs
        .get(id)
        .map(|n| n.slot.kind())
        .ok_or(StateError::Disposed)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Value of `id` without reporting the read.
pub(crate) fn current(rt: &Rc<RuntimeInner>, id: AttrId) -> Result<Value> {
    let kind = {
        let arena = rt.arena.borrow();
        let node = arena.attrs.get(id).ok_or(StateError::Disposed)?;
        match &node.slot {
            Slot::Value(v) => return Ok(v.load(rt)),
            Slot::List(_) => return Ok(Value::List(List::from_parts(Rc::clone(rt), id))),
            Slot::Map(_) => return Ok(Value::Map(Map::from_parts(Rc::clone(rt), id))),
            slot => slot.kind(),
        }
    };
    match kind {
        AttrKind::Derived | AttrKind::MapKeys | AttrKind::MapSize => derived::current(rt, id),
        AttrKind::Alias => alias::current(rt, id),
        AttrKind::Index => element::index_current(rt, id),
        AttrKind::MapKey => element::key_current(rt, id),
        AttrKind::Path => path::current(rt, id),
        AttrKind::Mutable | AttrKind::Nested | AttrKind::List | AttrKind::Map => {
            Err(StateError::Disposed)
        }
    }
}

/// Tracked read.
pub(crate) fn read(rt: &Rc<RuntimeInner>, id: AttrId) -> Result<Value> {
    rt.collect(id);
    current(rt, id)
}

/// Public write: declared keys go through their container's validation.
pub(crate) fn set(rt: &Rc<RuntimeInner>, id: AttrId, value: Value) -> Result<()> {
    let (kind, owner, key) = {
        let arena = rt.arena.borrow();
        let node = arena.attrs.get(id).ok_or(StateError::Disposed)?;
        (node.slot.kind(), node.owner, node.key.clone())
    };
    match kind {
        AttrKind::Mutable | AttrKind::Nested | AttrKind::List | AttrKind::Map => {
            match owner.filter(|&sid| state::declared_attr(rt, sid, &key) == Some(id)) {
                Some(sid) => state::write_local(rt, sid, &key, value),
                None => store(rt, id, value),
            }
        }
        AttrKind::Derived | AttrKind::MapKeys | AttrKind::MapSize => Err(StateError::read_only(key)),
        AttrKind::Alias => alias::set(rt, id, value),
        AttrKind::Index => element::index_set(rt, id, value),
        AttrKind::MapKey => element::key_set(rt, id, value),
        AttrKind::Path => path::set(rt, id, value),
    }
}

/// Raw write: wrap, replace, dispose what was owned, notify.
pub(crate) fn store(rt: &Rc<RuntimeInner>, id: AttrId, value: Value) -> Result<()> {
    match kind(rt, id)? {
        AttrKind::Mutable | AttrKind::Nested => store_value(rt, id, value),
        AttrKind::List => list::replace_from(rt, id, value),
        AttrKind::Map => map::replace_from(rt, id, value),
        _ => set(rt, id, value),
    }
}

fn store_value(rt: &Rc<RuntimeInner>, id: AttrId, value: Value) -> Result<()> {
    let (owner, key, unchanged) = {
        let arena = rt.arena.borrow();
        let node = arena.attrs.get(id).ok_or(StateError::Disposed)?;
        let unchanged = matches!(&node.slot, Slot::Value(old) if old.matches(rt, &value));
        (node.owner, node.key.clone(), unchanged)
    };
    if unchanged {
        return Ok(());
    }
    let ctx = WrapCtx {
        parent: owner,
        owner_attr: Some(id),
        schema: owner.and_then(|sid| state::field_schema(rt, sid, &key)),
        mount: Some(key),
    };
    let wrapped = wrap(rt, value, &ctx)?;
    let old = {
        let mut arena = rt.arena.borrow_mut();
        match arena.attrs.get_mut(id).map(|n| &mut n.slot) {
            Some(Slot::Value(slot)) => Some(std::mem::replace(slot, wrapped.clone())),
            _ => None,
        }
    };
    let Some(old) = old else {
        dispose_value(rt, &wrapped, id);
        return Err(StateError::Disposed);
    };
    trace!(attr = %rt.key_of(id), "state.attr.store");
    dispose_value(rt, &old, id);
    rt.enqueue(id);
    Ok(())
}

/// Convert structured plain data into reactive nodes owned by `ctx.owner_attr`.
pub(crate) fn wrap(rt: &Rc<RuntimeInner>, value: Value, ctx: &WrapCtx) -> Result<Stored> {
    let foreign = match &value {
        Value::State(s) => !Rc::ptr_eq(&s.rt, rt),
        Value::List(l) => !Rc::ptr_eq(&l.rt, rt),
        Value::Map(m) => !Rc::ptr_eq(&m.rt, rt),
        Value::Plain(_) => false,
    };
    if foreign {
        return Err(StateError::ForeignRuntime);
    }
    match value {
        Value::Plain(Plain::Object(fields)) => {
            let id = state::build::construct_nested(rt, fields, ctx)?;
            Ok(Stored::State(id))
        }
        Value::Plain(Plain::List(items)) => {
            let key = ctx.mount.clone().unwrap_or_default();
            let id = list::create(rt, key, ctx.parent, ctx.owner_attr, ctx.schema.clone(), items)?;
            Ok(Stored::List(id))
        }
        Value::Plain(Plain::Map(entries)) => {
            let key = ctx.mount.clone().unwrap_or_default();
            let id = map::create(rt, key, ctx.parent, ctx.owner_attr, ctx.schema.clone(), entries)?;
            Ok(Stored::Map(id))
        }
        other => Ok(Stored::capture(rt, &other)),
    }
}

/// Whether the node behind `value` was created by (and belongs to) `by`.
fn owned_by(rt: &Rc<RuntimeInner>, value: &Stored, by: AttrId) -> bool {
    let arena = rt.arena.borrow();
    match value {
        Stored::State(id) => arena
            .states
            .get(*id)
            .is_some_and(|n| n.owner_attr == Some(by)),
        Stored::List(id) => arena
            .attrs
            .get(*id)
            .is_some_and(|n| matches!(&n.slot, Slot::List(list) if list.owner_attr == Some(by))),
        Stored::Map(id) => arena
            .attrs
            .get(*id)
            .is_some_and(|n| matches!(&n.slot, Slot::Map(map) if map.owner_attr == Some(by))),
        Stored::Plain(_) | Stored::Foreign(_) => false,
    }
}

/// Dispose the node behind `value` if `by` owns it.
pub(crate) fn dispose_value(rt: &Rc<RuntimeInner>, value: &Stored, by: AttrId) {
    if !owned_by(rt, value, by) {
        return;
    }
    match value {
        Stored::State(id) => state::dispose_state(rt, *id),
        Stored::List(id) | Stored::Map(id) => dispose(rt, *id),
        Stored::Plain(_) | Stored::Foreign(_) => {}
    }
}

pub(crate) fn is_writable(rt: &Rc<RuntimeInner>, id: AttrId) -> bool {
    match kind(rt, id) {
        Ok(AttrKind::Derived | AttrKind::MapKeys | AttrKind::MapSize) | Err(_) => false,
        Ok(AttrKind::Alias) => alias::is_writable(rt, id),
        Ok(AttrKind::Path) => path::is_writable(rt, id),
        Ok(_) => true,
    }
}

pub(crate) fn subscribe(
    rt: &Rc<RuntimeInner>,
    id: AttrId,
    callback: Callback,
    options: SubscribeOptions,
) -> Result<Subscription> {
    // Initializes lazy attributes (derived values, alias bindings, path
    // wiring) so that later emissions reach this subscriber.
    let initial = rt.untracked(|| current(rt, id))?;
    let source = rt.key_of(id);
    let (registered, timer) = subscription::pace(rt, Rc::clone(&callback), &options, &source);
    let sub = rt.add_subscriber(id, registered)?;
    let guard = Subscription::attr(rt, id, sub, timer);
    if options.immediate {
        rt.untracked(|| rt.guarded(&source, || callback(&initial)));
    }
    Ok(guard)
}

/// Remove `id` and everything it owns.
pub(crate) fn dispose(rt: &Rc<RuntimeInner>, id: AttrId) {
    let Some(node) = rt.arena.borrow_mut().attrs.remove(id) else {
        return;
    };
    trace!(attr = %node.key, "state.attr.dispose");
    let AttrNode {
        slot,
        virtuals,
        subscribers,
        ..
    } = node;
    drop(subscribers);
    for virt in virtuals {
        dispose(rt, virt);
    }
    match slot {
        Slot::Value(value) => dispose_value(rt, &value, id),
        Slot::Derived(node) => derived::teardown(rt, node),
        Slot::Alias(node) => alias::teardown(rt, node),
        Slot::List(node) => list::teardown(rt, node, id),
        Slot::Map(node) => map::teardown(rt, node, id),
        Slot::Index(node) => element::teardown_index(rt, node),
        Slot::MapKey(node) => element::teardown_key(rt, node),
        Slot::Path(node) => path::teardown(rt, node),
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Capability set shared by every attribute handle.
pub trait Attribute {
    fn key(&self) -> String;

    /// Tracked read.
    fn get(&self) -> Result<Value>;

    fn set(&self, value: impl Into<Value>) -> Result<()>;

    fn subscribe(
        &self,
        callback: impl Fn(&Value) + 'static,
        options: SubscribeOptions,
    ) -> Result<Subscription>;

    fn is_writable(&self) -> bool;

    fn dispose(&self);
}

/// Handle to an attribute node.
#[derive(Clone)]
pub struct Attr {
    pub(crate) rt: Rc<RuntimeInner>,
    pub(crate) id: AttrId,
}

impl Attr {
    pub(crate) fn from_parts(rt: Rc<RuntimeInner>, id: AttrId) -> Self {
        Self { rt, id }
    }

    pub fn kind(&self) -> Result<AttrKind> {
        kind(&self.rt, self.id)
    }

    /// Untracked read.
    pub fn peek(&self) -> Result<Value> {
        self.rt.untracked(|| current(&self.rt, self.id))
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.rt.arena.borrow().attrs.contains_key(self.id)
    }

    /// The container the attribute was declared or created in.
    #[must_use]
    pub fn owner(&self) -> Option<State> {
        let owner = self.rt.arena.borrow().attrs.get(self.id)?.owner?;
        Some(State::from_parts(Rc::clone(&self.rt), owner))
    }
}

impl Attribute for Attr {
    fn key(&self) -> String {
        self.rt.key_of(self.id)
    }

    fn get(&self) -> Result<Value> {
        read(&self.rt, self.id)
    }

    fn set(&self, value: impl Into<Value>) -> Result<()> {
        set(&self.rt, self.id, value.into())
    }

    fn subscribe(
        &self,
        callback: impl Fn(&Value) + 'static,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        subscribe(&self.rt, self.id, Rc::new(callback), options)
    }

    fn is_writable(&self) -> bool {
        is_writable(&self.rt, self.id)
    }

    fn dispose(&self) {
        dispose(&self.rt, self.id);
    }
}

impl PartialEq for Attr {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.rt, &other.rt) && self.id == other.id
    }
}

impl Eq for Attr {}

impl fmt::Debug for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attr")
            .field("key", &self.rt.key_of(self.id))
            .field("kind", &self.kind().ok())
            .finish()
    }
}
