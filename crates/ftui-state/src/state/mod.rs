#![forbid(unsafe_code)]

//! State containers.
//!
//! A [`State`] is a named set of attributes built from an initial object.
//! Containers form two kinds of hierarchy:
//!
//! - **nesting**: an object value stored under a key becomes a child
//!   container mounted at that key and owned by the attribute holding it;
//! - **inheritance**: [`State::child`] creates a container whose undeclared
//!   keys resolve to the nearest ancestor declaring them, for reads and
//!   writes alike.
//!
//! Nested containers inherit from the container they are mounted in, so a
//! nested object sees its surroundings' keys.
//!
//! # Invariants
//!
//! 1. Declared keys keep the order of the initial object.
//! 2. Every write to a declared key passes through the container's schema
//!    and validators before it is stored.
//! 3. Disposing a container disposes its attributes, the nested containers
//!    they own, and any path attributes created through it. Inheriting
//!    children outlive their parent and are detached from it.
//!
//! # Failure Modes
//!
//! Every operation on a disposed container returns
//! [`StateError::Disposed`]; reads of disposed nodes never panic.

pub mod accessor;
pub(crate) mod build;
pub mod schema;
pub mod validation;

pub use validation::{ErrorMap, ValidationEvent, ValidationMode};

use std::fmt;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use self::accessor::Accessor;
use self::build::StateBuilder;
use self::schema::Schema;
use self::validation::{Listener, ValidatorFn};
use crate::attribute::{self, Attr, AttrId, AttrKind};
use crate::error::{Result, StateError};
use crate::path::resolve::{self, FinalTarget, WalkOptions, lookup};
use crate::path::{ParsedPath, Preflight, ResolvedPath, parse_path};
use crate::reactive::Runtime;
use crate::reactive::runtime::{BatchGuard, RuntimeInner};
use crate::reactive::subscription::{SubscribeOptions, Subscription};
use crate::registry::Registry;
use crate::value::{FromValue, Plain, Value};

slotmap::new_key_type! {
    pub(crate) struct StateId;
}

pub(crate) struct StateNode {
    pub(crate) keys: IndexMap<String, AttrId>,
    pub(crate) parent: Option<StateId>,
    /// Nested and inheriting children, in creation order.
    pub(crate) children: IndexSet<StateId>,
    /// Key this container is mounted under; `None` for roots and
    /// inheriting children.
    pub(crate) mount: Option<String>,
    /// Attribute (or collection) holding this container as its value.
    pub(crate) owner_attr: Option<AttrId>,
    pub(crate) schema: Option<Rc<dyn Schema>>,
    pub(crate) validators: IndexMap<String, Vec<ValidatorFn>>,
    /// Own issues, keyed by path relative to this container.
    pub(crate) errors: ErrorMap,
    pub(crate) last_view: Option<ErrorMap>,
    pub(crate) listeners: Vec<Listener>,
    pub(crate) registry: Option<Registry>,
    /// Path attributes created through [`State::path`], by canonical path.
    pub(crate) extras: IndexMap<String, AttrId>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// The attribute `sid` itself declares under `key`.
pub(crate) fn declared_attr(rt: &Rc<RuntimeInner>, sid: StateId, key: &str) -> Option<AttrId> {
    rt.arena.borrow().states.get(sid)?.keys.get(key).copied()
}

pub(crate) fn field_schema(rt: &Rc<RuntimeInner>, sid: StateId, key: &str) -> Option<Rc<dyn Schema>> {
    rt.arena.borrow().states.get(sid)?.schema.as_ref()?.field(key)
}

/// Nearest injected registry from `sid` upwards, else the runtime's.
pub(crate) fn registry_of(rt: &Rc<RuntimeInner>, sid: StateId) -> Result<Registry> {
    let arena = rt.arena.borrow();
    let mut cursor = arena.states.get(sid).ok_or(StateError::Disposed)?;
    loop {
        if let Some(registry) = &cursor.registry {
            return Ok(registry.clone());
        }
        match cursor.parent.and_then(|p| arena.states.get(p)) {
            Some(parent) => cursor = parent,
            None => return Ok(rt.registry.clone()),
        }
    }
}

/// Validated write to a key `sid` declares.
pub(crate) fn write_local(rt: &Rc<RuntimeInner>, sid: StateId, key: &str, value: Value) -> Result<()> {
    let (id, validators) = {
        let arena = rt.arena.borrow();
        let node = arena.states.get(sid).ok_or(StateError::Disposed)?;
        let id = *node.keys.get(key).ok_or_else(|| StateError::unknown(key))?;
        (id, node.validators.get(key).cloned().unwrap_or_default())
    };
    let schema = field_schema(rt, sid, key);
    let (value, mut issues) = validation::check(schema.as_deref(), value);
    issues.extend(validation::run_validators(rt, &validators, &value));
    if !issues.is_empty() && rt.config.validation_mode == ValidationMode::Reject {
        debug!(key, issues = issues.len(), "state.write.rejected");
        return Err(StateError::Validation {
            key: key.to_string(),
            errors: validation::group(key, &issues),
        });
    }
    attribute::store(rt, id, value)?;
    validation::replace_errors(rt, sid, key, &issues);
    Ok(())
}

pub(crate) fn dispose_state(rt: &Rc<RuntimeInner>, sid: StateId) {
    let (node, invalid) = {
        let mut arena = rt.arena.borrow_mut();
        let invalid = validation::subtree_has_errors(&arena, sid);
        (arena.states.remove(sid), invalid)
    };
    let Some(node) = node else {
        return;
    };
    let StateNode {
        keys,
        parent,
        children,
        extras,
        listeners,
        ..
    } = node;
    debug!(keys = keys.len(), "state.dispose");

    let parent = parent.filter(|&p| {
        rt.arena
            .borrow_mut()
            .states
            .get_mut(p)
            .is_some_and(|n| n.children.shift_remove(&sid))
    });
    for id in keys.into_values().chain(extras.into_values()) {
        attribute::dispose(rt, id);
    }
    {
        let mut arena = rt.arena.borrow_mut();
        for child in children {
            if let Some(child) = arena.states.get_mut(child) {
                child.parent = None;
            }
        }
    }
    drop(listeners);
    if let Some(parent) = parent.filter(|_| invalid) {
        validation::refresh(rt, parent);
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Result of [`State::track`]: the closure's value and what it read.
#[derive(Debug, Clone)]
pub struct Tracked<R> {
    pub value: R,
    pub deps: Vec<Attr>,
}

/// Handle to a container. Clones refer to the same container.
#[derive(Clone)]
pub struct State {
    pub(crate) rt: Rc<RuntimeInner>,
    pub(crate) id: StateId,
}

impl State {
    pub(crate) fn from_parts(rt: Rc<RuntimeInner>, id: StateId) -> Self {
        Self { rt, id }
    }

    /// Build a root container on a fresh runtime.
    ///
    /// ```
    /// use ftui_state::{State, Value};
    /// use serde_json::json;
    ///
    /// let state = State::new(json!({"user": {"name": "Ada"}})).unwrap();
    /// state.set("user.name", "Grace").unwrap();
    /// assert_eq!(state.get("user.name").unwrap(), Value::from("Grace"));
    /// ```
    pub fn new(initial: impl Into<Plain>) -> Result<Self> {
        Self::builder(initial).build()
    }

    pub fn builder(initial: impl Into<Plain>) -> StateBuilder {
        StateBuilder::new(initial.into())
    }

    /// Create a container inheriting from this one.
    pub fn child(&self, initial: impl Into<Plain>) -> Result<State> {
        Self::builder(initial).parent(self).build()
    }

    #[must_use]
    pub fn runtime(&self) -> Runtime {
        Runtime::from_inner(Rc::clone(&self.rt))
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(StateError::Disposed)
        }
    }

    fn walk_options(track: bool) -> WalkOptions {
        WalkOptions {
            track,
            ..WalkOptions::default()
        }
    }

    // -- Access ------------------------------------------------------------

    /// Tracked read of `path`. Every attribute crossed is reported to the
    /// active collector.
    pub fn get(&self, path: &str) -> Result<Value> {
        let parsed = parse_path(path)?;
        if parsed.is_simple() {
            let id = lookup(&self.rt, self.id, &parsed.top, None)?;
            return attribute::read(&self.rt, id);
        }
        match resolve::walk(&self.rt, self.id, &parsed, Self::walk_options(true)).outcome? {
            FinalTarget::Attr(id) => attribute::read(&self.rt, id),
            target => target.current(&self.rt),
        }
    }

    /// [`get`](Self::get) converted to `T`.
    pub fn get_as<T: FromValue>(&self, path: &str) -> Result<T> {
        let value = self.get(path)?;
        T::from_value(&value).ok_or_else(|| StateError::TypeMismatch {
            key: path.to_string(),
            expected: T::EXPECTED,
        })
    }

    /// Write through `path`. Undeclared top-level keys write to the
    /// ancestor that declares them.
    pub fn set(&self, path: &str, value: impl Into<Value>) -> Result<()> {
        let parsed = parse_path(path)?;
        let value = value.into();
        if parsed.is_simple() {
            let id = lookup(&self.rt, self.id, &parsed.top, None)?;
            return attribute::set(&self.rt, id, value);
        }
        let target = self.rt.untracked(|| {
            resolve::walk(&self.rt, self.id, &parsed, Self::walk_options(false)).outcome
        })?;
        target.write(&self.rt, value)
    }

    /// Attribute addressed by `path`. A terminal index or key materializes
    /// a virtual attribute on its collection.
    pub fn attr(&self, path: &str) -> Result<Attr> {
        let parsed = parse_path(path)?;
        if parsed.is_simple() {
            let id = lookup(&self.rt, self.id, &parsed.top, None)?;
            return Ok(Attr::from_parts(Rc::clone(&self.rt), id));
        }
        Ok(self.resolve_parsed(&parsed)?.target)
    }

    pub fn resolve(&self, path: &str) -> Result<ResolvedPath> {
        self.resolve_parsed(&parse_path(path)?)
    }

    fn resolve_parsed(&self, parsed: &ParsedPath) -> Result<ResolvedPath> {
        self.rt
            .untracked(|| resolve::resolve(&self.rt, self.id, parsed))
    }

    /// Kind of attribute `path` ends in, without creating anything.
    pub fn classify(&self, path: &str) -> Result<AttrKind> {
        let parsed = parse_path(path)?;
        self.rt
            .untracked(|| resolve::classify(&self.rt, self.id, &parsed))
    }

    /// Segment-by-segment report on whether `path` resolves. Only syntax
    /// errors fail; resolution failures are part of the report.
    pub fn preflight(&self, path: &str) -> Result<Preflight> {
        let parsed = parse_path(path)?;
        self.ensure_alive()?;
        Ok(self
            .rt
            .untracked(|| resolve::preflight(&self.rt, self.id, &parsed)))
    }

    /// A path attribute for `path`, living as long as this container.
    ///
    /// Asking again for the same path returns the same attribute.
    pub fn path(&self, path: &str) -> Result<Attr> {
        let parsed = parse_path(path)?;
        let canonical = parsed.to_string();
        let existing = {
            let arena = self.rt.arena.borrow();
            let node = arena.states.get(self.id).ok_or(StateError::Disposed)?;
            node.extras
                .get(&canonical)
                .copied()
                .filter(|id| arena.attrs.contains_key(*id))
        };
        if let Some(id) = existing {
            return Ok(Attr::from_parts(Rc::clone(&self.rt), id));
        }
        let id = attribute::path::create(&self.rt, self.id, parsed, None)?;
        if let Some(node) = self.rt.arena.borrow_mut().states.get_mut(self.id) {
            node.extras.insert(canonical, id);
        }
        Ok(Attr::from_parts(Rc::clone(&self.rt), id))
    }

    /// Subscribe to `path`. Multi-segment paths follow structural
    /// replacement of every intermediate.
    pub fn on(
        &self,
        path: &str,
        callback: impl Fn(&Value) + 'static,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        let parsed = parse_path(path)?;
        if parsed.is_simple() {
            let id = lookup(&self.rt, self.id, &parsed.top, None)?;
            return attribute::subscribe(&self.rt, id, Rc::new(callback), options);
        }
        let id = attribute::path::create(&self.rt, self.id, parsed, None)?;
        match attribute::subscribe(&self.rt, id, Rc::new(callback), options) {
            Ok(sub) => Ok(sub.owning(id)),
            Err(err) => {
                attribute::dispose(&self.rt, id);
                Err(err)
            }
        }
    }

    /// Run `f`, recording which attributes it reads.
    pub fn track<R>(&self, f: impl FnOnce() -> R) -> Tracked<R> {
        let (value, deps) = self.rt.record(f);
        Tracked {
            value,
            deps: deps
                .into_iter()
                .map(|id| Attr::from_parts(Rc::clone(&self.rt), id))
                .collect(),
        }
    }

    /// Run `f` with notifications coalesced until the outermost batch exits.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let _batch = BatchGuard::enter(&self.rt);
        f()
    }

    // -- Structure ---------------------------------------------------------

    /// Declared keys in declaration order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.rt
            .arena
            .borrow()
            .states
            .get(self.id)
            .map(|n| n.keys.keys().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn declares(&self, key: &str) -> bool {
        declared_attr(&self.rt, self.id, key).is_some()
    }

    #[must_use]
    pub fn parent(&self) -> Option<State> {
        let parent = self.rt.arena.borrow().states.get(self.id)?.parent?;
        Some(Self::from_parts(Rc::clone(&self.rt), parent))
    }

    #[must_use]
    pub fn children(&self) -> Vec<State> {
        let arena = self.rt.arena.borrow();
        arena
            .states
            .get(self.id)
            .map(|n| {
                n.children
                    .iter()
                    .map(|&c| Self::from_parts(Rc::clone(&self.rt), c))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Key this container is mounted under, for nested containers.
    #[must_use]
    pub fn mount(&self) -> Option<String> {
        self.rt.arena.borrow().states.get(self.id)?.mount.clone()
    }

    /// Registry used for alias expressions and transforms.
    pub fn registry(&self) -> Result<Registry> {
        registry_of(&self.rt, self.id)
    }

    // -- Lifecycle ---------------------------------------------------------

    /// Detached copy of the declared keys. Derived values that fail to
    /// compute appear as null.
    #[must_use]
    pub fn snapshot(&self) -> Plain {
        let ids: Vec<(String, AttrId)> = self
            .rt
            .arena
            .borrow()
            .states
            .get(self.id)
            .map(|n| n.keys.iter().map(|(k, &id)| (k.clone(), id)).collect())
            .unwrap_or_default();
        self.rt.untracked(|| {
            Plain::Object(
                ids.into_iter()
                    .map(|(key, id)| {
                        let value = attribute::current(&self.rt, id).unwrap_or_default();
                        (key, value.to_plain())
                    })
                    .collect(),
            )
        })
    }

    pub fn dispose(&self) {
        dispose_state(&self.rt, self.id);
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.rt.arena.borrow().states.contains_key(self.id)
    }

    /// Typed handle on one declared key.
    pub fn accessor<T: FromValue>(&self, key: &str) -> Result<Accessor<T>> {
        Accessor::new(self, key)
    }

    // -- Validation --------------------------------------------------------

    /// Listen for changes of this container's error view.
    pub fn on_validation_change(
        &self,
        callback: impl Fn(&ValidationEvent) + 'static,
    ) -> Result<Subscription> {
        validation::add_listener(&self.rt, self.id, Rc::new(callback))
    }

    /// Messages recorded for `path`, relative to this container.
    #[must_use]
    pub fn schema_errors(&self, path: &str) -> Vec<String> {
        let arena = self.rt.arena.borrow();
        validation::view(&arena, self.id)
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn all_schema_errors(&self) -> ErrorMap {
        validation::view(&self.rt.arena.borrow(), self.id)
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.all_schema_errors().is_empty()
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.rt, &other.rt) && self.id == other.id
    }
}

impl Eq for State {}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("State");
        out.field("keys", &self.keys());
        if let Some(mount) = self.mount() {
            out.field("mount", &mount);
        }
        out.field("alive", &self.is_alive()).finish()
    }
}
