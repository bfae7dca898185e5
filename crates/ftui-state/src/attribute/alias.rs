#![forbid(unsafe_code)]

//! Alias attributes: forward reads and writes to another attribute.
//!
//! The alias expression is matched when the container is built, but the
//! target attribute is bound on first use. Binding looks the target up
//! from the alias's own container while skipping the alias itself, so
//! `{name}` declared on a child forwards to the nearest ancestor's `name`.
//! Multi-segment targets bind to a private path attribute that rewires as
//! the chain changes.
//!
//! Once bound, the alias holds a single forwarding subscription on its
//! target and re-emits whenever the target does. Values are transformed at
//! delivery time, and transforms are looked up by name on every call.
//!
//! # Failure Modes
//!
//! - Alias cycles (`a -> b -> a`) are detected while evaluating and fail
//!   with [`StateError::SelfAlias`].
//! - A transform without a `write` half makes the alias read-only.

use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use tracing::trace;

use super::{AttrId, Slot};
use crate::error::{Result, StateError};
use crate::expr::{AliasTarget, TransformCall};
use crate::path::parse_path;
use crate::path::resolve::lookup;
use crate::reactive::diagnostics::panic_message;
use crate::reactive::runtime::{Callback, RuntimeInner};
use crate::registry::Registry;
use crate::state;
use crate::value::Value;

struct Binding {
    target: AttrId,
    /// Whether `target` is a path attribute created for this alias.
    owned: bool,
    forward: u64,
}

pub(crate) struct AliasNode {
    expr: AliasTarget,
    binding: Option<Binding>,
    active: bool,
}

impl AliasNode {
    pub(crate) fn new(expr: AliasTarget) -> Self {
        Self {
            expr,
            binding: None,
            active: false,
        }
    }
}

/// Clears the alias's `active` flag when evaluation ends.
struct ActiveGuard<'a> {
    rt: &'a Rc<RuntimeInner>,
    id: AttrId,
}

impl<'a> ActiveGuard<'a> {
    fn enter(rt: &'a Rc<RuntimeInner>, id: AttrId) -> Result<Self> {
        let mut arena = rt.arena.borrow_mut();
        let node = arena.attrs.get_mut(id).ok_or(StateError::Disposed)?;
        let key = node.key.clone();
        let Slot::Alias(alias) = &mut node.slot else {
            return Err(StateError::Disposed);
        };
        if alias.active {
            return Err(StateError::SelfAlias { key });
        }
        alias.active = true;
        Ok(Self { rt, id })
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Some(node) = self.rt.arena.borrow_mut().attrs.get_mut(self.id) {
            if let Slot::Alias(alias) = &mut node.slot {
                alias.active = false;
            }
        }
    }
}

struct Bound {
    target: AttrId,
    transforms: Vec<TransformCall>,
    registry: Registry,
    key: String,
}

fn ensure(rt: &Rc<RuntimeInner>, id: AttrId) -> Result<Bound> {
    let (owner, expr, bound, key) = {
        let arena = rt.arena.borrow();
        let node = arena.attrs.get(id).ok_or(StateError::Disposed)?;
        let Slot::Alias(alias) = &node.slot else {
            return Err(StateError::Disposed);
        };
        (
            node.owner,
            alias.expr.clone(),
            alias.binding.as_ref().map(|b| b.target),
            node.key.clone(),
        )
    };
    let owner = owner.ok_or(StateError::Disposed)?;
    let registry = state::registry_of(rt, owner)?;
    if let Some(target) = bound {
        return Ok(Bound {
            target,
            transforms: expr.transforms,
            registry,
            key,
        });
    }

    let parsed = parse_path(&expr.path)?;
    let (target, owned) = if parsed.is_simple() {
        match lookup(rt, owner, &parsed.top, Some(id)) {
            Ok(target) => (target, false),
            Err(StateError::UnknownProperty { .. }) if parsed.top == key => {
                return Err(StateError::SelfAlias { key });
            }
            Err(err) => return Err(err),
        }
    } else {
        (super::path::create(rt, owner, parsed, Some(id))?, true)
    };

    let weak = Rc::downgrade(rt);
    let forward: Callback = Rc::new(move |_: &Value| {
        if let Some(rt) = weak.upgrade() {
            rt.enqueue(id);
        }
    });
    let forward = match rt.add_subscriber(target, forward) {
        Ok(sub) => sub,
        Err(err) => {
            if owned {
                super::dispose(rt, target);
            }
            return Err(err);
        }
    };
    trace!(alias = %key, target = %rt.key_of(target), "state.alias.bind");
    if let Some(node) = rt.arena.borrow_mut().attrs.get_mut(id) {
        if let Slot::Alias(alias) = &mut node.slot {
            alias.binding = Some(Binding {
                target,
                owned,
                forward,
            });
        }
    }
    Ok(Bound {
        target,
        transforms: expr.transforms,
        registry,
        key,
    })
}

fn apply(
    rt: &Rc<RuntimeInner>,
    name: &str,
    f: impl FnOnce() -> Result<Value>,
) -> Result<Value> {
    match rt.untracked(|| panic::catch_unwind(AssertUnwindSafe(f))) {
        Ok(result) => result,
        Err(payload) => Err(StateError::Transform {
            name: name.to_string(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

pub(crate) fn current(rt: &Rc<RuntimeInner>, id: AttrId) -> Result<Value> {
    let _active = ActiveGuard::enter(rt, id)?;
    let bound = ensure(rt, id)?;
    let mut value = super::current(rt, bound.target)?;
    for call in &bound.transforms {
        let transform = bound.registry.transform_or_err(&call.name)?;
        value = apply(rt, &call.name, || transform.read(&value, &call.args))?;
    }
    Ok(value)
}

pub(crate) fn set(rt: &Rc<RuntimeInner>, id: AttrId, value: Value) -> Result<()> {
    let _active = ActiveGuard::enter(rt, id)?;
    let bound = ensure(rt, id)?;
    if !super::is_writable(rt, bound.target) {
        return Err(StateError::read_only(bound.key));
    }
    let mut value = value;
    for call in bound.transforms.iter().rev() {
        let transform = bound.registry.transform_or_err(&call.name)?;
        if !transform.is_writable() {
            return Err(StateError::read_only(bound.key));
        }
        value = apply(rt, &call.name, || {
            transform
                .write(&value, &call.args)
                .unwrap_or_else(|| Err(StateError::read_only(call.name.clone())))
        })?;
    }
    super::set(rt, bound.target, value)
}

pub(crate) fn is_writable(rt: &Rc<RuntimeInner>, id: AttrId) -> bool {
    let Ok(_active) = ActiveGuard::enter(rt, id) else {
        return false;
    };
    let Ok(bound) = ensure(rt, id) else {
        return false;
    };
    bound.transforms.iter().all(|call| {
        bound
            .registry
            .transform(&call.name)
            .is_some_and(|t| t.is_writable())
    }) && super::is_writable(rt, bound.target)
}

pub(crate) fn teardown(rt: &Rc<RuntimeInner>, node: AliasNode) {
    if let Some(binding) = node.binding {
        rt.remove_subscriber(binding.target, binding.forward);
        if binding.owned {
            super::dispose(rt, binding.target);
        }
    }
}
