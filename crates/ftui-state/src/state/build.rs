#![forbid(unsafe_code)]

//! Container construction.
//!
//! # Design
//!
//! A container is built from an initial object in three passes:
//!
//! 1. **concrete** fields: scalars, nested objects, lists and maps are
//!    wrapped and checked against the schema;
//! 2. **aliases**: string fields of the form `{expr}` are matched against
//!    the registry and become alias attributes (bound lazily);
//! 3. **computed** fields registered on the builder become derived
//!    attributes (evaluated lazily).
//!
//! Aliases and computed values may refer to any concrete key, which is why
//! they come last. The declared key order is the order of the initial
//! object, with builder-registered maps and computed keys appended.
//!
//! # Failure Modes
//!
//! - A non-object initial value fails with [`StateError::NotAnObject`].
//! - An unrecognized alias expression fails the whole construction; the
//!   partially built container is disposed.
//! - In [`ValidationMode::Reject`](super::ValidationMode::Reject), invalid
//!   initial values fail with [`StateError::Validation`].

use std::fmt;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use super::schema::{Schema, SchemaIssue};
use super::validation::{self, ValidationMode, ValidatorFn};
use super::{State, StateId, StateNode};
use crate::attribute::alias::AliasNode;
use crate::attribute::derived::{ComputeFn, ContainerFn, DerivedNode};
use crate::attribute::{self, AttrNode, Slot, WrapCtx};
use crate::error::{Result, StateError};
use crate::expr::alias_body;
use crate::reactive::Runtime;
use crate::reactive::runtime::RuntimeInner;
use crate::registry::Registry;
use crate::value::{Plain, Stored, Value};

/// Everything needed to construct one container.
#[derive(Default)]
pub(crate) struct Blueprint {
    pub(crate) fields: IndexMap<String, Plain>,
    pub(crate) computed: IndexMap<String, ContainerFn>,
    pub(crate) validators: IndexMap<String, Vec<ValidatorFn>>,
    pub(crate) schema: Option<Rc<dyn Schema>>,
    pub(crate) registry: Option<Registry>,
    pub(crate) parent: Option<StateId>,
    pub(crate) mount: Option<String>,
    pub(crate) owner_attr: Option<attribute::AttrId>,
}

/// Build a nested container for a wrapped object value.
pub(crate) fn construct_nested(
    rt: &Rc<RuntimeInner>,
    fields: IndexMap<String, Plain>,
    ctx: &WrapCtx,
) -> Result<StateId> {
    construct(
        rt,
        Blueprint {
            fields,
            schema: ctx.schema.clone(),
            parent: ctx.parent,
            mount: ctx.mount.clone(),
            owner_attr: ctx.owner_attr,
            ..Blueprint::default()
        },
    )
}

pub(crate) fn construct(rt: &Rc<RuntimeInner>, blueprint: Blueprint) -> Result<StateId> {
    let Blueprint {
        fields,
        computed,
        validators,
        schema,
        registry,
        parent,
        mount,
        owner_attr,
    } = blueprint;

    let sid = {
        let mut arena = rt.arena.borrow_mut();
        if let Some(parent) = parent {
            if !arena.states.contains_key(parent) {
                return Err(StateError::Disposed);
            }
        }
        let sid = arena.states.insert(StateNode {
            keys: IndexMap::new(),
            parent,
            children: IndexSet::new(),
            mount,
            owner_attr,
            schema: schema.clone(),
            validators,
            errors: IndexMap::new(),
            last_view: None,
            listeners: Vec::new(),
            registry,
            extras: IndexMap::new(),
        });
        if let Some(parent) = parent.and_then(|p| arena.states.get_mut(p)) {
            parent.children.insert(sid);
        }
        sid
    };

    match populate(rt, sid, fields, computed, schema.as_deref()) {
        Ok(()) => {
            let (keys, invalid) = rt
                .arena
                .borrow()
                .states
                .get(sid)
                .map_or((0, false), |n| (n.keys.len(), !n.errors.is_empty()));
            debug!(keys, invalid, "state.construct");
            // Nested children refreshed on their own when they were built.
            if invalid {
                validation::refresh(rt, sid);
            }
            Ok(sid)
        }
        Err(err) => {
            super::dispose_state(rt, sid);
            Err(err)
        }
    }
}

fn declare(rt: &Rc<RuntimeInner>, sid: StateId, key: &str, id: attribute::AttrId) {
    if let Some(node) = rt.arena.borrow_mut().states.get_mut(sid) {
        node.keys.insert(key.to_string(), id);
    }
}

fn populate(
    rt: &Rc<RuntimeInner>,
    sid: StateId,
    fields: IndexMap<String, Plain>,
    computed: IndexMap<String, ContainerFn>,
    schema: Option<&dyn Schema>,
) -> Result<()> {
    let order: Vec<String> = fields
        .keys()
        .chain(computed.keys())
        .cloned()
        .collect();
    let mut aliases = Vec::new();
    let mut errors: Vec<(String, Vec<SchemaIssue>)> = Vec::new();

    // Pass 1: concrete values.
    for (key, plain) in fields {
        if let Some(body) = plain.as_str().and_then(alias_body) {
            aliases.push((key, body.to_string()));
            continue;
        }
        let field_schema = schema.and_then(|s| s.field(&key));
        let (value, mut issues) = validation::check(field_schema.as_deref(), Value::Plain(plain));
        let validators = rt
            .arena
            .borrow()
            .states
            .get(sid)
            .and_then(|n| n.validators.get(&key).cloned())
            .unwrap_or_default();
        issues.extend(validation::run_validators(rt, &validators, &value));
        if !issues.is_empty() {
            if rt.config.validation_mode == ValidationMode::Reject {
                return Err(StateError::Validation {
                    errors: validation::group(&key, &issues),
                    key,
                });
            }
            errors.push((key.clone(), issues));
        }
        let id = concrete(rt, sid, &key, value, field_schema)?;
        declare(rt, sid, &key, id);
    }

    // Pass 2: aliases.
    if !aliases.is_empty() {
        let registry = super::registry_of(rt, sid)?;
        for (key, body) in aliases {
            let target = registry.match_alias(&body)?;
            let id = attribute::insert(
                rt,
                AttrNode::new(key.clone(), Some(sid), Slot::Alias(AliasNode::new(target))),
            );
            declare(rt, sid, &key, id);
        }
    }

    // Pass 3: computed values.
    for (key, f) in computed {
        let id = attribute::insert(
            rt,
            AttrNode::new(
                key.clone(),
                Some(sid),
                Slot::Derived(DerivedNode::new(ComputeFn::Container(f))),
            ),
        );
        declare(rt, sid, &key, id);
    }

    let mut arena = rt.arena.borrow_mut();
    let node = arena.states.get_mut(sid).ok_or(StateError::Disposed)?;
    let mut keys = std::mem::take(&mut node.keys);
    for key in &order {
        if let Some(id) = keys.shift_remove(key) {
            node.keys.insert(key.clone(), id);
        }
    }
    for (key, issues) in errors {
        node.errors.extend(validation::group(&key, &issues));
    }
    Ok(())
}

/// Create the attribute for one concrete field. Lists and maps *are* their
/// attribute; objects are wrapped into a value slot that owns the child.
fn concrete(
    rt: &Rc<RuntimeInner>,
    sid: StateId,
    key: &str,
    value: Value,
    schema: Option<Rc<dyn Schema>>,
) -> Result<attribute::AttrId> {
    match value {
        Value::Plain(Plain::List(items)) => {
            attribute::list::create(rt, key.to_string(), Some(sid), None, schema, items)
        }
        Value::Plain(Plain::Map(entries)) => {
            attribute::map::create(rt, key.to_string(), Some(sid), None, schema, entries)
        }
        value => {
            let id = attribute::insert(rt, AttrNode::new(key, Some(sid), Slot::Value(Stored::default())));
            let ctx = WrapCtx {
                parent: Some(sid),
                owner_attr: Some(id),
                mount: Some(key.to_string()),
                schema,
            };
            match attribute::wrap(rt, value, &ctx) {
                Ok(wrapped) => {
                    if let Some(node) = rt.arena.borrow_mut().attrs.get_mut(id) {
                        node.slot = Slot::Value(wrapped);
                    }
                    Ok(id)
                }
                Err(err) => {
                    attribute::dispose(rt, id);
                    Err(err)
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Public builder
// ---------------------------------------------------------------------------

/// Configures and constructs a root or inheriting [`State`].
///
/// ```
/// use ftui_state::{State, Value};
/// use serde_json::json;
///
/// let state = State::builder(json!({"a": 1, "b": 2}))
///     .computed("sum", |s| Ok(Value::from(s.get_as::<f64>("a")? + s.get_as::<f64>("b")?)))
///     .build()
///     .unwrap();
/// assert_eq!(state.get("sum").unwrap(), Value::from(3));
/// ```
#[must_use]
pub struct StateBuilder {
    initial: Plain,
    computed: IndexMap<String, ContainerFn>,
    maps: IndexMap<String, IndexMap<String, Plain>>,
    validators: IndexMap<String, Vec<ValidatorFn>>,
    schema: Option<Rc<dyn Schema>>,
    parent: Option<State>,
    runtime: Option<Runtime>,
    registry: Option<Registry>,
}

impl StateBuilder {
    pub(crate) fn new(initial: Plain) -> Self {
        Self {
            initial,
            computed: IndexMap::new(),
            maps: IndexMap::new(),
            validators: IndexMap::new(),
            schema: None,
            parent: None,
            runtime: None,
            registry: None,
        }
    }

    /// Declare a derived key computed from this container.
    pub fn computed(
        mut self,
        key: impl Into<String>,
        f: impl Fn(&State) -> Result<Value> + 'static,
    ) -> Self {
        self.computed.insert(key.into(), Rc::new(f));
        self
    }

    /// Declare an associative-collection key. JSON objects in the initial
    /// value become nested containers; maps are declared here.
    pub fn map<K, V>(mut self, key: impl Into<String>, entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Plain>,
    {
        self.maps.insert(
            key.into(),
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn schema(mut self, schema: Rc<dyn Schema>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Add a custom check for writes to `key`. Multiple validators per key
    /// run in registration order.
    pub fn validator(
        mut self,
        key: impl Into<String>,
        f: impl Fn(&Value) -> std::result::Result<(), String> + 'static,
    ) -> Self {
        self.validators
            .entry(key.into())
            .or_default()
            .push(Rc::new(f));
        self
    }

    /// Inherit from `parent`: undeclared keys read and write through to it.
    pub fn parent(mut self, parent: &State) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Share an existing runtime. Defaults to the parent's, or a fresh one.
    pub fn runtime(mut self, runtime: &Runtime) -> Self {
        self.runtime = Some(runtime.clone());
        self
    }

    /// Resolve alias expressions and transforms through `registry` instead
    /// of the runtime's.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<State> {
        let Plain::Object(mut fields) = self.initial else {
            return Err(StateError::NotAnObject);
        };
        let rt = match (&self.parent, &self.runtime) {
            (Some(parent), Some(runtime)) if !Rc::ptr_eq(&parent.rt, &runtime.inner) => {
                return Err(StateError::ForeignRuntime);
            }
            (Some(parent), _) => Rc::clone(&parent.rt),
            (None, Some(runtime)) => Rc::clone(&runtime.inner),
            (None, None) => Runtime::new().inner,
        };
        for (key, entries) in self.maps {
            fields.insert(key, Plain::Map(entries));
        }
        for key in self.computed.keys() {
            fields.shift_remove(key);
        }
        let sid = construct(
            &rt,
            Blueprint {
                fields,
                computed: self.computed,
                validators: self.validators,
                schema: self.schema,
                registry: self.registry,
                parent: self.parent.as_ref().map(|p| p.id),
                mount: None,
                owner_attr: None,
            },
        )?;
        Ok(State::from_parts(rt, sid))
    }
}

impl fmt::Debug for StateBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateBuilder")
            .field("initial", &self.initial)
            .field("computed", &self.computed.keys().collect::<Vec<_>>())
            .field("maps", &self.maps.keys().collect::<Vec<_>>())
            .field("schema", &self.schema.is_some())
            .field("parent", &self.parent.is_some())
            .finish()
    }
}
