#![forbid(unsafe_code)]

//! Value model: detached [`Plain`] data and the reactive [`Value`] variant.
//!
//! # Design
//!
//! Everything written into the engine arrives as a [`Value`]. Structured
//! plain data (`Object`, `List`, `Map`) is converted into reactive nodes at
//! the insertion point (see `attribute::wrap`), so a value read back out of a
//! container is either a scalar [`Plain`] or a handle to a live node.
//!
//! # Invariants
//!
//! 1. Plain values compare by value; handles compare by identity.
//! 2. `Plain::Object` wraps into a nested container, `Plain::Map` into an
//!    associative collection, `Plain::List` into an ordered collection.
//! 3. `to_plain()` never fails: a disposed handle snapshots as `Null`.
//! 4. Values kept in a runtime's arena ([`Stored`]) refer to that runtime's
//!    own nodes by id only; dropping the last outside handle frees the arena.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::attribute::AttrId;
use crate::attribute::list::List;
use crate::attribute::map::Map;
use crate::reactive::runtime::RuntimeInner;
use crate::state::{State, StateId};

/// Detached structured data.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Plain {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Plain>),
    /// Becomes a nested container when wrapped.
    Object(IndexMap<String, Plain>),
    /// Becomes an associative collection when wrapped.
    Map(IndexMap<String, Plain>),
}

impl Plain {
    /// Build an associative-collection value.
    #[must_use]
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Plain)>) -> Self {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Build a nested-container value.
    #[must_use]
    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Plain)>) -> Self {
        Self::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Whether wrapping this value allocates a reactive node.
    #[must_use]
    pub fn is_structured(&self) -> bool {
        matches!(self, Self::List(_) | Self::Object(_) | Self::Map(_))
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Truthiness used by boolean transforms: null, false, 0, NaN and the
    /// empty string are falsy; everything else is truthy.
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::String(s) => !s.is_empty(),
            Self::List(_) | Self::Object(_) | Self::Map(_) => true,
        }
    }

    /// Render as JSON. Associative collections render as objects; numbers
    /// with no fractional part render as integers.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => number_to_json(*n),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => serde_json::Value::Array(items.iter().map(Plain::to_json).collect()),
            Self::Object(fields) | Self::Map(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for Plain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<serde_json::Value> for Plain {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Plain::from).collect())
            }
            serde_json::Value::Object(fields) => Self::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Plain::from(v)))
                    .collect(),
            ),
        }
    }
}

macro_rules! plain_from_number {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Plain {
            fn from(n: $ty) -> Self {
                Self::Number(n as f64)
            }
        })*
    };
}

plain_from_number!(i32, i64, u32, u64, usize, f32, f64);

impl From<bool> for Plain {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Plain {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Plain {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<Plain>> for Plain {
    fn from(items: Vec<Plain>) -> Self {
        Self::List(items)
    }
}

// ---------------------------------------------------------------------------
// Reactive value
// ---------------------------------------------------------------------------

/// A value read from or written to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Plain(Plain),
    State(State),
    List(List),
    Map(Map),
}

impl Default for Value {
    fn default() -> Self {
        Self::Plain(Plain::Null)
    }
}

impl Value {
    #[must_use]
    pub fn null() -> Self {
        Self::Plain(Plain::Null)
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Plain(Plain::Null))
    }

    #[must_use]
    pub fn as_plain(&self) -> Option<&Plain> {
        match self {
            Self::Plain(p) => Some(p),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        self.as_plain().and_then(Plain::as_f64)
    }

    /// Integral view of a number; fractional numbers yield `None`.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        self.as_f64()
            .filter(|n| n.fract() == 0.0)
            .map(|n| n as i64)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        self.as_plain().and_then(Plain::as_bool)
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.as_plain().and_then(Plain::as_str)
    }

    #[must_use]
    pub fn as_state(&self) -> Option<&State> {
        match self {
            Self::State(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&List> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Self::Plain(p) => p.truthy(),
            _ => true,
        }
    }

    /// Deep, untracked snapshot.
    #[must_use]
    pub fn to_plain(&self) -> Plain {
        match self {
            Self::Plain(p) => p.clone(),
            Self::State(s) => s.snapshot(),
            Self::List(l) => l.to_plain(),
            Self::Map(m) => m.to_plain(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_plain())
    }
}

macro_rules! value_from_plain {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Self::Plain(v.into())
            }
        })*
    };
}

value_from_plain!(
    bool,
    i32,
    i64,
    u32,
    u64,
    usize,
    f32,
    f64,
    &str,
    String,
    Vec<Plain>,
    serde_json::Value
);

impl From<Plain> for Value {
    fn from(p: Plain) -> Self {
        Self::Plain(p)
    }
}

impl From<State> for Value {
    fn from(s: State) -> Self {
        Self::State(s)
    }
}

impl From<List> for Value {
    fn from(l: List) -> Self {
        Self::List(l)
    }
}

impl From<Map> for Value {
    fn from(m: Map) -> Self {
        Self::Map(m)
    }
}

// ---------------------------------------------------------------------------
// Arena form
// ---------------------------------------------------------------------------

/// A [`Value`] as kept inside the arena of the runtime that owns it.
///
/// Handles carry a strong reference to their runtime, so holding one in that
/// runtime's own arena would keep the arena alive forever. Handles of the
/// holding runtime are therefore stored as bare ids and re-hydrated with
/// [`Stored::load`] on the way out.
#[derive(Clone, PartialEq)]
pub(crate) enum Stored {
    Plain(Plain),
    State(StateId),
    List(AttrId),
    Map(AttrId),
    /// Handle into another runtime. Only computed results and parked timer
    /// values can hold one; writes reject them.
    Foreign(Value),
}

impl Default for Stored {
    fn default() -> Self {
        Self::Plain(Plain::Null)
    }
}

impl Stored {
    /// Arena form of `value` as held by `rt`.
    pub(crate) fn capture(rt: &Rc<RuntimeInner>, value: &Value) -> Self {
        match value {
            Value::Plain(p) => Self::Plain(p.clone()),
            Value::State(s) if Rc::ptr_eq(&s.rt, rt) => Self::State(s.id),
            Value::List(l) if Rc::ptr_eq(&l.rt, rt) => Self::List(l.id),
            Value::Map(m) if Rc::ptr_eq(&m.rt, rt) => Self::Map(m.id),
            other => Self::Foreign(other.clone()),
        }
    }

    /// Handle form, bound to `rt`.
    pub(crate) fn load(&self, rt: &Rc<RuntimeInner>) -> Value {
        match self {
            Self::Plain(p) => Value::Plain(p.clone()),
            Self::State(id) => Value::State(State::from_parts(Rc::clone(rt), *id)),
            Self::List(id) => Value::List(List::from_parts(Rc::clone(rt), *id)),
            Self::Map(id) => Value::Map(Map::from_parts(Rc::clone(rt), *id)),
            Self::Foreign(v) => v.clone(),
        }
    }

    /// Same comparison `Value` uses: plain by value, handles by identity.
    pub(crate) fn matches(&self, rt: &Rc<RuntimeInner>, value: &Value) -> bool {
        match (self, value) {
            (Self::Plain(a), Value::Plain(b)) => a == b,
            (Self::Foreign(a), b) => a == b,
            (_, Value::Plain(_)) => false,
            (stored, value) => *stored == Self::capture(rt, value),
        }
    }

    pub(crate) fn to_plain(&self, rt: &Rc<RuntimeInner>) -> Plain {
        match self {
            Self::Plain(p) => p.clone(),
            other => other.load(rt).to_plain(),
        }
    }
}

impl fmt::Debug for Stored {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(p) => f.debug_tuple("Plain").field(p).finish(),
            Self::State(id) => f.debug_tuple("State").field(id).finish(),
            Self::List(id) => f.debug_tuple("List").field(id).finish(),
            Self::Map(id) => f.debug_tuple("Map").field(id).finish(),
            Self::Foreign(v) => f.debug_tuple("Foreign").field(v).finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed extraction
// ---------------------------------------------------------------------------

/// Conversion out of a [`Value`], used by typed accessors.
pub trait FromValue: Sized {
    /// Human-readable type name for mismatch errors.
    const EXPECTED: &'static str;

    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for Value {
    const EXPECTED: &'static str = "any value";

    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromValue for Plain {
    const EXPECTED: &'static str = "any value";

    fn from_value(value: &Value) -> Option<Self> {
        Some(value.to_plain())
    }
}

impl FromValue for f64 {
    const EXPECTED: &'static str = "a number";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_f64()
    }
}

impl FromValue for i64 {
    const EXPECTED: &'static str = "an integer";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_i64()
    }
}

impl FromValue for bool {
    const EXPECTED: &'static str = "a boolean";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

impl FromValue for String {
    const EXPECTED: &'static str = "a string";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FromValue for State {
    const EXPECTED: &'static str = "a nested state";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_state().cloned()
    }
}

impl FromValue for List {
    const EXPECTED: &'static str = "a list";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_list().cloned()
    }
}

impl FromValue for Map {
    const EXPECTED: &'static str = "a map";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_map().cloned()
    }
}

impl<T: FromValue> FromValue for Option<T> {
    const EXPECTED: &'static str = T::EXPECTED;

    fn from_value(value: &Value) -> Option<Self> {
        if value.is_null() {
            Some(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_objects_become_objects_and_arrays_lists() {
        let plain = Plain::from(json!({"a": [1, 2], "b": {"c": "x"}}));
        let Plain::Object(fields) = &plain else {
            panic!("expected object, got {plain:?}");
        };
        assert_eq!(fields["a"], Plain::List(vec![1.into(), 2.into()]));
        assert!(matches!(fields["b"], Plain::Object(_)));
    }

    #[test]
    fn to_json_keeps_integers_integral() {
        let plain = Plain::from(json!({"n": 3, "f": 1.5}));
        assert_eq!(plain.to_json(), json!({"n": 3, "f": 1.5}));
    }

    #[test]
    fn maps_render_as_objects() {
        let plain = Plain::map([("k", Plain::from(1))]);
        assert_eq!(plain.to_json(), json!({"k": 1}));
        assert!(plain.is_structured());
    }

    #[test]
    fn truthiness() {
        assert!(!Plain::Null.truthy());
        assert!(!Plain::from(0).truthy());
        assert!(!Plain::from("").truthy());
        assert!(Plain::from("x").truthy());
        assert!(Plain::List(vec![]).truthy());
    }

    #[test]
    fn plain_values_compare_by_value() {
        assert_eq!(Value::from("a"), Value::from("a".to_string()));
        assert_ne!(Value::from(1), Value::from(2));
        assert_eq!(Value::default(), Value::null());
    }

    #[test]
    fn typed_extraction() {
        assert_eq!(f64::from_value(&Value::from(2.5)), Some(2.5));
        assert_eq!(i64::from_value(&Value::from(2.5)), None);
        assert_eq!(i64::from_value(&Value::from(4)), Some(4));
        assert_eq!(
            Option::<String>::from_value(&Value::null()),
            Some(None::<String>)
        );
        assert_eq!(String::from_value(&Value::from(1)), None);
    }

    #[test]
    fn display_strings_are_bare() {
        assert_eq!(Value::from("hi").to_string(), "hi");
        assert_eq!(Value::from(true).to_string(), "true");
    }
}
