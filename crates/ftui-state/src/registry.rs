#![forbid(unsafe_code)]

//! Named value transforms and the alias-expression pipeline.
//!
//! A [`Registry`] is injected into a runtime (or into a single container
//! through its builder). [`Registry::global`] is a per-thread default that
//! runtimes fall back to; registering a transform there makes it visible to
//! every container that did not receive its own registry.
//!
//! # Built-in transforms
//!
//! | name           | read                                         | write    |
//! |----------------|----------------------------------------------|----------|
//! | `not`          | boolean negation of truthiness               | same     |
//! | `upper`        | uppercase strings                            | -        |
//! | `lower`        | lowercase strings                            | -        |
//! | `trim`         | trim strings                                 | -        |
//! | `default(v)`   | `v` when the value is null or empty          | identity |
//! | `eq(v)`        | whether the value renders as `v`             | -        |
//! | `join(sep)`    | join list elements (default `,`)             | -        |
//! | `len`          | length of a string, list or map              | -        |

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::{Result, StateError};
use crate::expr::{AliasMatcher, AliasTarget, NegationMatcher, PathMatcher, PipeMatcher};
use crate::value::{Plain, Value};

pub type TransformFn = Rc<dyn Fn(&Value, &[String]) -> Result<Value>>;

/// A value transform with an optional inverse used for writes.
#[derive(Clone)]
pub struct Transform {
    read: TransformFn,
    write: Option<TransformFn>,
}

impl Transform {
    #[must_use]
    pub fn new(read: impl Fn(&Value, &[String]) -> Result<Value> + 'static) -> Self {
        Self {
            read: Rc::new(read),
            write: None,
        }
    }

    /// Make the transform writable through `write`.
    #[must_use]
    pub fn with_write(mut self, write: impl Fn(&Value, &[String]) -> Result<Value> + 'static) -> Self {
        self.write = Some(Rc::new(write));
        self
    }

    pub fn read(&self, value: &Value, args: &[String]) -> Result<Value> {
        (self.read)(value, args)
    }

    /// `None` if the transform is read-only.
    pub fn write(&self, value: &Value, args: &[String]) -> Option<Result<Value>> {
        self.write.as_ref().map(|w| w(value, args))
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.write.is_some()
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform")
            .field("writable", &self.is_writable())
            .finish()
    }
}

struct RegistryInner {
    transforms: IndexMap<String, Transform>,
    matchers: Vec<Rc<dyn AliasMatcher>>,
}

/// Shared table of transforms and alias matchers. Clones share state.
#[derive(Clone)]
pub struct Registry {
    inner: Rc<RefCell<RegistryInner>>,
}

thread_local! {
    static GLOBAL: Registry = Registry::new();
}

impl Registry {
    /// A registry with the built-in transforms and default matchers.
    #[must_use]
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.add_matcher(PathMatcher);
        registry.add_matcher(PipeMatcher);
        registry.add_matcher(NegationMatcher);
        install_builtins(&registry);
        registry
    }

    /// A registry with no transforms and no matchers.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            inner: Rc::new(RefCell::new(RegistryInner {
                transforms: IndexMap::new(),
                matchers: Vec::new(),
            })),
        }
    }

    /// The default registry of the current thread.
    #[must_use]
    pub fn global() -> Self {
        GLOBAL.with(Registry::clone)
    }

    /// Register (or replace) a transform.
    pub fn register_transform(&self, name: impl Into<String>, transform: Transform) {
        self.inner
            .borrow_mut()
            .transforms
            .insert(name.into(), transform);
    }

    #[must_use]
    pub fn transform(&self, name: &str) -> Option<Transform> {
        self.inner.borrow().transforms.get(name).cloned()
    }

    pub fn transform_or_err(&self, name: &str) -> Result<Transform> {
        self.transform(name).ok_or_else(|| StateError::UnknownTransform {
            name: name.to_string(),
        })
    }

    #[must_use]
    pub fn transform_names(&self) -> Vec<String> {
        self.inner.borrow().transforms.keys().cloned().collect()
    }

    /// Add a matcher ahead of all existing ones.
    pub fn add_matcher(&self, matcher: impl AliasMatcher + 'static) {
        self.inner.borrow_mut().matchers.insert(0, Rc::new(matcher));
    }

    #[must_use]
    pub fn matcher_names(&self) -> Vec<String> {
        self.inner
            .borrow()
            .matchers
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Run `expr` through the matcher pipeline.
    pub fn match_alias(&self, expr: &str) -> Result<AliasTarget> {
        let matchers = self.inner.borrow().matchers.clone();
        matchers
            .iter()
            .find_map(|m| m.try_match(expr, self))
            .unwrap_or_else(|| {
                Err(StateError::AliasExpression {
                    expr: expr.trim().to_string(),
                })
            })
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("transforms", &self.transform_names())
            .field("matchers", &self.matcher_names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

fn map_str(value: &Value, f: impl Fn(&str) -> String) -> Value {
    match value.as_str() {
        Some(s) => Value::from(f(s)),
        None => value.clone(),
    }
}

fn parse_arg(arg: &str) -> Plain {
    serde_json::from_str::<serde_json::Value>(arg)
        .map(Plain::from)
        .unwrap_or_else(|_| Plain::String(arg.to_string()))
}

fn install_builtins(registry: &Registry) {
    let negate = |v: &Value, _: &[String]| Ok(Value::from(!v.truthy()));
    registry.register_transform("not", Transform::new(negate).with_write(negate));
    registry.register_transform(
        "upper",
        Transform::new(|v, _| Ok(map_str(v, str::to_uppercase))),
    );
    registry.register_transform(
        "lower",
        Transform::new(|v, _| Ok(map_str(v, str::to_lowercase))),
    );
    registry.register_transform(
        "trim",
        Transform::new(|v, _| Ok(map_str(v, |s| s.trim().to_string()))),
    );
    registry.register_transform(
        "default",
        Transform::new(|v, args| {
            let empty = v.is_null() || v.as_str().is_some_and(str::is_empty);
            Ok(match args.first() {
                Some(fallback) if empty => Value::from(parse_arg(fallback)),
                _ => v.clone(),
            })
        })
        .with_write(|v, _| Ok(v.clone())),
    );
    registry.register_transform(
        "eq",
        Transform::new(|v, args| {
            let expected = args.first().map(String::as_str).unwrap_or_default();
            Ok(Value::from(v.to_plain() == parse_arg(expected) || v.to_string() == expected))
        }),
    );
    registry.register_transform(
        "join",
        Transform::new(|v, args| {
            let sep = args.first().map(String::as_str).unwrap_or(",");
            match v.to_plain() {
                Plain::List(items) => Ok(Value::from(
                    items
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(sep),
                )),
                Plain::Null => Ok(Value::from("")),
                _ => Err(StateError::Transform {
                    name: "join".into(),
                    message: "expected a list".into(),
                }),
            }
        }),
    );
    registry.register_transform(
        "len",
        Transform::new(|v, _| {
            let n = match v {
                Value::Plain(Plain::String(s)) => s.chars().count(),
                Value::Plain(Plain::List(items)) => items.len(),
                Value::Plain(Plain::Null) => 0,
                Value::List(list) => list.len(),
                Value::Map(map) => map.len(),
                Value::State(state) => state.keys().len(),
                Value::Plain(_) => {
                    return Err(StateError::Transform {
                        name: "len".into(),
                        message: "expected a string or collection".into(),
                    });
                }
            };
            Ok(Value::from(n))
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(name: &str, v: Value, args: &[&str]) -> Result<Value> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        Registry::new().transform_or_err(name)?.read(&v, &args)
    }

    #[test]
    fn builtins_are_installed() {
        let names = Registry::new().transform_names();
        for expected in ["not", "upper", "lower", "trim", "default", "eq", "join", "len"] {
            assert!(names.iter().any(|n| n == expected), "{expected}");
        }
        assert!(Registry::empty().transform_names().is_empty());
    }

    #[test]
    fn string_transforms() {
        assert_eq!(apply("upper", "ada".into(), &[]).unwrap(), Value::from("ADA"));
        assert_eq!(apply("lower", "ADA".into(), &[]).unwrap(), Value::from("ada"));
        assert_eq!(apply("trim", " a ".into(), &[]).unwrap(), Value::from("a"));
        assert_eq!(apply("upper", 3.into(), &[]).unwrap(), Value::from(3));
    }

    #[test]
    fn default_and_eq() {
        assert_eq!(apply("default", Value::null(), &["7"]).unwrap(), Value::from(7));
        assert_eq!(apply("default", "".into(), &["n/a"]).unwrap(), Value::from("n/a"));
        assert_eq!(apply("default", "x".into(), &["n/a"]).unwrap(), Value::from("x"));
        assert_eq!(apply("eq", "on".into(), &["on"]).unwrap(), Value::from(true));
        assert_eq!(apply("eq", 2.into(), &["2"]).unwrap(), Value::from(true));
        assert_eq!(apply("eq", 2.into(), &["3"]).unwrap(), Value::from(false));
    }

    #[test]
    fn join_and_len() {
        let list = Value::from(vec![Plain::from("a"), Plain::from("b")]);
        assert_eq!(apply("join", list.clone(), &["-"]).unwrap(), Value::from("a-b"));
        assert_eq!(apply("len", list, &[]).unwrap(), Value::from(2));
        assert_eq!(apply("len", "héllo".into(), &[]).unwrap(), Value::from(5));
        assert!(apply("len", true.into(), &[]).is_err());
    }

    #[test]
    fn not_is_invertible() {
        let t = Registry::new().transform("not").unwrap();
        assert!(t.is_writable());
        assert_eq!(t.write(&Value::from(true), &[]).unwrap().unwrap(), Value::from(false));
        assert!(!Registry::new().transform("upper").unwrap().is_writable());
    }

    #[test]
    fn unknown_transform() {
        assert!(matches!(
            Registry::empty().transform_or_err("nope"),
            Err(StateError::UnknownTransform { .. })
        ));
    }

    #[test]
    fn global_is_shared_per_thread() {
        let a = Registry::global();
        let b = Registry::global();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&Registry::new()));
    }

    #[test]
    fn matcher_order_is_negation_pipe_path() {
        assert_eq!(Registry::new().matcher_names(), vec!["negation", "pipe", "path"]);
    }
}
