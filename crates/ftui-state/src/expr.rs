#![forbid(unsafe_code)]

//! Alias-expression matchers.
//!
//! An alias field is a string of the form `"{expr}"`. The braces are
//! stripped and `expr` is offered to each [`AliasMatcher`] of the registry
//! in order; the first matcher that recognizes it decides the
//! [`AliasTarget`]. The default pipeline is:
//!
//! 1. [`NegationMatcher`]: `!expr` negates whatever `expr` resolves to.
//! 2. [`PipeMatcher`]: `expr |> name(arg, ...) |> ...` applies named
//!    transforms left to right.
//! 3. [`PathMatcher`]: a bare path.
//!
//! Transform names are only recorded here. They are looked up in the
//! registry when the alias is read or written, so transforms registered
//! after a container was built are still found.

use std::fmt;

use crate::error::{Result, StateError};
use crate::path::parse_path;
use crate::registry::Registry;

/// A named transform application with its bare-string arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformCall {
    pub name: String,
    pub args: Vec<String>,
}

impl TransformCall {
    #[must_use]
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

impl fmt::Display for TransformCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.args.join(", "))
    }
}

/// What an alias expression resolves to: a path plus the transforms applied
/// to values read through it (innermost first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasTarget {
    pub path: String,
    pub transforms: Vec<TransformCall>,
}

impl AliasTarget {
    #[must_use]
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            transforms: Vec::new(),
        }
    }

    #[must_use]
    pub fn then(mut self, call: TransformCall) -> Self {
        self.transforms.push(call);
        self
    }
}

/// One stage of the alias-expression pipeline.
pub trait AliasMatcher {
    fn name(&self) -> &str;

    /// `None` if this matcher does not recognize `expr`. The registry is
    /// passed so a matcher can delegate a sub-expression to the pipeline.
    fn try_match(&self, expr: &str, registry: &Registry) -> Option<Result<AliasTarget>>;
}

/// Strip the braces of an alias field. `None` if `raw` is not one.
#[must_use]
pub fn alias_body(raw: &str) -> Option<&str> {
    let inner = raw.strip_prefix('{')?.strip_suffix('}')?;
    let inner = inner.trim();
    (!inner.is_empty()).then_some(inner)
}

// ---------------------------------------------------------------------------
// Default matchers
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy)]
pub struct NegationMatcher;

impl AliasMatcher for NegationMatcher {
    fn name(&self) -> &str {
        "negation"
    }

    fn try_match(&self, expr: &str, registry: &Registry) -> Option<Result<AliasTarget>> {
        let rest = expr.trim().strip_prefix('!')?;
        Some(
            registry
                .match_alias(rest)
                .map(|target| target.then(TransformCall::new("not", Vec::new()))),
        )
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PipeMatcher;

impl AliasMatcher for PipeMatcher {
    fn name(&self) -> &str {
        "pipe"
    }

    fn try_match(&self, expr: &str, registry: &Registry) -> Option<Result<AliasTarget>> {
        let (head, calls) = expr.split_once("|>")?;
        Some((|| {
            let mut target = registry.match_alias(head)?;
            for call in calls.split("|>") {
                target.transforms.push(parse_transform_call(call, expr)?);
            }
            Ok(target)
        })())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PathMatcher;

impl AliasMatcher for PathMatcher {
    fn name(&self) -> &str {
        "path"
    }

    fn try_match(&self, expr: &str, _registry: &Registry) -> Option<Result<AliasTarget>> {
        let expr = expr.trim();
        parse_path(expr).ok().map(|parsed| Ok(AliasTarget::path(parsed.to_string())))
    }
}

/// Parse `name`, `name()` or `name(a, b)`.
pub fn parse_transform_call(call: &str, expr: &str) -> Result<TransformCall> {
    let bad = || StateError::AliasExpression {
        expr: expr.to_string(),
    };
    let call = call.trim();
    let (name, args) = match call.split_once('(') {
        Some((name, rest)) => {
            let inner = rest.strip_suffix(')').ok_or_else(bad)?;
            if inner.contains(['(', ')']) {
                return Err(bad());
            }
            let args = if inner.trim().is_empty() {
                Vec::new()
            } else {
                inner.split(',').map(|a| unquote(a.trim()).to_string()).collect()
            };
            (name.trim(), args)
        }
        None => (call, Vec::new()),
    };
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(bad());
    }
    Ok(TransformCall::new(name, args))
}

fn unquote(arg: &str) -> &str {
    for q in ['"', '\''] {
        if let Some(inner) = arg.strip_prefix(q).and_then(|a| a.strip_suffix(q)) {
            return inner;
        }
    }
    arg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg() -> Registry {
        Registry::new()
    }

    #[test]
    fn body_requires_braces() {
        assert_eq!(alias_body("{ a.b }"), Some("a.b"));
        assert_eq!(alias_body("{}"), None);
        assert_eq!(alias_body("a"), None);
        assert_eq!(alias_body("{a"), None);
    }

    #[test]
    fn bare_path() {
        assert_eq!(reg().match_alias("user.name").unwrap(), AliasTarget::path("user.name"));
    }

    #[test]
    fn negation_appends_not() {
        let target = reg().match_alias("!done").unwrap();
        assert_eq!(target.path, "done");
        assert_eq!(target.transforms, vec![TransformCall::new("not", vec![])]);
    }

    #[test]
    fn pipes_chain_in_order() {
        let target = reg().match_alias("raw |> trim() |> default(none, 'x y')").unwrap();
        assert_eq!(target.path, "raw");
        assert_eq!(
            target.transforms,
            vec![
                TransformCall::new("trim", vec![]),
                TransformCall::new("default", vec!["none".into(), "x y".into()]),
            ]
        );
    }

    #[test]
    fn malformed_calls_are_rejected() {
        for expr in ["a |> ", "a |> up(", "a |> 9x()", "a |> f(g())"] {
            assert!(
                matches!(reg().match_alias(expr), Err(StateError::AliasExpression { .. })),
                "{expr}"
            );
        }
    }

    #[test]
    fn unrecognized_expression() {
        assert!(matches!(
            reg().match_alias("a b"),
            Err(StateError::AliasExpression { .. })
        ));
    }
}
