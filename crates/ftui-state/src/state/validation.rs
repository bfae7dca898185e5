#![forbid(unsafe_code)]

//! Validation channel.
//!
//! # Design
//!
//! Each container stores the issues of its own declared keys, keyed by
//! path relative to the container (`age`, `tags[1]`). What listeners see is
//! a *view*:
//!
//! 1. the container's own errors,
//! 2. the errors of nested children, prefixed by their mount key
//!    (`address.city`), recursively,
//! 3. inherited errors: an ancestor's own errors for keys this container
//!    does not declare (and no closer ancestor declares), since those keys
//!    resolve to the ancestor's storage.
//!
//! Whenever a container's own errors change, every container in the same
//! hierarchy recomputes its view. Attaching or detaching a container whose
//! subtree holds no errors changes no view and skips the recompute, so
//! building or tearing down a large error-free hierarchy stays linear. A listener fires only if its container's
//! view differs from the last one it saw, so repeating an identical invalid
//! write is silent.
//!
//! # Failure Modes
//!
//! - A panicking custom validator is recorded as an issue on its key.
//! - A panicking listener is reported as a subscriber panic; the remaining
//!   listeners still run.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::debug;

use super::StateId;
use super::schema::{Schema, SchemaIssue};
use crate::error::{Result, StateError};
use crate::reactive::diagnostics::panic_message;
use crate::reactive::runtime::{Arena, RuntimeInner};
use crate::reactive::subscription::Subscription;
use crate::value::{Plain, Value};

pub type ErrorMap = IndexMap<String, Vec<String>>;

/// What invalid writes do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValidationMode {
    /// Store the value and report the issues on the validation channel.
    #[default]
    Report,
    /// Refuse the write with [`StateError::Validation`].
    Reject,
}

/// Payload delivered to validation listeners.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ValidationEvent {
    pub valid: bool,
    pub errors: ErrorMap,
}

pub(crate) type ValidatorFn = Rc<dyn Fn(&Value) -> std::result::Result<(), String>>;
pub(crate) type ListenerFn = Rc<dyn Fn(&ValidationEvent)>;

pub(crate) struct Listener {
    pub(crate) id: u64,
    callback: ListenerFn,
}

/// Top-level key of a relative error path.
fn top_key(path: &str) -> &str {
    let end = path.find(['.', '[']).unwrap_or(path.len());
    &path[..end]
}

/// Whether `path` is `key` itself or lies below it.
fn under_key(path: &str, key: &str) -> bool {
    path.strip_prefix(key)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('.') || rest.starts_with('['))
}

// ---------------------------------------------------------------------------
// Checking
// ---------------------------------------------------------------------------

/// Normalize `value` for storage under a key with schema `schema`.
///
/// Objects are left to the nested container they become. Lists and maps
/// are checked element by element against `items()`, again skipping
/// object elements. Handles are never checked.
pub(crate) fn check(schema: Option<&dyn Schema>, value: Value) -> (Value, Vec<SchemaIssue>) {
    let Some(schema) = schema else {
        return (value, Vec::new());
    };
    match value {
        Value::Plain(Plain::Object(_)) | Value::State(_) | Value::List(_) | Value::Map(_) => {
            (value, Vec::new())
        }
        Value::Plain(Plain::List(items)) => match schema.items() {
            Some(item) => {
                let mut issues = Vec::new();
                let items = items
                    .into_iter()
                    .enumerate()
                    .map(|(i, element)| {
                        let (element, found) = check(Some(item.as_ref()), Value::Plain(element));
                        issues.extend(found.into_iter().map(|mut issue| {
                            issue.path = format!("[{i}]{}", issue.path);
                            issue
                        }));
                        element.to_plain()
                    })
                    .collect();
                (Value::Plain(Plain::List(items)), issues)
            }
            None => normalize(schema, Plain::List(items)),
        },
        Value::Plain(Plain::Map(entries)) => match schema.items() {
            Some(item) => {
                let mut issues = Vec::new();
                let entries = entries
                    .into_iter()
                    .map(|(key, entry)| {
                        let (entry, found) = check(Some(item.as_ref()), Value::Plain(entry));
                        issues.extend(found.into_iter().map(|mut issue| {
                            issue.path = format!("[\"{key}\"]{}", issue.path);
                            issue
                        }));
                        (key, entry.to_plain())
                    })
                    .collect();
                (Value::Plain(Plain::Map(entries)), issues)
            }
            None => normalize(schema, Plain::Map(entries)),
        },
        Value::Plain(plain) => normalize(schema, plain),
    }
}

fn normalize(schema: &dyn Schema, plain: Plain) -> (Value, Vec<SchemaIssue>) {
    let result = schema.normalize(&plain);
    (Value::Plain(result.value), result.issues)
}

/// Run custom validators for one key. Panics become issues.
pub(crate) fn run_validators(
    rt: &Rc<RuntimeInner>,
    validators: &[ValidatorFn],
    value: &Value,
) -> Vec<SchemaIssue> {
    validators
        .iter()
        .filter_map(|validator| {
            match rt.untracked(|| panic::catch_unwind(AssertUnwindSafe(|| validator(value)))) {
                Ok(Ok(())) => None,
                Ok(Err(message)) => Some(SchemaIssue::new("", message)),
                Err(payload) => Some(SchemaIssue::new(
                    "",
                    format!("validator panicked: {}", panic_message(payload.as_ref())),
                )),
            }
        })
        .collect()
}

/// Group issues found under `key` into an error map.
pub(crate) fn group(key: &str, issues: &[SchemaIssue]) -> ErrorMap {
    let mut errors = ErrorMap::new();
    for issue in issues {
        errors
            .entry(format!("{key}{}", issue.path))
            .or_insert_with(Vec::new)
            .push(issue.message.clone());
    }
    errors
}

/// Replace the errors recorded under `key`; refresh views if they changed.
pub(crate) fn replace_errors(rt: &Rc<RuntimeInner>, sid: StateId, key: &str, issues: &[SchemaIssue]) {
    let changed = {
        let mut arena = rt.arena.borrow_mut();
        let Some(node) = arena.states.get_mut(sid) else {
            return;
        };
        let before = node.errors.clone();
        node.errors.retain(|path, _| !under_key(path, key));
        for (path, messages) in group(key, issues) {
            node.errors.insert(path, messages);
        }
        node.errors != before
    };
    if changed {
        refresh(rt, sid);
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

fn nested_into(arena: &Arena, sid: StateId, prefix: &str, out: &mut ErrorMap) {
    let Some(node) = arena.states.get(sid) else {
        return;
    };
    for (path, messages) in &node.errors {
        out.insert(format!("{prefix}{path}"), messages.clone());
    }
    for &child in &node.children {
        let mount = arena.states.get(child).and_then(|c| c.mount.clone());
        if let Some(mount) = mount {
            nested_into(arena, child, &format!("{prefix}{mount}."), out);
        }
    }
}

pub(crate) fn view(arena: &Arena, sid: StateId) -> ErrorMap {
    let mut out = ErrorMap::new();
    nested_into(arena, sid, "", &mut out);
    let Some(node) = arena.states.get(sid) else {
        return out;
    };
    let mut shadowed: HashSet<&str> = node.keys.keys().map(String::as_str).collect();
    let mut cursor = node.parent.and_then(|p| arena.states.get(p));
    while let Some(ancestor) = cursor {
        for (path, messages) in &ancestor.errors {
            let top = top_key(path);
            if !shadowed.contains(top) && !out.contains_key(path) {
                out.insert(path.clone(), messages.clone());
            }
        }
        shadowed.extend(ancestor.keys.keys().map(String::as_str));
        cursor = ancestor.parent.and_then(|p| arena.states.get(p));
    }
    out
}

fn hierarchy(arena: &Arena, sid: StateId) -> Vec<StateId> {
    let mut root = sid;
    while let Some(parent) = arena.states.get(root).and_then(|n| n.parent) {
        if !arena.states.contains_key(parent) {
            break;
        }
        root = parent;
    }
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(next) = stack.pop() {
        if let Some(node) = arena.states.get(next) {
            out.push(next);
            stack.extend(node.children.iter().rev().copied());
        }
    }
    out
}

/// Whether `sid` or any container nested below it records errors.
///
/// A subtree without errors contributes nothing to any other container's
/// view, so attaching or detaching it needs no refresh.
pub(crate) fn subtree_has_errors(arena: &Arena, sid: StateId) -> bool {
    let mut stack = vec![sid];
    while let Some(next) = stack.pop() {
        let Some(node) = arena.states.get(next) else {
            continue;
        };
        if !node.errors.is_empty() {
            return true;
        }
        stack.extend(node.children.iter().copied());
    }
    false
}

/// Recompute views across the hierarchy of `sid` and notify listeners whose
/// view changed.
pub(crate) fn refresh(rt: &Rc<RuntimeInner>, sid: StateId) {
    let deliveries: Vec<(String, Vec<ListenerFn>, ValidationEvent)> = {
        let mut arena = rt.arena.borrow_mut();
        let affected = hierarchy(&arena, sid);
        let views: Vec<(StateId, ErrorMap)> =
            affected.into_iter().map(|s| (s, view(&arena, s))).collect();
        views
            .into_iter()
            .filter_map(|(s, errors)| {
                let node = arena.states.get_mut(s)?;
                if node.last_view.as_ref() == Some(&errors) {
                    return None;
                }
                node.last_view = Some(errors.clone());
                if node.listeners.is_empty() {
                    return None;
                }
                let label = node.mount.clone().unwrap_or_else(|| "<state>".to_string());
                let callbacks = node.listeners.iter().map(|l| Rc::clone(&l.callback)).collect();
                let event = ValidationEvent {
                    valid: errors.is_empty(),
                    errors,
                };
                Some((label, callbacks, event))
            })
            .collect()
    };
    for (label, callbacks, event) in deliveries {
        debug!(state = %label, valid = event.valid, errors = event.errors.len(), "state.validation.changed");
        for callback in callbacks {
            rt.untracked(|| rt.guarded(&label, || callback(&event)));
        }
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

pub(crate) fn add_listener(
    rt: &Rc<RuntimeInner>,
    sid: StateId,
    callback: ListenerFn,
) -> Result<Subscription> {
    let id = rt.next_subscriber_id();
    {
        let mut arena = rt.arena.borrow_mut();
        let last = view(&arena, sid);
        let node = arena.states.get_mut(sid).ok_or(StateError::Disposed)?;
        node.last_view.get_or_insert(last);
        node.listeners.push(Listener { id, callback });
    }
    Ok(Subscription::validation(rt, sid, id))
}

pub(crate) fn remove_listener(rt: &Rc<RuntimeInner>, sid: StateId, id: u64) {
    let removed = {
        let mut arena = rt.arena.borrow_mut();
        arena.states.get_mut(sid).and_then(|node| {
            node.listeners
                .iter()
                .position(|l| l.id == id)
                .map(|pos| node.listeners.remove(pos))
        })
    };
    drop(removed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::schema::ShapeSchema;
    use crate::{Runtime, RuntimeConfig, State};
    use serde_json::json;
    use std::cell::RefCell;

    fn schema() -> Rc<dyn Schema> {
        Rc::new(ShapeSchema::object([
            ("age", ShapeSchema::number().min(0.0)),
            (
                "address",
                ShapeSchema::object([("city", ShapeSchema::text().min_len(1))]),
            ),
            ("tags", ShapeSchema::array(ShapeSchema::text())),
        ]))
    }

    fn events(state: &State) -> (Rc<RefCell<Vec<ValidationEvent>>>, Subscription) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let sub = state
            .on_validation_change(move |e| s.borrow_mut().push(e.clone()))
            .unwrap();
        (seen, sub)
    }

    #[test]
    fn path_helpers() {
        assert_eq!(top_key("tags[1]"), "tags");
        assert_eq!(top_key("address.city"), "address");
        assert!(under_key("tags[1]", "tags"));
        assert!(under_key("tags", "tags"));
        assert!(!under_key("tagsx", "tags"));
    }

    #[test]
    fn identical_invalid_writes_fire_once() {
        let state = State::builder(json!({"age": 1})).schema(schema()).build().unwrap();
        let (seen, _sub) = events(&state);
        state.set("age", -1).unwrap();
        state.set("age", -2).unwrap();
        state.set("age", -2).unwrap();
        state.set("age", 3).unwrap();
        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert!(!seen[0].valid);
        assert_eq!(seen[0].errors["age"], vec!["must be at least 0".to_string()]);
        assert!(seen[1].valid);
        assert_eq!(state.get("age").unwrap(), Value::from(3));
    }

    #[test]
    fn report_mode_still_stores() {
        let state = State::builder(json!({"age": 1})).schema(schema()).build().unwrap();
        state.set("age", -5).unwrap();
        assert_eq!(state.get("age").unwrap(), Value::from(-5));
        assert_eq!(state.schema_errors("age"), vec!["must be at least 0".to_string()]);
        assert!(!state.is_valid());
    }

    #[test]
    fn reject_mode_refuses() {
        let rt = Runtime::with_config(RuntimeConfig::new().validation_mode(ValidationMode::Reject));
        let state = State::builder(json!({"age": 1}))
            .runtime(&rt)
            .schema(schema())
            .build()
            .unwrap();
        assert!(matches!(
            state.set("age", -5),
            Err(StateError::Validation { .. })
        ));
        assert_eq!(state.get("age").unwrap(), Value::from(1));
        assert!(state.is_valid());
    }

    #[test]
    fn nested_errors_aggregate_with_prefix() {
        let state = State::builder(json!({"address": {"city": "Rome"}}))
            .schema(schema())
            .build()
            .unwrap();
        let (seen, _sub) = events(&state);
        state.set("address.city", "").unwrap();
        assert_eq!(
            state.all_schema_errors().keys().collect::<Vec<_>>(),
            vec!["address.city"]
        );
        let nested = state.get_as::<State>("address").unwrap();
        assert_eq!(nested.schema_errors("city").len(), 1);
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn valid_subtrees_come_and_go_without_events() {
        let state = State::builder(json!({"address": {"city": "Rome"}}))
            .schema(schema())
            .build()
            .unwrap();
        let (seen, _sub) = events(&state);
        state.set("address", json!({"city": "Milan"})).unwrap();
        assert!(seen.borrow().is_empty());

        state.set("address", json!({"city": ""})).unwrap();
        state.set("address", json!({"city": "Oslo"})).unwrap();
        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].errors.keys().collect::<Vec<_>>(), vec!["address.city"]);
        assert!(seen[1].valid);
    }

    #[test]
    fn only_invalid_subtrees_need_a_refresh() {
        let state = State::builder(json!({"address": {"city": "Rome"}}))
            .schema(schema())
            .build()
            .unwrap();
        let arena = state.rt.arena.borrow();
        assert!(!subtree_has_errors(&arena, state.id));
        drop(arena);
        state.set("address.city", "").unwrap();
        assert!(subtree_has_errors(&state.rt.arena.borrow(), state.id));
    }

    #[test]
    fn list_elements_are_checked_individually() {
        let state = State::builder(json!({"tags": ["a"]})).schema(schema()).build().unwrap();
        state.set("tags", json!(["a", 2, "c", true])).unwrap();
        let errors = state.all_schema_errors();
        assert_eq!(errors.keys().collect::<Vec<_>>(), vec!["tags[1]", "tags[3]"]);
        state.set("tags", json!([])).unwrap();
        assert!(state.is_valid());
    }

    #[test]
    fn children_inherit_ancestor_errors() {
        let parent = State::builder(json!({"age": 1})).schema(schema()).build().unwrap();
        let child = parent.child(json!({"nick": "x"})).unwrap();
        let shadowing = parent.child(json!({"age": 5})).unwrap();
        let (seen, _sub) = events(&child);
        child.set("age", -1).unwrap();
        assert_eq!(parent.get("age").unwrap(), Value::from(-1));
        assert_eq!(child.schema_errors("age").len(), 1);
        assert!(shadowing.is_valid());
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn custom_validators_run_per_key() {
        let state = State::builder(json!({"name": "ok"}))
            .validator("name", |v| {
                if v.as_str().is_some_and(|s| s.contains(' ')) {
                    Err("no spaces".to_string())
                } else {
                    Ok(())
                }
            })
            .validator("name", |_| panic!("boom"))
            .build()
            .unwrap();
        state.set("name", "a b").unwrap();
        assert_eq!(
            state.schema_errors("name"),
            vec!["no spaces".to_string(), "validator panicked: boom".to_string()]
        );
    }
}
