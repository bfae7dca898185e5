#![forbid(unsafe_code)]

//! Path resolver.
//!
//! # Design
//!
//! One walking routine serves three callers:
//!
//! - **build** ([`resolve`]): materializes index/key attributes for a
//!   terminal `[i]` / `["k"]` segment and returns live handles.
//! - **classify** ([`classify`]): reports what the path ends in without
//!   creating anything.
//! - **preflight** ([`preflight`]): never fails; records one [`Hop`] per
//!   segment and the first blocking error.
//!
//! Walking rules, per segment:
//!
//! | segment  | requires                          | yields                          |
//! |----------|-----------------------------------|---------------------------------|
//! | top      | declared here or by an ancestor   | that attribute                  |
//! | `.prop`  | current value is a container      | ancestor-aware lookup in it     |
//! | `[i]`    | current value is a list           | index target, or the element    |
//! | `["k"]`  | current value is a map            | key target, or the entry        |
//!
//! A non-terminal `[i]` / `["k"]` reads the live element, which must be a
//! container, and must be followed by a `.prop` segment.
//!
//! # Failure Modes
//!
//! Every violated precondition fails with [`StateError::Unresolvable`]
//! naming the path, the offending segment and the reason. An unknown top
//! segment fails with [`StateError::UnknownProperty`].

use std::rc::Rc;

use super::token::{ParsedPath, Token};
use crate::attribute::{self, Attr, AttrId, AttrKind, List, Map};
use crate::error::{Result, StateError};
use crate::reactive::runtime::RuntimeInner;
use crate::state::StateId;
use crate::value::Value;

/// Ancestor-aware key lookup: the nearest container from `state` upwards
/// that declares `key`. `skip` excludes one attribute (an alias looking up
/// its own name).
pub(crate) fn lookup(
    rt: &Rc<RuntimeInner>,
    state: StateId,
    key: &str,
    skip: Option<AttrId>,
) -> Result<AttrId> {
    let arena = rt.arena.borrow();
    let mut cursor = arena.states.get(state).ok_or(StateError::Disposed)?;
    loop {
        if let Some(&id) = cursor.keys.get(key) {
            if Some(id) != skip {
                return Ok(id);
            }
        }
        match cursor.parent.and_then(|p| arena.states.get(p)) {
            Some(parent) => cursor = parent,
            None => return Err(StateError::unknown(key)),
        }
    }
}

/// What a walk ended in.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum FinalTarget {
    Attr(AttrId),
    Index { list: AttrId, index: usize },
    Key { map: AttrId, key: String },
}

impl FinalTarget {
    /// Current value; index and key targets read null when absent.
    pub(crate) fn current(&self, rt: &Rc<RuntimeInner>) -> Result<Value> {
        match self {
            Self::Attr(id) => attribute::current(rt, *id),
            Self::Index { list, index } => {
                Ok(attribute::list::element(rt, *list, *index)?.unwrap_or_default())
            }
            Self::Key { map, key } => Ok(attribute::map::entry(rt, *map, key)?.unwrap_or_default()),
        }
    }

    pub(crate) fn write(&self, rt: &Rc<RuntimeInner>, value: Value) -> Result<()> {
        match self {
            Self::Attr(id) => attribute::set(rt, *id, value),
            Self::Index { list, index } => attribute::list::set_at(rt, *list, *index, value),
            Self::Key { map, key } => attribute::map::set_entry(rt, *map, key, value),
        }
    }

    pub(crate) fn kind(&self, rt: &Rc<RuntimeInner>) -> Result<AttrKind> {
        match self {
            Self::Attr(id) => attribute::kind(rt, *id),
            Self::Index { .. } => Ok(AttrKind::Index),
            Self::Key { .. } => Ok(AttrKind::MapKey),
        }
    }

    pub(crate) fn is_writable(&self, rt: &Rc<RuntimeInner>) -> bool {
        match self {
            Self::Attr(id) => attribute::is_writable(rt, *id),
            Self::Index { list, .. } => rt.arena.borrow().attrs.contains_key(*list),
            Self::Key { map, .. } => rt.arena.borrow().attrs.contains_key(*map),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WalkOptions {
    pub(crate) collect_hops: bool,
    /// Report every intermediate to the active collector.
    pub(crate) track: bool,
    pub(crate) skip: Option<AttrId>,
}

/// Result of a walk. `links` holds the intermediates crossed before the walk
/// ended, successful or not.
pub(crate) struct Walk {
    pub(crate) outcome: Result<FinalTarget>,
    pub(crate) links: Vec<AttrId>,
    pub(crate) hops: Vec<Hop>,
}

/// Diagnostic record for one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Hop {
    pub segment: String,
    pub status: HopStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HopStatus {
    /// The segment named an attribute of this kind.
    Resolved(AttrKind),
    /// A non-terminal index or key that stepped into a live element.
    Element,
    /// A terminal index or key; resolving it would create a virtual
    /// attribute of this kind.
    Virtual(AttrKind),
    Failed(String),
    /// Not reached because an earlier segment failed.
    Unreachable,
}

/// Outcome of a non-failing path check.
#[derive(Debug, Clone, PartialEq)]
pub struct Preflight {
    pub ok: bool,
    pub error: Option<StateError>,
    pub hops: Vec<Hop>,
}

/// Materialized path: the final attribute plus every intermediate.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    pub target: Attr,
    pub intermediates: Vec<Attr>,
    pub kind: AttrKind,
}

struct Walker<'a> {
    rt: &'a Rc<RuntimeInner>,
    path: &'a ParsedPath,
    opts: WalkOptions,
    links: Vec<AttrId>,
    hops: Vec<Hop>,
}

impl Walker<'_> {
    fn hop(&mut self, segment: String, status: HopStatus) {
        if self.opts.collect_hops {
            self.hops.push(Hop { segment, status });
        }
    }

    fn link(&mut self, id: AttrId) {
        if self.links.last() == Some(&id) {
            return;
        }
        if self.opts.track {
            self.rt.collect(id);
        }
        self.links.push(id);
    }

    /// Record the failure at rest index `at` and mark what follows
    /// unreachable.
    fn fail(&mut self, at: usize, reason: impl Into<String>) -> StateError {
        let reason = reason.into();
        let segment = self.path.rest[at].to_string();
        self.hop(segment.clone(), HopStatus::Failed(reason.clone()));
        self.unreachable_from(at + 1);
        StateError::unresolvable(self.path.to_string(), segment, reason)
    }

    fn unreachable_from(&mut self, from: usize) {
        if !self.opts.collect_hops {
            return;
        }
        for token in self.path.rest.iter().skip(from) {
            self.hops.push(Hop {
                segment: token.to_string(),
                status: HopStatus::Unreachable,
            });
        }
    }

    fn kind(&self, id: AttrId) -> HopStatus {
        attribute::kind(self.rt, id).map_or(HopStatus::Unreachable, HopStatus::Resolved)
    }

    fn value(&mut self, at: usize, id: AttrId) -> Result<Value> {
        attribute::current(self.rt, id).map_err(|err| self.fail(at, err.to_string()))
    }

    /// `.name` against a container value.
    fn prop(&mut self, at: usize, name: &str, state: StateId) -> Result<AttrId> {
        match lookup(self.rt, state, name, None) {
            Ok(next) => {
                let status = self.kind(next);
                self.hop(self.path.rest[at].to_string(), status);
                Ok(next)
            }
            Err(_) => Err(self.fail(at, format!("'{name}' not found in schema"))),
        }
    }

    /// The `.prop` that must follow a non-terminal element step.
    fn element_prop(&mut self, at: usize, element: Value, what: &str) -> Result<AttrId> {
        let Value::State(state) = element else {
            return Err(self.fail(at, format!("{what} not navigable")));
        };
        match self.path.rest.get(at + 1) {
            Some(Token::Prop(name)) => {
                let name = name.clone();
                self.hop(self.path.rest[at].to_string(), HopStatus::Element);
                self.prop(at + 1, &name, state.id)
            }
            _ => Err(self.fail(at + 1, format!("expected a property after {what}"))),
        }
    }

    fn run(&mut self, state: StateId) -> Result<FinalTarget> {
        let path = self.path;
        let mut cur = match lookup(self.rt, state, &path.top, self.opts.skip) {
            Ok(id) => id,
            Err(err) => {
                self.hop(path.top.clone(), HopStatus::Failed(err.to_string()));
                self.unreachable_from(0);
                return Err(err);
            }
        };
        let status = self.kind(cur);
        self.hop(path.top.clone(), status);

        let mut at = 0;
        while at < path.rest.len() {
            let terminal = at + 1 == path.rest.len();
            match &path.rest[at] {
                Token::Prop(name) => {
                    self.link(cur);
                    let Value::State(s) = self.value(at, cur)? else {
                        return Err(self.fail(at, format!("'{name}' on non-object value")));
                    };
                    cur = self.prop(at, name, s.id)?;
                }
                Token::Index(index) => {
                    let index = *index;
                    self.link(cur);
                    let Value::List(List { id: list, .. }) = self.value(at, cur)? else {
                        return Err(self.fail(at, "index on non-list"));
                    };
                    self.link(list);
                    if terminal {
                        self.hop(path.rest[at].to_string(), HopStatus::Virtual(AttrKind::Index));
                        return Ok(FinalTarget::Index { list, index });
                    }
                    let element = attribute::list::element(self.rt, list, index)?;
                    let Some(element) = element else {
                        return Err(self.fail(at, format!("index {index} out of bounds")));
                    };
                    cur = self.element_prop(at, element, "List element")?;
                    at += 1;
                }
                Token::Key(key) => {
                    self.link(cur);
                    let Value::Map(Map { id: map, .. }) = self.value(at, cur)? else {
                        return Err(self.fail(at, "key on non-map"));
                    };
                    self.link(map);
                    if terminal {
                        self.hop(path.rest[at].to_string(), HopStatus::Virtual(AttrKind::MapKey));
                        return Ok(FinalTarget::Key {
                            map,
                            key: key.clone(),
                        });
                    }
                    let Some(entry) = attribute::map::entry(self.rt, map, key)? else {
                        return Err(self.fail(at, format!("key '{key}' not present")));
                    };
                    cur = self.element_prop(at, entry, "Map entry")?;
                    at += 1;
                }
            }
            at += 1;
        }
        Ok(FinalTarget::Attr(cur))
    }
}

pub(crate) fn walk(
    rt: &Rc<RuntimeInner>,
    state: StateId,
    path: &ParsedPath,
    opts: WalkOptions,
) -> Walk {
    let mut walker = Walker {
        rt,
        path,
        opts,
        links: Vec::new(),
        hops: Vec::new(),
    };
    let outcome = walker.run(state);
    Walk {
        outcome,
        links: walker.links,
        hops: walker.hops,
    }
}

/// Build mode: resolve `path` into live handles, materializing a terminal
/// index/key attribute on its collection.
pub(crate) fn resolve(rt: &Rc<RuntimeInner>, state: StateId, path: &ParsedPath) -> Result<ResolvedPath> {
    let walk = walk(rt, state, path, WalkOptions::default());
    let target = walk.outcome?;
    let kind = target.kind(rt)?;
    let id = match target {
        FinalTarget::Attr(id) => id,
        FinalTarget::Index { list, index } => {
            List::from_parts(Rc::clone(rt), list).get_attr(index)?.id
        }
        FinalTarget::Key { map, key } => Map::from_parts(Rc::clone(rt), map).key_attr(&key)?.id,
    };
    Ok(ResolvedPath {
        target: Attr::from_parts(Rc::clone(rt), id),
        intermediates: walk
            .links
            .into_iter()
            .map(|id| Attr::from_parts(Rc::clone(rt), id))
            .collect(),
        kind,
    })
}

/// Classify mode: the kind `path` ends in, creating nothing.
pub(crate) fn classify(rt: &Rc<RuntimeInner>, state: StateId, path: &ParsedPath) -> Result<AttrKind> {
    walk(rt, state, path, WalkOptions::default())
        .outcome?
        .kind(rt)
}

pub(crate) fn preflight(rt: &Rc<RuntimeInner>, state: StateId, path: &ParsedPath) -> Preflight {
    let walk = walk(
        rt,
        state,
        path,
        WalkOptions {
            collect_hops: true,
            ..WalkOptions::default()
        },
    );
    let error = walk.outcome.err();
    Preflight {
        ok: error.is_none(),
        error,
        hops: walk.hops,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::State;
    use crate::path::parse_path;
    use serde_json::json;

    fn fixture() -> State {
        State::builder(json!({
            "user": {"name": "Ada", "tags": ["x", "y"]},
            "items": [{"title": "first"}, 3],
            "n": 1
        }))
        .map("lookup", [("home", json!({"city": "Paris"}))])
        .build()
        .unwrap()
    }

    fn hops(state: &State, path: &str) -> Vec<(String, HopStatus)> {
        state
            .preflight(path)
            .unwrap()
            .hops
            .into_iter()
            .map(|h| (h.segment, h.status))
            .collect()
    }

    #[test]
    fn classify_reports_final_kind() {
        let state = fixture();
        let rt = &state.rt;
        let kind = |p: &str| classify(rt, state.id, &parse_path(p).unwrap());
        assert_eq!(kind("user.name").unwrap(), AttrKind::Mutable);
        assert_eq!(kind("user.tags[1]").unwrap(), AttrKind::Index);
        assert_eq!(kind(r#"lookup["home"]"#).unwrap(), AttrKind::MapKey);
        assert_eq!(kind(r#"lookup["home"].city"#).unwrap(), AttrKind::Mutable);
        assert_eq!(kind("items[0].title").unwrap(), AttrKind::Mutable);
    }

    #[test]
    fn failures_name_segment_and_reason() {
        let state = fixture();
        let cases = [
            ("n.x", ".x", "'x' on non-object value"),
            ("n[0]", "[0]", "index on non-list"),
            (r#"n["k"]"#, r#"["k"]"#, "key on non-map"),
            ("items[1].x", "[1]", "List element not navigable"),
            ("items[5].x", "[5]", "index 5 out of bounds"),
            ("items[0][1]", "[1]", "expected a property after List element"),
            ("user.missing", ".missing", "'missing' not found in schema"),
            (r#"lookup["away"].city"#, r#"["away"]"#, "key 'away' not present"),
        ];
        for (path, seg, why) in cases {
            match state.get(path) {
                Err(StateError::Unresolvable {
                    segment, reason, ..
                }) => assert_eq!((segment.as_str(), reason.as_str()), (seg, why), "{path}"),
                other => panic!("{path}: unexpected {other:?}"),
            }
        }
        assert!(matches!(
            state.get("ghost.x"),
            Err(StateError::UnknownProperty { .. })
        ));
    }

    #[test]
    fn preflight_marks_the_rest_unreachable() {
        let state = fixture();
        assert_eq!(
            hops(&state, "n.a.b"),
            vec![
                ("n".to_string(), HopStatus::Resolved(AttrKind::Mutable)),
                (".a".to_string(), HopStatus::Failed("'a' on non-object value".into())),
                (".b".to_string(), HopStatus::Unreachable),
            ]
        );
        let report = state.preflight("items[0].title").unwrap();
        assert!(report.ok);
        assert_eq!(report.hops[1].status, HopStatus::Element);
        assert_eq!(report.hops.len(), 3);
    }

    #[test]
    fn preflight_never_fails_on_unknown_top() {
        let state = fixture();
        let report = state.preflight("ghost.a").unwrap();
        assert!(!report.ok);
        assert!(matches!(report.error, Some(StateError::UnknownProperty { .. })));
        assert_eq!(report.hops[1].status, HopStatus::Unreachable);
    }

    #[test]
    fn resolve_materializes_terminal_index() {
        let state = fixture();
        let resolved = resolve(&state.rt, state.id, &parse_path("user.tags[1]").unwrap()).unwrap();
        assert_eq!(resolved.kind, AttrKind::Index);
        assert_eq!(resolved.target.peek().unwrap(), Value::from("y"));
        assert_eq!(resolved.intermediates.len(), 2);
    }

    #[test]
    fn lookup_walks_ancestors_and_skips() {
        let parent = State::new(json!({"title": "root"})).unwrap();
        let child = parent.child(json!({"own": 1})).unwrap();
        let found = lookup(&child.rt, child.id, "title", None).unwrap();
        assert_eq!(found, parent.attr("title").unwrap().id);
        assert!(lookup(&child.rt, child.id, "title", Some(found)).is_err());
    }
}
