//! End-to-end behaviour of the reactive state engine.
//!
//! Each test drives the public API only:
//!
//! 1. Derived values track exactly what they read.
//! 2. Batches coalesce notifications per attribute.
//! 3. Aliases forward reads and writes, with transforms looked up lazily.
//! 4. Path subscriptions rewire on wholesale replacement.
//! 5. Inherited keys read and write through to the declaring ancestor.
//! 6. Collection elements notify on structural change.
//! 7. Equal writes are silent; map views emit only when they change.
//! 8. Derived chains settle at any length, batched or not.
//! 9. Repeated element and path lookups reuse one node.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use ftui_state::{
    Attribute, Diagnostic, List, Map, Registry, Runtime, RuntimeConfig, State, StateError,
    SubscribeOptions, Transform, Value,
};
use serde_json::json;

// ── Helpers ─────────────────────────────────────────────────────────────

type Log = Rc<RefCell<Vec<Value>>>;

fn recorder() -> (Log, impl Fn(&Value) + 'static) {
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    (log, move |v: &Value| sink.borrow_mut().push(v.clone()))
}

fn values(log: &Log) -> Vec<Value> {
    log.borrow().clone()
}

fn sum_state() -> State {
    State::builder(json!({"a": 1, "b": 2, "other": 0}))
        .computed("sum", |s| {
            Ok(Value::from(s.get_as::<f64>("a")? + s.get_as::<f64>("b")?))
        })
        .build()
        .unwrap()
}

// ═════════════════════════════════════════════════════════════════════════
// 1. Dependency auto-tracking
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn derived_follows_each_dependency() {
    let state = sum_state();
    let (log, cb) = recorder();
    let _sub = state.on("sum", cb, SubscribeOptions::deferred()).unwrap();

    state.set("a", 10).unwrap();
    state.set("b", 5).unwrap();
    state.set("other", 99).unwrap();

    assert_eq!(values(&log), vec![Value::from(12), Value::from(15)]);
}

#[test]
fn immediate_subscription_sees_current_value() {
    let state = sum_state();
    let (log, cb) = recorder();
    let _sub = state.on("sum", cb, SubscribeOptions::default()).unwrap();
    assert_eq!(values(&log), vec![Value::from(3)]);
}

// ═════════════════════════════════════════════════════════════════════════
// 2. Batch coalescing
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn batch_delivers_final_value_once() {
    let state = sum_state();
    let (log, cb) = recorder();
    let _sub = state.on("sum", cb, SubscribeOptions::deferred()).unwrap();

    state.batch(|| {
        state.set("a", 10).unwrap();
        state.set("b", 20).unwrap();
        state.set("a", 30).unwrap();
    });

    assert_eq!(values(&log), vec![Value::from(50)]);
}

#[test]
fn nested_batches_flush_at_outermost_exit() {
    let state = sum_state();
    let (log, cb) = recorder();
    let _sub = state.on("a", cb, SubscribeOptions::deferred()).unwrap();
    let rt = state.runtime();

    rt.batch(|| {
        rt.batch(|| state.set("a", 2).unwrap());
        assert!(values(&log).is_empty());
        state.set("a", 3).unwrap();
    });

    assert_eq!(values(&log), vec![Value::from(3)]);
}

// ═════════════════════════════════════════════════════════════════════════
// 3. Aliases
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn alias_transform_registered_after_construction() {
    let registry = Registry::new();
    let state = State::builder(json!({"raw": "Ada", "up": "{raw |> shout()}"}))
        .registry(registry.clone())
        .build()
        .unwrap();

    registry.register_transform(
        "shout",
        Transform::new(|v, _| Ok(Value::from(format!("{}!", v.as_str().unwrap_or_default())))),
    );

    assert_eq!(state.get("up").unwrap(), Value::from("Ada!"));
    assert!(matches!(
        state.set("up", "x"),
        Err(StateError::ReadOnly { .. })
    ));
}

#[test]
fn negated_alias_writes_back() {
    let state = State::new(json!({"done": false, "open": "{!done}"})).unwrap();
    assert_eq!(state.get("open").unwrap(), Value::from(true));
    state.set("open", false).unwrap();
    assert_eq!(state.get("done").unwrap(), Value::from(true));
}

#[test]
fn alias_subscribers_see_target_changes() {
    let state = State::new(json!({"name": "Ada", "label": "{name |> upper()}"})).unwrap();
    let (log, cb) = recorder();
    let _sub = state.on("label", cb, SubscribeOptions::deferred()).unwrap();
    state.set("name", "Grace").unwrap();
    assert_eq!(values(&log), vec![Value::from("GRACE")]);
}

// ═════════════════════════════════════════════════════════════════════════
// 4. Path rewiring
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn path_subscription_survives_replacement() {
    let state = State::new(json!({"user": {"address": {"city": "Rome"}}})).unwrap();
    let (log, cb) = recorder();
    let _sub = state
        .on("user.address.city", cb, SubscribeOptions::deferred())
        .unwrap();

    state.set("user.address.city", "Milan").unwrap();
    state.set("user", json!({"address": {"city": "Paris"}})).unwrap();
    state.set("user.address", json!({"city": "Berlin"})).unwrap();

    assert_eq!(
        values(&log),
        vec![Value::from("Milan"), Value::from("Paris"), Value::from("Berlin")]
    );
}

#[test]
fn old_intermediates_no_longer_notify() {
    let state = State::new(json!({"user": {"name": "Ada"}})).unwrap();
    let old = state.get_as::<State>("user").unwrap();
    let (log, cb) = recorder();
    let _sub = state.on("user.name", cb, SubscribeOptions::deferred()).unwrap();

    state.set("user", json!({"name": "Grace"})).unwrap();
    assert!(!old.is_alive());
    assert_eq!(values(&log), vec![Value::from("Grace")]);
}

#[test]
fn malformed_paths_are_syntax_errors() {
    let state = State::new(json!({"a": 1})).unwrap();
    for path in ["a[", "a[x]", "a[\"k]", "a..b", "a b", ""] {
        assert!(
            matches!(state.get(path), Err(StateError::Syntax(_))),
            "{path}"
        );
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 5. Inheritance forwarding
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn inherited_writes_land_on_the_ancestor() {
    let parent = State::new(json!({"name": "Ada"})).unwrap();
    let child = parent.child(json!({})).unwrap();

    child.set("name", "Alan").unwrap();

    assert_eq!(child.get("name").unwrap(), Value::from("Alan"));
    assert_eq!(parent.get("name").unwrap(), Value::from("Alan"));
}

#[test]
fn local_declarations_shadow_the_ancestor() {
    let parent = State::new(json!({"name": "Ada"})).unwrap();
    let child = parent.child(json!({"name": "Ada"})).unwrap();

    child.set("name", "Alan").unwrap();

    assert_eq!(child.get("name").unwrap(), Value::from("Alan"));
    assert_eq!(parent.get("name").unwrap(), Value::from("Ada"));
}

#[test]
fn undeclared_everywhere_fails() {
    let parent = State::new(json!({"name": "Ada"})).unwrap();
    let child = parent.child(json!({})).unwrap();
    assert!(matches!(
        child.set("nick", "x"),
        Err(StateError::UnknownProperty { .. })
    ));
}

// ═════════════════════════════════════════════════════════════════════════
// 6. Collection structural notification
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn element_replacement_reaches_index_and_path() {
    let state = State::new(json!({"items": [{"title": "a"}, {"title": "b"}]})).unwrap();
    let list = state.get_as::<List>("items").unwrap();

    let (index_log, index_cb) = recorder();
    let _index_sub = list
        .get_attr(0)
        .unwrap()
        .subscribe(index_cb, SubscribeOptions::deferred())
        .unwrap();
    let (path_log, path_cb) = recorder();
    let _path_sub = state
        .on("items[0].title", path_cb, SubscribeOptions::deferred())
        .unwrap();

    list.set(0, json!({"title": "z"})).unwrap();

    assert_eq!(index_log.borrow().len(), 1);
    assert_eq!(values(&path_log), vec![Value::from("z")]);
}

#[test]
fn every_list_mutation_notifies_once() {
    let state = State::new(json!({"items": [3, 1, 2]})).unwrap();
    let list = state.get_as::<List>("items").unwrap();
    let (log, cb) = recorder();
    let _sub = list.attr().subscribe(cb, SubscribeOptions::deferred()).unwrap();

    list.push(4).unwrap();
    list.sort_by(|a, b| a.as_f64().partial_cmp(&b.as_f64()).unwrap()).unwrap();
    list.splice(1, 2, [Value::from(9)]).unwrap();
    list.move_item(0, 2).unwrap();

    assert_eq!(log.borrow().len(), 4);
    assert_eq!(
        list.to_plain().to_json(),
        json!([9, 4, 1])
    );
}

// ═════════════════════════════════════════════════════════════════════════
// 7. Idempotence
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn equal_writes_are_silent() {
    let state = State::new(json!({"a": 1, "o": {"x": 1}})).unwrap();
    let (log, cb) = recorder();
    let _sub = state.on("a", cb, SubscribeOptions::deferred()).unwrap();
    state.set("a", 1).unwrap();
    state.set("a", 1.0).unwrap();
    assert!(values(&log).is_empty());
}

#[test]
fn map_views_emit_only_when_they_change() {
    let state = State::builder(json!({}))
        .map("tags", [("a", json!(1)), ("b", json!(2))])
        .build()
        .unwrap();
    let map = state.get_as::<Map>("tags").unwrap();

    let (map_log, map_cb) = recorder();
    let _map_sub = map.attr().subscribe(map_cb, SubscribeOptions::deferred()).unwrap();
    let (size_log, size_cb) = recorder();
    let _size_sub = map
        .size_attr()
        .unwrap()
        .subscribe(size_cb, SubscribeOptions::deferred())
        .unwrap();
    let (keys_log, keys_cb) = recorder();
    let _keys_sub = map
        .keys_attr()
        .unwrap()
        .subscribe(keys_cb, SubscribeOptions::deferred())
        .unwrap();

    map.set("a", 10).unwrap();
    map.set("a", 10).unwrap();
    assert_eq!(map_log.borrow().len(), 1);
    assert!(values(&size_log).is_empty());
    assert!(values(&keys_log).is_empty());

    map.set("c", 3).unwrap();
    assert_eq!(map_log.borrow().len(), 2);
    assert_eq!(values(&size_log), vec![Value::from(3)]);
    assert_eq!(keys_log.borrow().len(), 1);
}

// ═════════════════════════════════════════════════════════════════════════
// Subscriber failures
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn panicking_subscriber_does_not_starve_others() {
    let state = sum_state();
    let reports = Rc::new(RefCell::new(0));
    let r = Rc::clone(&reports);
    state.runtime().set_diagnostic_hook(move |_| *r.borrow_mut() += 1);

    let _bad = state
        .on("a", |_| panic!("listener bug"), SubscribeOptions::deferred())
        .unwrap();
    let (log, cb) = recorder();
    let _good = state.on("a", cb, SubscribeOptions::deferred()).unwrap();

    state.set("a", 7).unwrap();

    assert_eq!(values(&log), vec![Value::from(7)]);
    assert_eq!(*reports.borrow(), 1);
}

#[test]
fn unsubscribe_stops_delivery() {
    let state = sum_state();
    let (log, cb) = recorder();
    let sub = state.on("a", cb, SubscribeOptions::deferred()).unwrap();
    assert!(sub.is_active());
    sub.unsubscribe();
    state.set("a", 5).unwrap();
    assert!(values(&log).is_empty());
}

// ═════════════════════════════════════════════════════════════════════════
// 8. Long derived chains
// ═════════════════════════════════════════════════════════════════════════

/// `d1 = a + 1`, `d2 = d1 + 1`, ... `d{levels}`.
fn chain(levels: usize, runtime: &Runtime) -> State {
    let mut builder = State::builder(json!({"a": 0})).runtime(runtime);
    for level in 1..=levels {
        let below = if level == 1 {
            "a".to_string()
        } else {
            format!("d{}", level - 1)
        };
        builder = builder.computed(format!("d{level}"), move |s| {
            Ok(Value::from(s.get_as::<f64>(&below)? + 1.0))
        });
    }
    let state = builder.build().unwrap();
    // Initialize bottom-up so no single read recurses through every level.
    for level in 1..=levels {
        state.get(&format!("d{level}")).unwrap();
    }
    state
}

fn overrun_counter(runtime: &Runtime) -> Rc<Cell<usize>> {
    let overruns = Rc::new(Cell::new(0));
    let sink = Rc::clone(&overruns);
    runtime.set_diagnostic_hook(move |d| {
        if matches!(d, Diagnostic::NotifyOverrun { .. }) {
            sink.set(sink.get() + 1);
        }
    });
    overruns
}

#[test]
fn forty_level_chain_settles_inside_a_batch() {
    let rt = Runtime::new();
    let overruns = overrun_counter(&rt);
    let state = chain(40, &rt);
    let (log, cb) = recorder();
    let _sub = state.on("d40", cb, SubscribeOptions::deferred()).unwrap();
    assert_eq!(state.get("d40").unwrap(), Value::from(40));

    rt.batch(|| state.set("a", 100).unwrap());

    assert_eq!(state.get("d40").unwrap(), Value::from(140));
    assert_eq!(values(&log), vec![Value::from(140)]);
    assert_eq!(overruns.get(), 0);
}

#[test]
fn seventy_level_chain_settles_without_a_batch() {
    let rt = Runtime::new();
    let overruns = overrun_counter(&rt);
    let state = chain(70, &rt);
    let (log, cb) = recorder();
    let _sub = state.on("d70", cb, SubscribeOptions::deferred()).unwrap();

    state.set("a", 100).unwrap();

    assert_eq!(state.get("d70").unwrap(), Value::from(170));
    assert_eq!(state.get("d35").unwrap(), Value::from(135));
    assert_eq!(values(&log), vec![Value::from(170)]);
    assert_eq!(overruns.get(), 0);
}

#[test]
fn shallow_notify_depth_still_completes_the_chain() {
    let rt = Runtime::with_config(RuntimeConfig::new().max_notify_depth(2));
    let overruns = overrun_counter(&rt);
    let state = chain(12, &rt);
    let (log, cb) = recorder();
    let _sub = state.on("d12", cb, SubscribeOptions::deferred()).unwrap();

    state.set("a", 1).unwrap();
    state.set("a", 2).unwrap();

    assert_eq!(values(&log), vec![Value::from(13), Value::from(14)]);
    assert_eq!(overruns.get(), 0);
}

// ═════════════════════════════════════════════════════════════════════════
// 9. Lookup reuse
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn repeated_lookups_do_not_grow_the_arena() {
    let state = State::builder(json!({"items": [1, 2]}))
        .map("tags", [("k", json!(1))])
        .build()
        .unwrap();
    let rt = state.runtime();
    let list = state.get_as::<List>("items").unwrap();
    let map = state.get_as::<Map>("tags").unwrap();

    let by_path = state.attr("items[0]").unwrap();
    let by_index = list.get_attr(1).unwrap();
    let by_key = map.key_attr("k").unwrap();
    let watched = state.path("items[1]").unwrap();
    let settled = rt.node_counts();

    for _ in 0..1000 {
        assert_eq!(state.attr("items[0]").unwrap(), by_path);
        assert_eq!(list.get_attr(1).unwrap(), by_index);
        assert_eq!(map.key_attr("k").unwrap(), by_key);
        assert_eq!(state.path("items[1]").unwrap(), watched);
    }
    assert_eq!(rt.node_counts(), settled);
    assert_eq!(list.get_attr(0).unwrap(), by_path);
}

#[test]
fn disposed_element_attr_is_replaced_on_next_lookup() {
    let state = State::new(json!({"items": [1, 2]})).unwrap();
    let list = state.get_as::<List>("items").unwrap();
    let first = list.get_attr(1).unwrap();
    first.dispose();

    let again = list.get_attr(1).unwrap();
    assert!(again.is_alive());
    assert_eq!(again.get().unwrap(), Value::from(2));
    assert_eq!(list.get_attr(1).unwrap(), again);
}
