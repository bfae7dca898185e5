#![no_main]

use arbitrary::Arbitrary;
use ftui_state::{Attribute, State, SubscribeOptions, Value};
use libfuzzer_sys::fuzz_target;
use serde_json::json;

#[derive(Arbitrary, Debug)]
enum Step {
    Get(String),
    Set(String, i8),
    Preflight(String),
    Subscribe(String),
    ReplaceUser(bool),
}

fuzz_target!(|steps: Vec<Step>| {
    let state = State::builder(json!({
        "user": {"name": "Ada", "tags": ["a", "b"]},
        "items": [{"title": "x"}, 1],
        "flag": true
    }))
    .map("lookup", [("home", json!({"city": "Paris"}))])
    .build()
    .expect("fixture");

    let mut subs = Vec::new();
    for step in steps.into_iter().take(64) {
        match step {
            Step::Get(path) => {
                let _ = state.get(&path);
            }
            Step::Set(path, v) => {
                let _ = state.set(&path, Value::from(i64::from(v)));
            }
            Step::Preflight(path) => {
                if let Ok(report) = state.preflight(&path) {
                    assert_eq!(report.ok, report.error.is_none());
                }
            }
            Step::Subscribe(path) => {
                if let Ok(sub) = state.on(&path, |_| {}, SubscribeOptions::deferred()) {
                    subs.push(sub);
                }
            }
            Step::ReplaceUser(null) => {
                let next = if null { json!(null) } else { json!({"name": "Grace"}) };
                let _ = state.attr("user").and_then(|a| a.set(next));
            }
        }
    }
    drop(subs);
    state.dispose();
    assert_eq!(state.runtime().node_counts(), (0, 0));
});
