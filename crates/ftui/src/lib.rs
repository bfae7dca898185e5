#![forbid(unsafe_code)]

//! FrankenTUI public facade crate.
//!
//! This crate provides the stable, ergonomic surface area for users.
//!
//! ```
//! use ftui::prelude::*;
//! use serde_json::json;
//!
//! let state = State::new(json!({"count": 0})).unwrap();
//! state.set("count", 1).unwrap();
//! assert_eq!(state.get_as::<f64>("count").unwrap(), 1.0);
//! ```

pub use ftui_state as state;

pub mod prelude {
    pub use ftui_state as state;
    pub use ftui_state::{
        Accessor, Attr, AttrKind, Attribute, Diagnostic, List, Map, Plain, Registry, Runtime,
        RuntimeConfig, Schema, ShapeSchema, State, StateError, SubscribeOptions, Subscription,
        Transform, ValidationEvent, ValidationMode, Value,
    };
}
