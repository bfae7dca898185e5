#![forbid(unsafe_code)]

//! Reactive state containers for FrankenTUI.
//!
//! `ftui-state` holds application state as a tree of observable attributes:
//!
//! - [`State`]: a container built from a JSON-like object. Nested objects
//!   become nested containers, arrays become [`List`]s, and maps declared
//!   on the builder become [`Map`]s.
//! - Derived attributes recompute lazily from whatever they read; their
//!   dependencies are discovered automatically by the [`Runtime`].
//! - Alias attributes (`"{user.name |> upper()}"`) forward reads and writes
//!   to another path through named [`Transform`]s.
//! - Path subscriptions (`state.on("user.address.city", ..)`) survive
//!   replacement of any intermediate object.
//! - An optional [`Schema`] plus per-key validators feed a validation
//!   channel aggregated across the container hierarchy.
//!
//! # Example
//!
//! ```
//! use ftui_state::{State, SubscribeOptions, Value};
//! use serde_json::json;
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let state = State::builder(json!({"first": "Ada", "last": "Lovelace"}))
//!     .computed("full", |s| {
//!         Ok(Value::from(format!(
//!             "{} {}",
//!             s.get_as::<String>("first")?,
//!             s.get_as::<String>("last")?
//!         )))
//!     })
//!     .build()
//!     .unwrap();
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let log = Rc::clone(&seen);
//! let _sub = state
//!     .on("full", move |v| log.borrow_mut().push(v.to_string()), SubscribeOptions::deferred())
//!     .unwrap();
//!
//! state.set("first", "Augusta").unwrap();
//! assert_eq!(*seen.borrow(), vec!["Augusta Lovelace".to_string()]);
//! ```
//!
//! # Threading
//!
//! Everything is single-threaded: handles are `!Send` and share their
//! runtime through `Rc`. Use one runtime per UI thread.

pub mod attribute;
pub mod error;
pub mod expr;
pub mod path;
pub mod reactive;
pub mod registry;
pub mod state;
pub mod value;

pub use attribute::{Attr, AttrKind, Attribute, List, Map};
pub use error::{PathSyntaxError, Result, StateError};
pub use expr::{AliasMatcher, AliasTarget, TransformCall};
pub use path::{Hop, HopStatus, ParsedPath, Preflight, ResolvedPath, Token, parse_path};
pub use reactive::{
    Clock, Diagnostic, ManualClock, Runtime, RuntimeConfig, SubscribeOptions, Subscription,
};
pub use registry::{Registry, Transform};
pub use state::accessor::Accessor;
pub use state::build::StateBuilder;
pub use state::schema::{Normalized, Schema, SchemaIssue, ShapeSchema};
pub use state::{ErrorMap, State, Tracked, ValidationEvent, ValidationMode};
pub use value::{FromValue, Plain, Value};
