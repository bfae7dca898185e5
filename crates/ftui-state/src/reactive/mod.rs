#![forbid(unsafe_code)]

//! Dependency collection and notification scheduling.
//!
//! This module provides the machinery every attribute shares:
//!
//! - [`Runtime`]: owns the node arena, the collector stack used for
//!   automatic dependency discovery, and the batch queue.
//! - [`Subscription`]: RAII guard that removes a callback on drop.
//! - [`SubscribeOptions`]: immediate delivery plus debounce/throttle pacing.
//! - [`Clock`] / [`ManualClock`]: time source for paced deliveries.
//! - [`Diagnostic`]: failures that are swallowed at the notification
//!   boundary but surfaced through an optional hook.
//!
//! # Architecture
//!
//! The runtime is single-threaded and shared through `Rc`. Attribute reads
//! report themselves to the top collector frame; writes enqueue the
//! attribute, which either delivers immediately or, inside a batch, is
//! de-duplicated and delivered once when the outermost batch exits.
//!
//! # Invariants
//!
//! 1. A read registers with the innermost collector only.
//! 2. Outside a batch, delivery is synchronous and re-entrant.
//! 3. Inside a batch, each attribute is delivered at most once per flush,
//!    in first-enqueue order, carrying its value at flush time.
//! 4. A panicking subscriber never prevents delivery to the others.

pub mod clock;
pub mod diagnostics;
pub mod runtime;
pub mod subscription;
pub(crate) mod timers;

pub use clock::{Clock, ManualClock};
pub use diagnostics::Diagnostic;
pub use runtime::{Runtime, RuntimeConfig};
pub use subscription::{SubscribeOptions, Subscription};
