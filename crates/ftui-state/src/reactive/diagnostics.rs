#![forbid(unsafe_code)]

//! Failures swallowed at the notification boundary.
//!
//! A faulty subscriber must not break delivery to the others, so panics and
//! errors raised while notifying are caught. Each one is logged with
//! `tracing::warn!` and, when a hook is installed with
//! [`Runtime::set_diagnostic_hook`](super::Runtime::set_diagnostic_hook),
//! handed to it as a [`Diagnostic`].

use std::any::Any;
use std::fmt;

use crate::error::StateError;

#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// A subscriber callback panicked; delivery continued.
    SubscriberPanicked { source: String, message: String },
    /// A derived attribute failed to recompute and kept its previous value.
    ComputeFailed { key: String, error: StateError },
    /// The value of a notifying attribute could not be read for delivery.
    DeliveryFailed { key: String, error: StateError },
    /// A path subscription could not be re-resolved after a link changed.
    RewireFailed { key: String, error: StateError },
    /// Re-entrant delivery exceeded the configured depth and was cut off.
    NotifyOverrun { key: String, depth: usize },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SubscriberPanicked { source, message } => {
                write!(f, "subscriber of '{source}' panicked: {message}")
            }
            Self::ComputeFailed { key, error } => write!(f, "recompute of '{key}' failed: {error}"),
            Self::DeliveryFailed { key, error } => write!(f, "delivery of '{key}' failed: {error}"),
            Self::RewireFailed { key, error } => write!(f, "rewire of '{key}' failed: {error}"),
            Self::NotifyOverrun { key, depth } => {
                write!(f, "notification of '{key}' exceeded depth {depth}")
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
