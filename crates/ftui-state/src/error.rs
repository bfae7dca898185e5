//! Error taxonomy for the state engine.
//!
//! Only structural failures are represented here. Validation problems are
//! reported through the validation channel (see [`crate::state`]) and
//! subscriber failures through [`crate::reactive::Diagnostic`]; neither
//! surfaces as an `Err` unless [`crate::ValidationMode::Reject`] is active.

use indexmap::IndexMap;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StateError>;

/// Malformed path expression. `offset` is the byte position of the problem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid path '{path}' at byte {offset}: {message}")]
pub struct PathSyntaxError {
    pub path: String,
    pub offset: usize,
    pub message: String,
}

impl PathSyntaxError {
    #[must_use]
    pub fn new(path: &str, offset: usize, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            offset,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    #[error("'{key}' not found in schema")]
    UnknownProperty { key: String },

    #[error("attribute '{key}' is read-only")]
    ReadOnly { key: String },

    #[error(transparent)]
    Syntax(#[from] PathSyntaxError),

    #[error("cannot resolve '{path}' at segment '{segment}': {reason}")]
    Unresolvable {
        path: String,
        segment: String,
        reason: String,
    },

    #[error("alias '{key}' refers to itself")]
    SelfAlias { key: String },

    #[error("unrecognized alias expression '{expr}'")]
    AliasExpression { expr: String },

    #[error("unknown transform '{name}'")]
    UnknownTransform { name: String },

    #[error("transform '{name}' failed: {message}")]
    Transform { name: String, message: String },

    #[error("computed '{key}' failed: {message}")]
    Compute { key: String, message: String },

    #[error("computed '{key}' depends on itself")]
    Cycle { key: String },

    #[error("index {index} out of bounds (length {len})")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("'{key}' expected {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    #[error("initial value must be an object")]
    NotAnObject,

    #[error("handle refers to a disposed node")]
    Disposed,

    #[error("handle belongs to a different runtime")]
    ForeignRuntime,

    #[error("validation failed for '{key}': {errors:?}")]
    Validation {
        key: String,
        errors: IndexMap<String, Vec<String>>,
    },
}

impl StateError {
    #[must_use]
    pub fn unknown(key: impl Into<String>) -> Self {
        Self::UnknownProperty { key: key.into() }
    }

    #[must_use]
    pub fn read_only(key: impl Into<String>) -> Self {
        Self::ReadOnly { key: key.into() }
    }

    #[must_use]
    pub fn unresolvable(
        path: impl Into<String>,
        segment: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Unresolvable {
            path: path.into(),
            segment: segment.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error is a structural failure that should never be retried.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        !matches!(self, Self::Validation { .. } | Self::Compute { .. })
    }
}
