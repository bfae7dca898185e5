#![forbid(unsafe_code)]

//! Pluggable value schemas.
//!
//! A container holds an optional [`Schema`] handle mirroring the shape of
//! its value: `field(key)` descends into an object shape and `items()` into
//! a list (or map) element shape. On every write the container asks the
//! field's schema to [`normalize`](Schema::normalize) the incoming value and
//! records the reported issues against the written key.
//!
//! Structured objects are not normalized at the write site. They become
//! nested containers which validate their own fields with the field's
//! schema, so each error lives in the container that stores the value.
//!
//! [`ShapeSchema`] is the built-in implementation. Anything else (a JSON
//! schema engine, hand-written rules) plugs in through the trait.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::value::Plain;

/// One problem found while normalizing. `path` is relative to the checked
/// value: empty for the value itself, `.name` or `[3]` below it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SchemaIssue {
    pub path: String,
    pub message: String,
}

impl SchemaIssue {
    #[must_use]
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }

    fn under(mut self, prefix: &str) -> Self {
        self.path = format!("{prefix}{}", self.path);
        self
    }
}

/// Normalization result. `value` is what gets stored; it equals the input
/// when nothing could be coerced.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub value: Plain,
    pub issues: Vec<SchemaIssue>,
}

impl Normalized {
    #[must_use]
    pub fn ok(value: Plain) -> Self {
        Self {
            value,
            issues: Vec::new(),
        }
    }

    #[must_use]
    pub fn invalid(value: Plain, message: impl Into<String>) -> Self {
        Self {
            value,
            issues: vec![SchemaIssue::new("", message)],
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Validator mirroring the shape of a container's value.
pub trait Schema {
    /// Coerce `value` where possible and report what does not conform.
    fn normalize(&self, value: &Plain) -> Normalized;

    /// Schema for the object field `key`.
    fn field(&self, _key: &str) -> Option<Rc<dyn Schema>> {
        None
    }

    /// Schema for list elements and map values.
    fn items(&self) -> Option<Rc<dyn Schema>> {
        None
    }
}

// ---------------------------------------------------------------------------
// Built-in shapes
// ---------------------------------------------------------------------------

/// Declarative schema for the common value shapes.
///
/// ```
/// use ftui_state::ShapeSchema;
///
/// let schema = ShapeSchema::object([
///     ("name", ShapeSchema::text().min_len(1).trimmed()),
///     ("age", ShapeSchema::number().min(0.0).coerce()),
///     ("tags", ShapeSchema::array(ShapeSchema::text())),
/// ]);
/// # let _ = schema;
/// ```
#[derive(Clone, PartialEq)]
pub enum ShapeSchema {
    Any,
    Bool,
    Number {
        min: Option<f64>,
        max: Option<f64>,
        /// Accept numeric strings such as `"42"`.
        coerce: bool,
    },
    Text {
        min_len: Option<usize>,
        max_len: Option<usize>,
        trim: bool,
    },
    Object(IndexMap<String, Rc<ShapeSchema>>),
    Array(Rc<ShapeSchema>),
    /// Null is accepted; anything else must match the inner shape.
    Optional(Rc<ShapeSchema>),
}

impl ShapeSchema {
    #[must_use]
    pub fn number() -> Self {
        Self::Number {
            min: None,
            max: None,
            coerce: false,
        }
    }

    #[must_use]
    pub fn text() -> Self {
        Self::Text {
            min_len: None,
            max_len: None,
            trim: false,
        }
    }

    #[must_use]
    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, ShapeSchema)>) -> Self {
        Self::Object(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), Rc::new(v)))
                .collect(),
        )
    }

    #[must_use]
    pub fn array(item: ShapeSchema) -> Self {
        Self::Array(Rc::new(item))
    }

    #[must_use]
    pub fn optional(self) -> Self {
        Self::Optional(Rc::new(self))
    }

    /// Lower bound for numbers. No effect on other shapes.
    #[must_use]
    pub fn min(mut self, bound: f64) -> Self {
        if let Self::Number { min, .. } = &mut self {
            *min = Some(bound);
        }
        self
    }

    #[must_use]
    pub fn max(mut self, bound: f64) -> Self {
        if let Self::Number { max, .. } = &mut self {
            *max = Some(bound);
        }
        self
    }

    #[must_use]
    pub fn coerce(mut self) -> Self {
        if let Self::Number { coerce, .. } = &mut self {
            *coerce = true;
        }
        self
    }

    #[must_use]
    pub fn min_len(mut self, bound: usize) -> Self {
        if let Self::Text { min_len, .. } = &mut self {
            *min_len = Some(bound);
        }
        self
    }

    #[must_use]
    pub fn max_len(mut self, bound: usize) -> Self {
        if let Self::Text { max_len, .. } = &mut self {
            *max_len = Some(bound);
        }
        self
    }

    #[must_use]
    pub fn trimmed(mut self) -> Self {
        if let Self::Text { trim, .. } = &mut self {
            *trim = true;
        }
        self
    }

    fn number_of(value: &Plain, coerce: bool) -> Option<f64> {
        match value {
            Plain::Number(n) => Some(*n),
            Plain::String(s) if coerce => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            _ => None,
        }
    }
}

fn describe(value: &Plain) -> &'static str {
    match value {
        Plain::Null => "null",
        Plain::Bool(_) => "a boolean",
        Plain::Number(_) => "a number",
        Plain::String(_) => "a string",
        Plain::List(_) => "a list",
        Plain::Object(_) | Plain::Map(_) => "an object",
    }
}

fn mismatch(value: &Plain, expected: &str) -> Normalized {
    if value.is_null() {
        Normalized::invalid(Plain::Null, "is required")
    } else {
        Normalized::invalid(
            value.clone(),
            format!("expected {expected}, got {}", describe(value)),
        )
    }
}

impl Schema for ShapeSchema {
    fn normalize(&self, value: &Plain) -> Normalized {
        match self {
            Self::Any => Normalized::ok(value.clone()),
            Self::Optional(inner) => {
                if value.is_null() {
                    Normalized::ok(Plain::Null)
                } else {
                    inner.normalize(value)
                }
            }
            Self::Bool => match value {
                Plain::Bool(_) => Normalized::ok(value.clone()),
                other => mismatch(other, "a boolean"),
            },
            Self::Number { min, max, coerce } => {
                let Some(n) = Self::number_of(value, *coerce) else {
                    return mismatch(value, "a number");
                };
                let normalized = Plain::Number(n);
                match (min, max) {
                    (Some(lo), _) if n < *lo => {
                        Normalized::invalid(normalized, format!("must be at least {}", Plain::Number(*lo)))
                    }
                    (_, Some(hi)) if n > *hi => {
                        Normalized::invalid(normalized, format!("must be at most {}", Plain::Number(*hi)))
                    }
                    _ => Normalized::ok(normalized),
                }
            }
            Self::Text {
                min_len,
                max_len,
                trim,
            } => {
                let Plain::String(s) = value else {
                    return mismatch(value, "a string");
                };
                let s = if *trim { s.trim() } else { s.as_str() };
                let len = s.chars().count();
                let normalized = Plain::String(s.to_string());
                match (min_len, max_len) {
                    (Some(lo), _) if len < *lo => Normalized::invalid(
                        normalized,
                        format!("must be at least {lo} characters"),
                    ),
                    (_, Some(hi)) if len > *hi => Normalized::invalid(
                        normalized,
                        format!("must be at most {hi} characters"),
                    ),
                    _ => Normalized::ok(normalized),
                }
            }
            Self::Object(shape) => {
                let (Plain::Object(fields) | Plain::Map(fields)) = value else {
                    return mismatch(value, "an object");
                };
                let mut out = fields.clone();
                let mut issues = Vec::new();
                for (key, schema) in shape {
                    let current = fields.get(key).cloned().unwrap_or_default();
                    let result = schema.normalize(&current);
                    issues.extend(result.issues.into_iter().map(|i| i.under(&format!(".{key}"))));
                    if fields.contains_key(key) || !result.value.is_null() {
                        out.insert(key.clone(), result.value);
                    }
                }
                let value = match value {
                    Plain::Map(_) => Plain::Map(out),
                    _ => Plain::Object(out),
                };
                Normalized { value, issues }
            }
            Self::Array(item) => {
                let Plain::List(items) = value else {
                    return mismatch(value, "a list");
                };
                let mut out = Vec::with_capacity(items.len());
                let mut issues = Vec::new();
                for (i, element) in items.iter().enumerate() {
                    let result = item.normalize(element);
                    issues.extend(result.issues.into_iter().map(|issue| issue.under(&format!("[{i}]"))));
                    out.push(result.value);
                }
                Normalized {
                    value: Plain::List(out),
                    issues,
                }
            }
        }
    }

    fn field(&self, key: &str) -> Option<Rc<dyn Schema>> {
        match self {
            Self::Object(fields) => fields.get(key).map(|s| Rc::clone(s) as Rc<dyn Schema>),
            Self::Optional(inner) => inner.field(key),
            _ => None,
        }
    }

    fn items(&self) -> Option<Rc<dyn Schema>> {
        match self {
            Self::Array(item) => Some(Rc::clone(item) as Rc<dyn Schema>),
            Self::Optional(inner) => inner.items(),
            _ => None,
        }
    }
}

impl fmt::Debug for ShapeSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("Any"),
            Self::Bool => f.write_str("Bool"),
            Self::Number { min, max, coerce } => f
                .debug_struct("Number")
                .field("min", min)
                .field("max", max)
                .field("coerce", coerce)
                .finish(),
            Self::Text {
                min_len,
                max_len,
                trim,
            } => f
                .debug_struct("Text")
                .field("min_len", min_len)
                .field("max_len", max_len)
                .field("trim", trim)
                .finish(),
            Self::Object(fields) => f.debug_map().entries(fields.iter()).finish(),
            Self::Array(item) => f.debug_tuple("Array").field(item).finish(),
            Self::Optional(inner) => f.debug_tuple("Optional").field(inner).finish(),
        }
    }
}
