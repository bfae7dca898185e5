#![forbid(unsafe_code)]

//! Typed handles on a single key.

use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use super::State;
use crate::attribute::{self, Attr, AttrId};
use crate::error::{Result, StateError};
use crate::reactive::subscription::{SubscribeOptions, Subscription};
use crate::value::{FromValue, Value};

/// A key of a container read and written as `T`.
///
/// The accessor binds to the attribute the key resolves to when it is
/// created, so inherited keys keep pointing at the ancestor's attribute.
///
/// ```
/// use ftui_state::State;
/// use serde_json::json;
///
/// let state = State::new(json!({"count": 1})).unwrap();
/// let count = state.accessor::<f64>("count").unwrap();
/// count.set(count.get().unwrap() + 1.0).unwrap();
/// assert_eq!(count.get().unwrap(), 2.0);
/// ```
pub struct Accessor<T> {
    state: State,
    id: AttrId,
    key: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: FromValue> Accessor<T> {
    pub(crate) fn new(state: &State, key: &str) -> Result<Self> {
        let id = state.attr(key)?.id;
        Ok(Self {
            state: state.clone(),
            id,
            key: key.to_string(),
            _marker: PhantomData,
        })
    }

    fn convert(&self, value: &Value) -> Result<T> {
        T::from_value(value).ok_or_else(|| StateError::TypeMismatch {
            key: self.key.clone(),
            expected: T::EXPECTED,
        })
    }

    /// Tracked read.
    pub fn get(&self) -> Result<T> {
        let value = attribute::read(&self.state.rt, self.id)?;
        self.convert(&value)
    }

    pub fn set(&self, value: impl Into<Value>) -> Result<()> {
        attribute::set(&self.state.rt, self.id, value.into())
    }

    /// Subscribe with values converted to `T`. Values that do not convert
    /// are skipped.
    pub fn subscribe(
        &self,
        callback: impl Fn(T) + 'static,
        options: SubscribeOptions,
    ) -> Result<Subscription>
    where
        T: 'static,
    {
        let callback = move |value: &Value| {
            if let Some(typed) = T::from_value(value) {
                callback(typed);
            }
        };
        attribute::subscribe(&self.state.rt, self.id, Rc::new(callback), options)
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn attr(&self) -> Attr {
        Attr::from_parts(Rc::clone(&self.state.rt), self.id)
    }
}

impl<T> Clone for Accessor<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            id: self.id,
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Accessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessor")
            .field("key", &self.key)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::{State, StateError, SubscribeOptions};
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn mismatched_values_error_on_get() {
        let state = State::new(json!({"name": "Ada"})).unwrap();
        let acc = state.accessor::<bool>("name").unwrap();
        assert_eq!(
            acc.get(),
            Err(StateError::TypeMismatch {
                key: "name".into(),
                expected: "a boolean"
            })
        );
    }

    #[test]
    fn inherited_keys_bind_to_the_ancestor() {
        let parent = State::new(json!({"title": "root"})).unwrap();
        let child = parent.child(json!({})).unwrap();
        let title = child.accessor::<String>("title").unwrap();
        title.set("renamed").unwrap();
        assert_eq!(parent.get_as::<String>("title").unwrap(), "renamed");
    }

    #[test]
    fn typed_subscription_skips_foreign_values() {
        let state = State::new(json!({"n": 1})).unwrap();
        let acc = state.accessor::<f64>("n").unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        let _sub = acc
            .subscribe(move |n| s.borrow_mut().push(n), SubscribeOptions::deferred())
            .unwrap();
        state.set("n", "x").unwrap();
        state.set("n", 4).unwrap();
        assert_eq!(*seen.borrow(), vec![4.0]);
    }
}
